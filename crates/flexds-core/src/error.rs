//! Error types for FlexDS operations.
//!
//! [`FlexdsError`] covers every failure mode in the control plane without
//! panicking, and converts to [`tonic::Status`] for gRPC responses.

/// Result alias used throughout the workspace.
pub type FlexdsResult<T> = Result<T, FlexdsError>;

/// Workspace-wide error type.
///
/// # Example
///
/// ```rust
/// use flexds_core::FlexdsError;
///
/// fn validate_port_list(ports: &[u16]) -> Result<(), FlexdsError> {
///     if ports.is_empty() {
///         return Err(FlexdsError::Configuration(
///             "at least one listener port is required".into(),
///         ));
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum FlexdsError {
    /// Invalid startup configuration. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Protobuf encoding of a built resource failed.
    ///
    /// Aborts the current snapshot build; the previous snapshot stays
    /// current.
    #[error("encoding error for {type_url}: {message}")]
    Encoding {
        /// Type URL of the resource being encoded.
        type_url: String,
        /// Error message.
        message: String,
    },

    /// A discovery source failed to reach or understand its backend.
    #[error("discovery error ({source_id}): {message}")]
    Discovery {
        /// The source that failed (`consul`, `marathon`, `file`).
        source_id: String,
        /// Description of the failure.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A payload from a backend or file could not be parsed.
    #[error("parse error in {context}: {message}")]
    Parse {
        /// What was being parsed.
        context: String,
        /// Error message.
        message: String,
    },

    /// A snapshot watch subscription was closed.
    #[error("watch closed: watch_id={watch_id}")]
    WatchClosed {
        /// ID of the closed watch.
        watch_id: u64,
    },

    /// Filesystem access failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlexdsError {
    /// Create a discovery error from any underlying error type.
    pub fn discovery<E>(source_id: impl Into<String>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Discovery {
            source_id: source_id.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a parse error.
    pub fn parse(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

/// Map each error variant to an appropriate gRPC status code.
impl From<FlexdsError> for tonic::Status {
    fn from(err: FlexdsError) -> Self {
        match &err {
            FlexdsError::Configuration(_) | FlexdsError::Parse { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            }
            FlexdsError::Discovery { .. } => tonic::Status::unavailable(err.to_string()),
            FlexdsError::WatchClosed { .. } => tonic::Status::cancelled(err.to_string()),
            FlexdsError::Encoding { .. } | FlexdsError::Io(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}
