//! The blocking catalog watch loop and its update-coalescing strategies.
//!
//! One loop shape serves all three strategies; only the dispatch decision
//! differs, and that decision lives in the synchronous [`Coalescer`] so the
//! timing laws are testable on a paused clock:
//!
//! - **Immediate**: every observed change dispatches at once.
//! - **Debounce(D)**: a change (re)arms a single timer; the latest service
//!   list dispatches once the catalog has been quiet for D.
//! - **Batch(N, T)**: the Nth change of a window dispatches immediately;
//!   otherwise a window that opened T ago dispatches whatever arrived.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flexds_core::{FlexdsError, FlexdsResult};

use super::client::ConsulClient;

/// Delay before retrying a failed catalog query.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Update-dispatch strategy for the catalog watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    /// Dispatch every observed change.
    Immediate,
    /// Dispatch after the catalog has been quiet for the given interval.
    Debounce(Duration),
    /// Dispatch every `max_changes` changes, or `timeout` after a window
    /// opens, whichever comes first.
    Batch {
        /// Changes that trigger an immediate dispatch.
        max_changes: usize,
        /// Maximum age of an undispatched window.
        timeout: Duration,
    },
}

impl WatcherKind {
    /// Default trailing-quiet interval for [`WatcherKind::Debounce`].
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
    /// Default change count for [`WatcherKind::Batch`].
    pub const DEFAULT_BATCH_SIZE: usize = 5;
    /// Default window timeout for [`WatcherKind::Batch`].
    pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);
}

impl FromStr for WatcherKind {
    type Err = FlexdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(WatcherKind::Immediate),
            "debounce" => Ok(WatcherKind::Debounce(Self::DEFAULT_DEBOUNCE)),
            "batch" => Ok(WatcherKind::Batch {
                max_changes: Self::DEFAULT_BATCH_SIZE,
                timeout: Self::DEFAULT_BATCH_TIMEOUT,
            }),
            other => Err(FlexdsError::Configuration(format!(
                "unknown watcher strategy {other:?}: expected immediate, debounce, or batch"
            ))),
        }
    }
}

impl std::fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherKind::Immediate => f.write_str("immediate"),
            WatcherKind::Debounce(_) => f.write_str("debounce"),
            WatcherKind::Batch { .. } => f.write_str("batch"),
        }
    }
}

/// Dispatch decision state machine shared by the three strategies.
#[derive(Debug)]
pub(crate) struct Coalescer {
    kind: WatcherKind,
    pending: bool,
    changes: usize,
    latest: Vec<String>,
    deadline: Option<Instant>,
}

impl Coalescer {
    pub(crate) fn new(kind: WatcherKind) -> Self {
        Self {
            kind,
            pending: false,
            changes: 0,
            latest: Vec::new(),
            deadline: None,
        }
    }

    /// When the loop should wake to fire, if a window is open.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Record one observed catalog change. Returns a service list when the
    /// strategy wants it dispatched right now.
    pub(crate) fn observe(&mut self, services: Vec<String>) -> Option<Vec<String>> {
        match self.kind {
            WatcherKind::Immediate => Some(services),
            WatcherKind::Debounce(interval) => {
                self.latest = services;
                self.pending = true;
                self.deadline = Some(Instant::now() + interval);
                None
            }
            WatcherKind::Batch {
                max_changes,
                timeout,
            } => {
                self.latest = services;
                self.changes += 1;
                if self.changes >= max_changes {
                    debug!(changes = self.changes, "batch limit reached");
                    self.changes = 0;
                    self.deadline = None;
                    Some(std::mem::take(&mut self.latest))
                } else {
                    if self.changes == 1 {
                        self.deadline = Some(Instant::now() + timeout);
                    }
                    None
                }
            }
        }
    }

    /// The wake deadline expired. Returns the service list to dispatch, if
    /// the open window has anything in it.
    pub(crate) fn fire(&mut self) -> Option<Vec<String>> {
        self.deadline = None;
        match self.kind {
            WatcherKind::Immediate => None,
            WatcherKind::Debounce(_) => {
                if self.pending {
                    self.pending = false;
                    Some(std::mem::take(&mut self.latest))
                } else {
                    None
                }
            }
            WatcherKind::Batch { .. } => {
                if self.changes > 0 {
                    debug!(changes = self.changes, "batch window expired");
                    self.changes = 0;
                    Some(std::mem::take(&mut self.latest))
                } else {
                    None
                }
            }
        }
    }
}

/// Exclude the registry's own meta-service from the candidate list.
fn filter_services(services: Vec<String>) -> Vec<String> {
    services.into_iter().filter(|name| name != "consul").collect()
}

/// The blocking catalog watch loop.
#[derive(Debug)]
pub struct CatalogWatcher {
    client: ConsulClient,
    wait_time: Duration,
    kind: WatcherKind,
}

impl CatalogWatcher {
    /// Create a watcher over the given client.
    pub fn new(client: ConsulClient, wait_time: Duration, kind: WatcherKind) -> Self {
        Self {
            client,
            wait_time,
            kind,
        }
    }

    /// Long-poll the catalog until shutdown, invoking `handler` with the
    /// candidate service names whenever the strategy dispatches.
    ///
    /// The stored index only ever advances: a response index at or below
    /// the current one counts as "no change". Transient query errors sleep
    /// one second and retry at the same index.
    pub async fn watch<F, Fut>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut handler: F,
    ) -> FlexdsResult<()>
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = FlexdsResult<()>>,
    {
        let mut last_index = 0u64;
        let mut coalescer = Coalescer::new(self.kind);

        info!(strategy = %self.kind, "starting catalog watch");

        loop {
            let deadline = coalescer.deadline();
            let wake = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("stopping catalog watch");
                    return Ok(());
                }
                _ = wake => {
                    if let Some(services) = coalescer.fire() {
                        dispatch(&mut handler, services).await;
                    }
                }
                result = self.client.catalog_services(last_index, self.wait_time) => match result {
                    Ok(catalog) => {
                        if catalog.index <= last_index {
                            continue;
                        }
                        debug!(
                            last_index,
                            new_index = catalog.index,
                            "catalog change detected"
                        );
                        last_index = catalog.index;
                        if let Some(services) = coalescer.observe(filter_services(catalog.services)) {
                            dispatch(&mut handler, services).await;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "catalog query failed, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn dispatch<F, Fut>(handler: &mut F, services: Vec<String>)
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = FlexdsResult<()>>,
{
    debug!(count = services.len(), "dispatching service update");
    if let Err(error) = handler(services).await {
        warn!(%error, "service update handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!("immediate".parse::<WatcherKind>().unwrap(), WatcherKind::Immediate);
        assert_eq!(
            "debounce".parse::<WatcherKind>().unwrap(),
            WatcherKind::Debounce(WatcherKind::DEFAULT_DEBOUNCE)
        );
        assert_eq!(
            "batch".parse::<WatcherKind>().unwrap(),
            WatcherKind::Batch {
                max_changes: 5,
                timeout: Duration::from_secs(1)
            }
        );
        assert!("eager".parse::<WatcherKind>().is_err());
    }

    #[test]
    fn meta_service_filtered() {
        let filtered = filter_services(names(&["web", "consul", "api"]));
        assert_eq!(filtered, names(&["web", "api"]));
    }

    #[test]
    fn immediate_dispatches_every_change() {
        let mut coalescer = Coalescer::new(WatcherKind::Immediate);
        assert_eq!(coalescer.observe(names(&["a"])), Some(names(&["a"])));
        assert_eq!(coalescer.observe(names(&["a", "b"])), Some(names(&["a", "b"])));
        assert!(coalescer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_a_burst_into_one_dispatch() {
        let interval = Duration::from_millis(500);
        let mut coalescer = Coalescer::new(WatcherKind::Debounce(interval));
        let start = Instant::now();

        // Changes at t=0, t=100ms, t=200ms.
        assert!(coalescer.observe(names(&["a"])).is_none());
        advance(Duration::from_millis(100)).await;
        assert!(coalescer.observe(names(&["a", "b"])).is_none());
        advance(Duration::from_millis(100)).await;
        assert!(coalescer.observe(names(&["a", "b", "c"])).is_none());

        // The timer re-armed on every change: it fires 500ms after the last
        // one, at t=700ms, with the latest list.
        let deadline = coalescer.deadline().expect("window open");
        assert_eq!(deadline - start, Duration::from_millis(700));
        assert_eq!(coalescer.fire(), Some(names(&["a", "b", "c"])));

        // Nothing left to dispatch.
        assert!(coalescer.fire().is_none());
        assert!(coalescer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_rearms_after_firing() {
        let mut coalescer = Coalescer::new(WatcherKind::Debounce(Duration::from_millis(500)));

        coalescer.observe(names(&["a"]));
        coalescer.fire();

        coalescer.observe(names(&["b"]));
        assert!(coalescer.deadline().is_some());
        assert_eq!(coalescer.fire(), Some(names(&["b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fires_every_n_changes() {
        let mut coalescer = Coalescer::new(WatcherKind::Batch {
            max_changes: 3,
            timeout: Duration::from_secs(1),
        });

        // Seven changes with no window expiry: dispatches at the 3rd and
        // 6th, the 7th stays pending until the timeout fires.
        let mut dispatches = 0;
        for i in 0..7 {
            if coalescer.observe(names(&[&format!("svc-{i}")])).is_some() {
                dispatches += 1;
            }
        }
        assert_eq!(dispatches, 2);
        assert_eq!(coalescer.fire(), Some(names(&["svc-6"])));
        assert_eq!(dispatches + 1, 3); // ceil(7 / 3)
    }

    #[tokio::test(start_paused = true)]
    async fn batch_window_times_out() {
        let timeout = Duration::from_secs(1);
        let mut coalescer = Coalescer::new(WatcherKind::Batch {
            max_changes: 5,
            timeout,
        });
        let start = Instant::now();

        assert!(coalescer.observe(names(&["a"])).is_none());
        let deadline = coalescer.deadline().expect("window open");
        assert_eq!(deadline - start, timeout);

        advance(Duration::from_millis(300)).await;
        // A second change does not move the window deadline.
        assert!(coalescer.observe(names(&["a", "b"])).is_none());
        assert_eq!(coalescer.deadline(), Some(deadline));

        assert_eq!(coalescer.fire(), Some(names(&["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_immediate_dispatch_closes_window() {
        let mut coalescer = Coalescer::new(WatcherKind::Batch {
            max_changes: 2,
            timeout: Duration::from_secs(1),
        });

        assert!(coalescer.observe(names(&["a"])).is_none());
        assert!(coalescer.observe(names(&["a", "b"])).is_some());
        assert!(coalescer.deadline().is_none(), "window closed after dispatch");
        assert!(coalescer.fire().is_none());
    }
}
