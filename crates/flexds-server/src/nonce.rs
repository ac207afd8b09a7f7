//! Nonce generation for discovery responses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique response nonce.
///
/// Combines a timestamp with an atomic counter so nonces stay unique even
/// under high concurrency. Format: `{timestamp_hex}-{counter_hex}`.
pub(crate) fn next_nonce() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{timestamp:x}-{count:x}")
}
