//! Snapshot pipeline metrics.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};

static SNAPSHOTS_PUSHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "flexds_snapshots_pushed_total",
        "Total number of snapshots pushed to the cache"
    )
    .expect("metric registration")
});

static BUILD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "flexds_snapshot_build_failures_total",
        "Snapshot builds aborted by resource encoding failures"
    )
    .expect("metric registration")
});

pub(crate) fn snapshots_pushed() -> &'static IntCounter {
    &SNAPSHOTS_PUSHED
}

pub(crate) fn build_failures() -> &'static IntCounter {
    &BUILD_FAILURES
}
