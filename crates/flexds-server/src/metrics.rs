//! xDS delivery metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec, IntGauge,
};

static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flexds_xds_requests_total",
        "Discovery requests received",
        &["type_url"]
    )
    .expect("metric registration")
});

static RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flexds_xds_responses_total",
        "Discovery responses sent",
        &["type_url"]
    )
    .expect("metric registration")
});

static ACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flexds_xds_acks_total",
        "Discovery responses acknowledged by clients",
        &["type_url"]
    )
    .expect("metric registration")
});

static NACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "flexds_xds_nacks_total",
        "Discovery responses rejected by clients",
        &["type_url"]
    )
    .expect("metric registration")
});

static ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("flexds_xds_active_streams", "Currently open ADS streams")
        .expect("metric registration")
});

pub(crate) fn requests(type_url: &str) -> IntCounter {
    REQUESTS.with_label_values(&[type_url])
}

pub(crate) fn responses(type_url: &str) -> IntCounter {
    RESPONSES.with_label_values(&[type_url])
}

pub(crate) fn acks(type_url: &str) -> IntCounter {
    ACKS.with_label_values(&[type_url])
}

pub(crate) fn nacks(type_url: &str) -> IntCounter {
    NACKS.with_label_values(&[type_url])
}

/// Holds the active-stream gauge up for the lifetime of a stream task.
#[derive(Debug)]
pub(crate) struct StreamGuard;

impl StreamGuard {
    pub(crate) fn new() -> Self {
        ACTIVE_STREAMS.inc();
        Self
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        ACTIVE_STREAMS.dec();
    }
}
