//! Discovery metrics.

use once_cell::sync::Lazy;
use prometheus::{register_int_gauge_vec, IntGauge, IntGaugeVec};

static SERVICES_DISCOVERED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "flexds_services_discovered",
        "Number of services discovered, by source",
        &["source"]
    )
    .expect("metric registration")
});

pub(crate) fn services_discovered(source: &str) -> IntGauge {
    SERVICES_DISCOVERED.with_label_values(&[source])
}
