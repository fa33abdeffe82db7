//! Prometheus metrics for supply activity.
//!
//! All metrics are registered to a custom registry with the `supplyline`
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are handled gracefully - if a
//! metric fails to register, a fallback no-op metric is used instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for supply metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("supplyline".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Declare an IntCounter metric.
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

define_counter!(
    BATCHES_SENT,
    "supply_batches_sent_total",
    "Supply batches delivered to demanders"
);

define_counter_vec!(
    ENTRIES_SENT,
    "supply_entries_sent_total",
    "Entries shipped, labelled by source tier",
    ["source"]
);

define_counter!(
    PARTITIONS_COMPLETED,
    "supply_partitions_completed_total",
    "Partitions fully streamed and marked last"
);

define_counter!(
    PARTITIONS_MISSED,
    "supply_partitions_missed_total",
    "Partitions withdrawn with a missed marker"
);

define_counter!(
    DEMANDS_DROPPED_STALE,
    "supply_demands_dropped_stale_total",
    "Demands dropped for carrying a stale topology version"
);

define_gauge!(
    CONTEXTS_ACTIVE,
    "supply_contexts_active",
    "Supply contexts currently stored between turns"
);

define_counter!(
    CONTEXTS_EVICTED,
    "supply_contexts_evicted_total",
    "Supply contexts evicted by topology events or invalidation"
);

/// Entry source labels for [`ENTRIES_SENT`].
pub mod source {
    pub const MEMORY: &str = "memory";
    pub const OVERFLOW: &str = "overflow";
    pub const PROMOTION: &str = "promotion";
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Render all supply metrics in Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = BATCHES_SENT.get();
        BATCHES_SENT.inc();
        assert_eq!(BATCHES_SENT.get(), before + 1);
    }

    #[test]
    fn test_entry_source_labels() {
        ENTRIES_SENT.with_label_values(&[source::MEMORY]).inc();
        ENTRIES_SENT.with_label_values(&[source::PROMOTION]).inc_by(3);
        assert!(ENTRIES_SENT.with_label_values(&[source::PROMOTION]).get() >= 3);
    }

    #[test]
    fn test_gather_renders_text() {
        BATCHES_SENT.inc();
        let text = gather();
        assert!(text.contains("supply_batches_sent_total"));
    }
}
