//! Metric set of the driver core. Registered against the process
//! default registry; the exposition endpoint is an external concern
//! and simply gathers that registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram,
    register_histogram_vec,
    register_int_counter_vec,
    register_int_gauge,
    register_int_gauge_vec,
    Histogram,
    HistogramVec,
    IntCounterVec,
    IntGauge,
    IntGaugeVec,
};

pub static MIGRATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "migrations_total",
        "Live migration handoffs by result",
        &["result"]
    )
    .unwrap()
});

pub static MIGRATION_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "migration_duration_seconds",
        "Time between secondary attach and primary detach",
        vec![15.0, 30.0, 60.0, 90.0, 120.0, 180.0, 300.0, 600.0]
    )
    .unwrap()
});

pub static ACTIVE_MIGRATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "active_migrations",
        "Volumes currently inside a migration window"
    )
    .unwrap()
});

pub static VOLUME_OPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "volume_ops_total",
        "Controller volume and snapshot operations by result",
        &["op", "result"]
    )
    .unwrap()
});

pub static VOLUME_OP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "volume_op_duration_seconds",
        "Controller operation latency",
        &["op"]
    )
    .unwrap()
});

pub static ATTACH_OPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "attach_ops_total",
        "Publish/unpublish transitions by result",
        &["op", "result"]
    )
    .unwrap()
});

pub static RECONCILIATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "reconciliations_total",
        "Reconciler corrections by kind",
        &["kind"]
    )
    .unwrap()
});

pub static NODE_VOLUME_BREAKER: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "node_volume_breaker_open",
        "Per-volume node breaker state (0 closed, 1 open, 2 half-open)",
        &["volume"]
    )
    .unwrap()
});

/// Record one controller operation outcome.
pub fn observe_op(op: &str, ok: bool, seconds: f64) {
    let result = if ok { "success" } else { "error" };
    VOLUME_OPS_TOTAL.with_label_values(&[op, result]).inc();
    VOLUME_OP_DURATION.with_label_values(&[op]).observe(seconds);
}
