use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref WATCH_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "kobs_watch_events_total",
        "Job events delivered by the informer, by kind.",
        &["kind"]
    )
    .unwrap();
    pub static ref WATCH_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "kobs_watch_errors_total",
        "Errors returned by the job watch stream."
    )
    .unwrap();
    pub static ref JOBS_CREATED_TOTAL: IntCounter = register_int_counter!(
        "kobs_jobs_created_total",
        "Jobs submitted through the manager."
    )
    .unwrap();
    pub static ref JOBS_REAPED_TOTAL: IntCounter = register_int_counter!(
        "kobs_jobs_reaped_total",
        "Finished jobs deleted by the reconciler."
    )
    .unwrap();
    pub static ref REAP_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "kobs_reap_failures_total",
        "Reconciler deletions that failed."
    )
    .unwrap();
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
