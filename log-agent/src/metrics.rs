//! Prometheus metrics for the tailing agent.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // ==================== THROUGHPUT METRICS ====================
    pub static ref LINES_FORWARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "log_agent_lines_forwarded_total",
        "Lines published to the sink by topic",
        &["topic"]
    )
    .unwrap();
    pub static ref OFFSETS_RECORDED_TOTAL: IntCounter = register_int_counter!(
        "log_agent_offsets_recorded_total",
        "Offsets appended to side-car files after delivery"
    )
    .unwrap();
    pub static ref FILES_FINISHED_TOTAL: IntCounter = register_int_counter!(
        "log_agent_files_finished_total",
        "Drained files renamed with the finished suffix"
    )
    .unwrap();
    pub static ref TASK_EXITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "log_agent_task_exits_total",
        "Tail task terminations by reason",
        &["reason"]
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================
    pub static ref SINK_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "log_agent_sink_failures_total",
        "Records the sink gave up on after exhausting retries"
    )
    .unwrap();
    pub static ref RECONCILE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "log_agent_reconcile_errors_total",
        "Reconciliation passes that failed"
    )
    .unwrap();

    // ==================== LATENCY METRICS ====================
    pub static ref RECONCILE_DURATION: Histogram = register_histogram!(
        "log_agent_reconcile_duration_seconds",
        "Time spent in one reconciliation pass",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref ACTIVE_TASKS: IntGauge = register_int_gauge!(
        "log_agent_active_tasks",
        "Tail tasks currently registered with the manager"
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_reconcile_error_help_covers_every_failed_pass() {
        let descs = RECONCILE_ERRORS_TOTAL.desc();
        assert_eq!(descs[0].help, "Reconciliation passes that failed");
    }
}
