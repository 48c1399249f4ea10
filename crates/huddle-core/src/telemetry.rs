//! Counters recorded from inside the core.
//!
//! Uses the `metrics` facade; nothing is exported unless the binary
//! installs a recorder.

use metrics::counter;

/// Metric names.
pub mod names {
    pub const FANOUT_DELIVERIES_TOTAL: &str = "huddle_fanout_deliveries_total";
    pub const PERSISTENCE_FAILURES_TOTAL: &str = "huddle_persistence_failures_total";
}

/// Record events handed to room or process-wide subscribers.
pub fn record_fanout(recipients: usize) {
    counter!(names::FANOUT_DELIVERIES_TOTAL).increment(recipients as u64);
}

/// Record a failed durable write by job name.
pub fn record_persistence_failure(job: &'static str) {
    counter!(names::PERSISTENCE_FAILURES_TOTAL, "job" => job).increment(1);
}
