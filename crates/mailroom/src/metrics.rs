//! Queue telemetry.
//!
//! Events are emitted through the `metrics` facade; sinks are whatever
//! recorder the host application installs, and recording is infallible, so a
//! misbehaving sink can never break a queue operation.

use crate::message;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric names for the queue. These names are part of the external
/// contract.
pub mod names {
    /// Queued-directory length, observed on every push.
    pub const QUEUE_LENGTH: &str = "queue.length";
    /// Messages pushed successfully.
    pub const QUEUE_PUSH: &str = "queue.push";
    /// Messages handed to a worker.
    pub const QUEUE_PULL: &str = "queue.pull";
    /// Time a pulled message spent waiting since push, in seconds.
    pub const QUEUE_PULL_WAIT_SECONDS: &str = "queue.pull.wait_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_gauge!(
        names::QUEUE_LENGTH,
        "Number of messages in the queued directory, observed at push"
    );
    describe_counter!(names::QUEUE_PUSH, "Total messages pushed successfully");
    describe_counter!(names::QUEUE_PULL, "Total messages handed to a worker");
    describe_histogram!(
        names::QUEUE_PULL_WAIT_SECONDS,
        "Seconds a pulled message spent queued before being pulled"
    );
}

/// Queue metrics recorder.
#[derive(Clone)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record the queued length observed by a push.
    pub fn queue_length(queue: &str, length: usize) {
        gauge!(
            names::QUEUE_LENGTH,
            "queue_name" => queue.to_string()
        )
        .set(length as f64);
    }

    /// Record a successful push.
    pub fn message_pushed(queue: &str) {
        counter!(
            names::QUEUE_PUSH,
            "queue_name" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a successful pull of a message created at `timestamp_ms`.
    pub fn message_pulled(queue: &str, timestamp_ms: u64) {
        counter!(
            names::QUEUE_PULL,
            "queue_name" => queue.to_string()
        )
        .increment(1);

        let waited_ms = message::now_ms().saturating_sub(timestamp_ms);
        histogram!(
            names::QUEUE_PULL_WAIT_SECONDS,
            "queue_name" => queue.to_string()
        )
        .record(waited_ms as f64 / 1000.0);
    }
}
