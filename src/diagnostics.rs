use crate::queue::SampleQueue;
use crate::sample::{Sample, SampleValue};
use crate::scheduler::SchedulerEvent;
use serde_json::json;
use tokio::sync::mpsc;

/// Streams produced by the agent itself. Sensor names may not start with `_`.
pub const ERROR_STREAM: &str = "_error";
pub const CONFIG_APPLIED_STREAM: &str = "_config_applied";

/// Turns a sensor failure into a sample for the collector. Successes and
/// overlap skips stay local.
pub fn error_sample(event: &SchedulerEvent) -> Option<Sample> {
    let value = match event {
        SchedulerEvent::Failed {
            sensor,
            error,
            consecutive,
        } => json!({
            "sensor": sensor,
            "event": "failed",
            "error": error.to_string(),
            "consecutive": consecutive,
        }),
        SchedulerEvent::Suspended { sensor, consecutive } => json!({
            "sensor": sensor,
            "event": "suspended",
            "consecutive": consecutive,
        }),
        SchedulerEvent::Collected { .. } | SchedulerEvent::OverlapSkipped { .. } => return None,
    };
    Some(Sample::new(ERROR_STREAM, SampleValue::Json(value)))
}

/// Feeds scheduler failures into the queue until the scheduler goes away.
pub async fn forward_errors(mut events: mpsc::Receiver<SchedulerEvent>, queue: SampleQueue) {
    let mut forwarded = 0u64;
    while let Some(event) = events.recv().await {
        if let Some(sample) = error_sample(&event) {
            queue.push(sample);
            forwarded += 1;
        }
    }
    tracing::debug!(forwarded, "error forwarder stopped");
}
