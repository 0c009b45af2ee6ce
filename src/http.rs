use crate::enrollment::{EnrollmentHandle, EnrollmentStatus};
use crate::queue::{QueueStatus, SampleQueue};
use crate::reload::{AppliedSensors, SharedApplied};
use crate::scheduler::{SchedulerStats, SensorStats};
use crate::sender::{SenderSnapshot, SenderStats};
use crate::spool::{Spool, SpoolStatus};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub queue: SampleQueue,
    pub scheduler: Arc<SchedulerStats>,
    pub sender: Arc<SenderStats>,
    pub enrollment: EnrollmentHandle,
    pub sensor_set: SharedApplied,
    pub spool: Option<Arc<Spool>>,
}

#[derive(Debug, Serialize)]
pub struct AgentStatus {
    agent_id: String,
    version: &'static str,
    started_at: DateTime<Utc>,
    enrollment: EnrollmentStatus,
    queue: QueueStatus,
    sender: SenderSnapshot,
    sensors: BTreeMap<String, SensorStats>,
    sensor_set: Option<AppliedSensors>,
    spool: Option<SpoolStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<AgentStatus> {
    Json(AgentStatus {
        agent_id: state.agent_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        enrollment: state.enrollment.status(),
        queue: state.queue.status(),
        sender: state.sender.snapshot(),
        sensors: state.scheduler.snapshot(),
        sensor_set: state.sensor_set.read().ok().map(|applied| applied.clone()),
        spool: state.spool.as_ref().map(|spool| spool.status()),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
