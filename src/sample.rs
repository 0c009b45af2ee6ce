use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SampleValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(String),
    Json(serde_json::Value),
}

/// One timestamped reading produced by a sensor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor: String,
    pub monotonic_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(sensor: impl Into<String>, value: SampleValue) -> Self {
        Self {
            sensor: sensor.into(),
            monotonic_ms: monotonic_ms(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            value,
        }
    }
}

pub fn monotonic_ms() -> u64 {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) != 0 {
            return 0;
        }
        let secs = ts.tv_sec.max(0) as u64;
        let nanos = ts.tv_nsec.max(0) as u64;
        secs.saturating_mul(1000) + nanos / 1_000_000
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
    }
}
