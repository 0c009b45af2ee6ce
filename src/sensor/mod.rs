mod check_port;
mod logread;
mod system;

pub use check_port::CheckPortSensor;
pub use logread::LogReadSensor;
pub use system::{DiskUsageSensor, LoadAvgSensor, UptimeSensor};

use crate::descriptor::SensorParams;
use crate::error::{ConfigError, SensorError};
use crate::sample::Sample;
use async_trait::async_trait;
use tokio::time::Instant;

/// A pluggable data source.
///
/// `collect` must return by `deadline`; the scheduler drops the future when it
/// does not, so implementations should only hold state that survives being
/// cancelled at any await point. Unless `reentrant` returns true the scheduler
/// never runs two `collect` calls on the same instance at once.
#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&mut self, params: &SensorParams) -> Result<(), ConfigError>;

    async fn collect(&self, deadline: Instant) -> Result<Sample, SensorError>;

    fn reentrant(&self) -> bool {
        false
    }
}

pub(crate) fn param_str<'a>(params: &'a SensorParams, key: &str) -> Result<&'a str, ConfigError> {
    match params.get(key) {
        Some(serde_json::Value::String(value)) if !value.trim().is_empty() => Ok(value.trim()),
        Some(_) => Err(ConfigError::invalid(key, "expected a non-empty string")),
        None => Err(ConfigError::Missing(key.to_string())),
    }
}

pub(crate) fn param_u64(
    params: &SensorParams,
    key: &str,
    default: Option<u64>,
) -> Result<u64, ConfigError> {
    match params.get(key) {
        Some(value) => value
            .as_u64()
            .ok_or_else(|| ConfigError::invalid(key, "expected a non-negative integer")),
        None => default.ok_or_else(|| ConfigError::Missing(key.to_string())),
    }
}

/// Runs blocking acquisition off the runtime, bounded by `deadline`.
pub(crate) async fn blocking_until<T, F>(deadline: Instant, f: F) -> Result<T, SensorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SensorError> + Send + 'static,
{
    let budget = deadline.saturating_duration_since(Instant::now());
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(SensorError::Io(join.to_string())),
        Err(_) => Err(SensorError::Timeout(budget)),
    }
}
