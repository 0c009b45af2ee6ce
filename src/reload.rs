use crate::descriptor::{load_sensors_file, RawDescriptor, SensorDescriptor};
use crate::diagnostics::CONFIG_APPLIED_STREAM;
use crate::error::TransportError;
use crate::queue::SampleQueue;
use crate::registry::{ConfiguredSensor, DisabledSensor, LoadedSensors, SensorRegistry};
use crate::sample::{Sample, SampleValue};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Sensor set published by the collector for this agent.
#[async_trait]
pub trait RemoteSensorConfig: Send + Sync {
    /// `Ok(None)` when the collector holds no set for this agent.
    async fn fetch_sensors(&self) -> Result<Option<Vec<RawDescriptor>>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorSource {
    Startup,
    File,
    Collector,
}

/// The sensor set currently handed to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedSensors {
    pub fingerprint: String,
    pub source: SensorSource,
    pub applied_at: DateTime<Utc>,
    pub active: Vec<String>,
    pub disabled: Vec<DisabledSensor>,
}

pub type SharedApplied = Arc<RwLock<AppliedSensors>>;

/// Hash over the validated descriptors and the disabled list.
pub fn fingerprint(loaded: &LoadedSensors) -> String {
    let descriptors: Vec<&SensorDescriptor> = loaded.active.iter().map(|s| s.descriptor.as_ref()).collect();
    let encoded = serde_json::to_vec(&(descriptors, &loaded.disabled)).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// Replaces the running sensor set on SIGHUP (from the sensors file) and,
/// when a remote source is set, whenever the collector publishes a new one.
pub struct SensorReloader {
    registry: SensorRegistry,
    sensors_config: Option<PathBuf>,
    remote: Option<(Arc<dyn RemoteSensorConfig>, Duration)>,
    scheduler: mpsc::Sender<Vec<ConfiguredSensor>>,
    queue: SampleQueue,
    applied: SharedApplied,
}

impl SensorReloader {
    /// `initial` is the set the scheduler was started with; it is announced
    /// on the `_config_applied` stream right away.
    pub fn new(
        registry: SensorRegistry,
        sensors_config: Option<PathBuf>,
        initial: &LoadedSensors,
        scheduler: mpsc::Sender<Vec<ConfiguredSensor>>,
        queue: SampleQueue,
    ) -> Self {
        let applied = Arc::new(RwLock::new(describe(initial, SensorSource::Startup)));
        let reloader = Self {
            registry,
            sensors_config,
            remote: None,
            scheduler,
            queue,
            applied,
        };
        reloader.announce();
        reloader
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSensorConfig>, every: Duration) -> Self {
        self.remote = Some((remote, every));
        self
    }

    pub fn applied(&self) -> SharedApplied {
        self.applied.clone()
    }

    pub async fn run(mut self, hangup: Arc<Notify>, cancel: CancellationToken) {
        let mut poll = self.remote.as_ref().map(|(_, every)| {
            let mut poll = tokio::time::interval(*every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = hangup.notified() => self.reload_file().await,
                _ = tick(&mut poll) => self.poll_remote().await,
            }
        }
        tracing::debug!("sensor reloader stopped");
    }

    async fn reload_file(&mut self) {
        let Some(path) = self.sensors_config.clone() else {
            tracing::warn!("reload requested but no sensors-config is set");
            return;
        };
        let result = match load_sensors_file(&path) {
            Ok(raw) => self.apply(&raw, SensorSource::File).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            tracing::error!(path = %path.display(), error = %err, "sensors reload failed, keeping current set");
        }
    }

    async fn poll_remote(&mut self) {
        let Some((remote, _)) = &self.remote else {
            return;
        };
        let remote = remote.clone();
        match remote.fetch_sensors().await {
            Ok(Some(raw)) => {
                if let Err(err) = self.apply(&raw, SensorSource::Collector).await {
                    tracing::error!(error = %err, "collector sensor set rejected, keeping current set");
                }
            }
            Ok(None) => tracing::debug!("collector has no sensor set for this agent"),
            Err(err) => tracing::debug!(error = %err, "fetching sensor set from collector failed"),
        }
    }

    /// Validates `raw` and hands it to the scheduler. A collector set equal to
    /// the running one is ignored; a file reload always goes through so that
    /// suspended sensors get another chance. Returns whether anything was sent.
    pub async fn apply(&mut self, raw: &[RawDescriptor], source: SensorSource) -> Result<bool> {
        let loaded = self.registry.load(raw)?;
        let unchanged = self
            .applied
            .read()
            .map(|current| current.fingerprint == fingerprint(&loaded))
            .unwrap_or(false);
        if unchanged && source == SensorSource::Collector {
            tracing::debug!("collector sensor set unchanged");
            return Ok(false);
        }
        let described = describe(&loaded, source);
        self.scheduler
            .send(loaded.active)
            .await
            .ok()
            .context("scheduler is no longer running")?;
        tracing::info!(
            source = ?source,
            active = described.active.len(),
            disabled = described.disabled.len(),
            fingerprint = %described.fingerprint,
            "sensor set applied"
        );
        if let Ok(mut current) = self.applied.write() {
            *current = described;
        }
        self.announce();
        Ok(true)
    }

    fn announce(&self) {
        let Ok(current) = self.applied.read() else {
            return;
        };
        let disabled: Vec<&str> = current.disabled.iter().map(|d| d.name.as_str()).collect();
        let value = json!({
            "fingerprint": current.fingerprint,
            "source": current.source,
            "active": current.active,
            "disabled": disabled,
        });
        self.queue.push(Sample::new(CONFIG_APPLIED_STREAM, SampleValue::Json(value)));
    }
}

fn describe(loaded: &LoadedSensors, source: SensorSource) -> AppliedSensors {
    AppliedSensors {
        fingerprint: fingerprint(loaded),
        source,
        applied_at: Utc::now(),
        active: loaded.active.iter().map(|s| s.descriptor.name.clone()).collect(),
        disabled: loaded.disabled.clone(),
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}
