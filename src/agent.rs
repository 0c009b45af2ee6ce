use crate::certs::CertificateStore;
use crate::channel::{HttpBatchTransport, HttpEnrollmentApi, SecureChannel};
use crate::config::Config;
use crate::descriptor::load_sensors_file;
use crate::diagnostics;
use crate::enrollment::{Enrollment, EnrollmentApi};
use crate::http::{self, HttpState};
use crate::packager::{run_packager, OutboundBatch, SequenceCounter};
use crate::queue::SampleQueue;
use crate::registry::{LoadedSensors, SensorRegistry};
use crate::reload::{RemoteSensorConfig, SensorReloader};
use crate::scheduler::Scheduler;
use crate::sender::{BatchTransport, Sender};
use crate::spool::Spool;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;

/// Loads the sensors file named by the configuration. A missing file is fatal;
/// a bad individual sensor only disables that sensor.
pub fn load_sensors(config: &Config, registry: &SensorRegistry) -> Result<LoadedSensors> {
    let Some(path) = &config.sensors_config else {
        tracing::warn!("no sensors-config given, running without sensors");
        return Ok(LoadedSensors::default());
    };
    let raw = load_sensors_file(path)?;
    let loaded = registry.load(&raw)?;
    tracing::info!(
        path = %path.display(),
        active = loaded.active.len(),
        disabled = loaded.disabled.len(),
        "sensors loaded"
    );
    Ok(loaded)
}

/// Sensor side of the pipeline: the startup set plus what is needed to
/// replace it while running.
pub struct SensorSetup {
    pub registry: SensorRegistry,
    pub initial: LoadedSensors,
    /// Polled every `remote_config_interval` when that is configured.
    pub remote: Option<Arc<dyn RemoteSensorConfig>>,
    /// Notified to re-read the sensors file.
    pub hangup: Arc<Notify>,
}

impl SensorSetup {
    pub fn new(registry: SensorRegistry, initial: LoadedSensors) -> Self {
        Self {
            registry,
            initial,
            remote: None,
            hangup: Arc::new(Notify::new()),
        }
    }
}

/// Builds the network side from configuration and runs until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let registry = SensorRegistry::with_builtins();
    let sensors = load_sensors(&config, &registry)?;

    let store = CertificateStore::new(&config.certs_dir);
    let ca_pem = store
        .read_ca()
        .context("pinned CA certificate must be provisioned before running")?;
    let enroll_channel =
        SecureChannel::anonymous(&config.webapi_url, ca_pem.as_bytes(), config.request_timeout)
            .context("build enrollment client")?;
    let api = HttpEnrollmentApi::new(enroll_channel.clone(), &config.agent_id);

    let clock_api = HttpEnrollmentApi::new(enroll_channel, &config.agent_id);
    let max_skew = config.max_clock_skew;
    tokio::spawn(async move {
        if let Err(err) = check_clock_skew(&clock_api, max_skew).await {
            tracing::warn!(error = %err, "clock check against collector failed");
        }
    });

    let transport = Arc::new(HttpBatchTransport::new(
        &config.webapi_url,
        ca_pem.into_bytes(),
        &config.agent_id,
        store,
        config.request_timeout,
    ));

    let mut setup = SensorSetup::new(registry, sensors);
    if config.remote_config_interval.is_some() {
        setup.remote = Some(transport.clone() as Arc<dyn RemoteSensorConfig>);
    }
    listen_for_hangup(setup.hangup.clone());

    tracing::info!(
        agent_id = %config.agent_id,
        collector = %config.webapi_url,
        "probe-agent starting"
    );
    run_pipeline(&config, setup, api, transport, cancel).await
}

/// Wires scheduler, queue, packager, sender, and enrollment together and owns
/// the shutdown order: sensors first, then the delivery pipeline, then
/// whatever is left in the queue goes to `pending.bin`.
pub async fn run_pipeline<A>(
    config: &Config,
    sensors: SensorSetup,
    enrollment_api: A,
    transport: Arc<dyn BatchTransport>,
    cancel: CancellationToken,
) -> Result<()>
where
    A: EnrollmentApi + 'static,
{
    let started_at = Utc::now();
    let queue = SampleQueue::new(config.queue_config());
    let spool = match &config.spool_dir {
        Some(dir) => Some(Arc::new(Spool::open(dir, config.max_spool_bytes)?)),
        None => None,
    };
    let mut counter = SequenceCounter::load(&config.state_dir)?;
    let backlog = match &spool {
        Some(spool) => recover_spool(spool, &mut counter, &queue)?,
        None => Vec::new(),
    };

    let store = CertificateStore::new(&config.certs_dir);
    let (enrollment, enrollment_handle) =
        Enrollment::new(enrollment_api, store, config.enrollment_config())
            .context("restore enrollment state")?;
    let enrollment_cancel = CancellationToken::new();
    let enrollment_task = tokio::spawn(enrollment.run(enrollment_cancel.clone()));

    let (reload_tx, reload_rx) = mpsc::channel(1);
    let mut reloader = SensorReloader::new(
        sensors.registry,
        config.sensors_config.clone(),
        &sensors.initial,
        reload_tx,
        queue.clone(),
    );
    if let (Some(remote), Some(every)) = (sensors.remote, config.remote_config_interval) {
        reloader = reloader.with_remote(remote, every);
    }
    let sensor_set = reloader.applied();
    let reload_task = tokio::spawn(reloader.run(sensors.hangup, cancel.clone()));

    let mut scheduler = Scheduler::new(sensors.initial.active, queue.clone(), config.scheduler_config())
        .with_reload(reload_rx);
    let errors_task = if config.report_errors {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        scheduler = scheduler.with_events(events_tx);
        Some(tokio::spawn(diagnostics::forward_errors(events_rx, queue.clone())))
    } else {
        None
    };
    let scheduler_stats = scheduler.stats();
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    let pipeline_cancel = CancellationToken::new();
    let (batch_tx, batch_rx) = mpsc::channel(config.max_inflight_batches);
    let packager_task = tokio::spawn(run_packager(
        queue.clone(),
        counter,
        spool.clone(),
        batch_tx,
        config.packager_config(),
        pipeline_cancel.clone(),
    ));
    let sender = Sender::new(
        transport,
        enrollment_handle.clone(),
        spool.clone(),
        config.sender_config(),
    );
    let sender_stats = sender.stats();
    let sender_task = tokio::spawn(sender.run(backlog, batch_rx, pipeline_cancel.clone()));

    let status_cancel = CancellationToken::new();
    let status_task = match config.status_bind {
        Some(addr) => {
            let state = HttpState {
                agent_id: config.agent_id.clone(),
                started_at,
                queue: queue.clone(),
                scheduler: scheduler_stats,
                sender: sender_stats,
                enrollment: enrollment_handle,
                sensor_set,
                spool: spool.clone(),
            };
            Some(spawn_status_server(addr, state, status_cancel.clone()).await?)
        }
        None => None,
    };

    cancel.cancelled().await;
    tracing::info!("shutdown requested, stopping sensors");
    join(scheduler_task, "scheduler").await;
    join(reload_task, "sensor reloader").await;
    if let Some(task) = errors_task {
        join(task, "error forwarder").await;
    }

    pipeline_cancel.cancel();
    join(packager_task, "packager").await;
    join(sender_task, "sender").await;

    let leftover = queue.drain_all();
    match &spool {
        Some(spool) => match spool.persist_pending(&leftover) {
            Ok(()) if !leftover.is_empty() => {
                tracing::info!(samples = leftover.len(), "queued samples saved for next start");
            }
            Ok(()) => {}
            Err(err) => {
                tracing::error!(samples = leftover.len(), error = %err, "failed to save queued samples");
            }
        },
        None if !leftover.is_empty() => {
            tracing::warn!(samples = leftover.len(), "no spool_dir configured, queued samples discarded");
        }
        None => {}
    }

    enrollment_cancel.cancel();
    join(enrollment_task, "enrollment").await;
    status_cancel.cancel();
    if let Some(task) = status_task {
        join(task, "status server").await;
    }
    tracing::info!("probe-agent stopped");
    Ok(())
}

/// Re-reads the sensors file on SIGHUP.
fn listen_for_hangup(hangup: Arc<Notify>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut signals) => {
                tokio::spawn(async move {
                    while signals.recv().await.is_some() {
                        tracing::info!("SIGHUP received, reloading sensors");
                        hangup.notify_one();
                    }
                });
            }
            Err(err) => tracing::warn!(error = %err, "SIGHUP handler unavailable, sensors reload disabled"),
        }
    }
    #[cfg(not(unix))]
    drop(hangup);
}

/// Reloads unacknowledged batches and pending samples from a previous run.
fn recover_spool(
    spool: &Spool,
    counter: &mut SequenceCounter,
    queue: &SampleQueue,
) -> Result<Vec<OutboundBatch>> {
    // Read before load() so quarantined files still push the counter forward.
    if let Some(highest) = spool.highest_seq()? {
        counter.advance_past(highest)?;
    }
    let backlog = spool.load()?;
    let pending = spool.take_pending()?;
    if !pending.is_empty() {
        tracing::info!(samples = pending.len(), "restoring samples queued before last shutdown");
        queue.restore(pending);
    }
    if !backlog.is_empty() {
        tracing::info!(
            batches = backlog.len(),
            next_seq = counter.peek(),
            dir = %spool.dir().display(),
            "found unacknowledged batches in spool"
        );
    }
    Ok(backlog)
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!("failed to bind status listener on {addr}: port already in use");
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind status listener on {addr}")),
    }
}

async fn spawn_status_server(
    addr: SocketAddr,
    state: HttpState,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = bind_listener(addr).await?;
    tracing::info!(bind = %addr, "status endpoint listening");
    let app = http::router(state);
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %err, "status server exited");
        }
    }))
}

async fn join(task: JoinHandle<()>, name: &str) {
    if let Err(err) = task.await {
        tracing::error!(task = name, error = %err, "task ended abnormally");
    }
}

/// Absolute difference between the two clocks.
pub fn clock_skew(local: DateTime<Utc>, server: DateTime<Utc>) -> Duration {
    let delta = if local >= server { local - server } else { server - local };
    delta.to_std().unwrap_or(Duration::MAX)
}

/// Logs an error when the local clock is further than `max_skew` from the
/// collector's. Never blocks delivery.
pub async fn check_clock_skew(api: &HttpEnrollmentApi, max_skew: Duration) -> Result<Duration> {
    let server = api.server_time().await?;
    let skew = clock_skew(Utc::now(), server);
    if skew > max_skew {
        tracing::error!(
            skew_secs = skew.as_secs(),
            max_skew_secs = max_skew.as_secs(),
            server_time = %server,
            "local clock differs from collector; sample timestamps will be off"
        );
    } else {
        tracing::debug!(skew_ms = skew.as_millis() as u64, "clock within tolerance");
    }
    Ok(skew)
}
