use crate::descriptor::{FailurePolicy, SensorDescriptor, MAX_SENSOR_DURATION};
use crate::error::SensorError;
use crate::queue::SampleQueue;
use crate::registry::ConfiguredSensor;
use crate::sample::Sample;
use crate::sensor::Sensor;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Collected {
        sensor: String,
    },
    Failed {
        sensor: String,
        error: SensorError,
        consecutive: u32,
    },
    OverlapSkipped {
        sensor: String,
    },
    /// Raised once when a `disable_after` limit is reached.
    Suspended {
        sensor: String,
        consecutive: u32,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub timeouts: u64,
    pub overlap_skips: u64,
    pub suspended: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    sensors: Mutex<BTreeMap<String, SensorStats>>,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> BTreeMap<String, SensorStats> {
        self.sensors
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, sensor: &str) -> Option<SensorStats> {
        self.sensors
            .lock()
            .ok()
            .and_then(|guard| guard.get(sensor).cloned())
    }

    fn reset(&self, sensor: &str) {
        if let Ok(mut guard) = self.sensors.lock() {
            guard.insert(sensor.to_string(), SensorStats::default());
        }
    }

    fn remove(&self, sensor: &str) {
        if let Ok(mut guard) = self.sensors.lock() {
            guard.remove(sensor);
        }
    }

    fn update(&self, sensor: &str, f: impl FnOnce(&mut SensorStats)) -> SensorStats {
        match self.sensors.lock() {
            Ok(mut guard) => {
                let entry = guard.entry(sensor.to_string()).or_default();
                f(entry);
                entry.clone()
            }
            Err(_) => SensorStats::default(),
        }
    }
}

struct Slot {
    descriptor: Arc<SensorDescriptor>,
    sensor: Arc<dyn Sensor>,
    in_flight: usize,
    suspended: bool,
    /// Replaced or removed by a reload; late completions are only counted down.
    retired: bool,
}

impl Slot {
    fn new(configured: ConfiguredSensor) -> Self {
        Self {
            descriptor: configured.descriptor,
            sensor: configured.sensor,
            in_flight: 0,
            suspended: false,
            retired: false,
        }
    }
}

type DueHeap = BinaryHeap<Reverse<(Instant, usize)>>;

struct Completion {
    slot: usize,
    outcome: Result<(), SensorError>,
}

/// Drives every active sensor at its own cadence.
///
/// Due times are kept in a min-heap; each dispatch becomes its own task, bounded
/// by a shared semaphore and by the sensor's timeout. Next-due times advance
/// from the scheduled time so slow sensors do not drift. A new sensor set can
/// be swapped in at runtime through [`Scheduler::with_reload`].
pub struct Scheduler {
    slots: Vec<Slot>,
    queue: SampleQueue,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    reload: Option<mpsc::Receiver<Vec<ConfiguredSensor>>>,
    running: HashMap<task::Id, usize>,
}

impl Scheduler {
    pub fn new(sensors: Vec<ConfiguredSensor>, queue: SampleQueue, config: SchedulerConfig) -> Self {
        let stats = Arc::new(SchedulerStats::default());
        let slots = sensors
            .into_iter()
            .map(|configured| {
                stats.update(&configured.descriptor.name, |_| {});
                Slot::new(configured)
            })
            .collect();
        Self {
            slots,
            queue,
            config,
            stats,
            events: None,
            reload: None,
            running: HashMap::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Each set received replaces the running one. Sensors whose descriptor is
    /// unchanged keep their schedule and state unless suspended; changed,
    /// suspended and new sensors start fresh; missing ones stop.
    pub fn with_reload(mut self, reload: mpsc::Receiver<Vec<ConfiguredSensor>>) -> Self {
        self.reload = Some(reload);
        self
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks: JoinSet<Completion> = JoinSet::new();
        let mut due = DueHeap::new();
        let mut reload = self.reload.take();

        let start = Instant::now();
        for idx in 0..self.slots.len() {
            due.push(Reverse((start, idx)));
        }
        tracing::info!(sensors = self.slots.len(), "scheduler started");

        loop {
            let next_due = due.peek().map(|Reverse((at, _))| *at);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => self.joined(joined),
                update = recv_opt(&mut reload) => match update {
                    Some(sensors) => self.reconfigure(sensors, &mut due),
                    None => reload = None,
                },
                _ = sleep_until_opt(next_due) => {
                    let Some(Reverse((scheduled, idx))) = due.pop() else { continue };
                    let slot = &self.slots[idx];
                    if slot.suspended || slot.retired {
                        continue;
                    }
                    let interval = slot.descriptor.interval;
                    self.dispatch(idx, &permits, &mut tasks);
                    match next_tick(scheduled, interval, Instant::now()) {
                        Some(next) => due.push(Reverse((next, idx))),
                        None => tracing::error!(
                            sensor = %self.slots[idx].descriptor.name,
                            "interval out of range, sensor will not run again"
                        ),
                    }
                }
            }
        }

        self.shutdown(tasks).await;
    }

    fn reconfigure(&mut self, sensors: Vec<ConfiguredSensor>, due: &mut DueHeap) {
        let mut live: HashMap<String, usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.retired)
            .map(|(idx, slot)| (slot.descriptor.name.clone(), idx))
            .collect();
        let now = Instant::now();
        let (mut kept, mut started) = (0usize, 0usize);

        for configured in sensors {
            let name = configured.descriptor.name.clone();
            if let Some(idx) = live.remove(&name) {
                let slot = &mut self.slots[idx];
                if *slot.descriptor == *configured.descriptor && !slot.suspended {
                    kept += 1;
                    continue;
                }
                slot.retired = true;
            }
            self.stats.reset(&name);
            self.slots.push(Slot::new(configured));
            due.push(Reverse((now, self.slots.len() - 1)));
            started += 1;
        }

        let stopped = live.len();
        for (name, idx) in live {
            self.slots[idx].retired = true;
            self.stats.remove(&name);
        }
        tracing::info!(kept, started, stopped, "sensor set reloaded");
    }

    fn dispatch(&mut self, idx: usize, permits: &Arc<Semaphore>, tasks: &mut JoinSet<Completion>) {
        let slot = &mut self.slots[idx];
        if slot.in_flight > 0 && !slot.sensor.reentrant() {
            tracing::debug!(sensor = %slot.descriptor.name, "previous collect still running, skipping tick");
            self.stats.update(&slot.descriptor.name, |s| s.overlap_skips += 1);
            emit(
                &self.events,
                SchedulerEvent::OverlapSkipped {
                    sensor: slot.descriptor.name.clone(),
                },
            );
            return;
        }

        slot.in_flight += 1;
        let sensor = slot.sensor.clone();
        let timeout = slot.descriptor.timeout;
        let permits = permits.clone();
        let queue = self.queue.clone();
        let handle = tasks.spawn(async move {
            let outcome = collect_once(sensor.as_ref(), timeout, &permits)
                .await
                .map(|sample| {
                    queue.push(sample);
                });
            Completion { slot: idx, outcome }
        });
        self.running.insert(handle.id(), idx);
    }

    /// A panicked collect counts as a failure of its sensor; an aborted one
    /// only releases the slot.
    fn joined(&mut self, joined: Result<(task::Id, Completion), JoinError>) {
        match joined {
            Ok((id, completion)) => {
                self.running.remove(&id);
                self.complete(completion);
            }
            Err(err) => {
                let Some(idx) = self.running.remove(&err.id()) else {
                    tracing::error!(error = %err, "unknown sensor task ended abnormally");
                    return;
                };
                if err.is_panic() {
                    tracing::error!(sensor = %self.slots[idx].descriptor.name, "sensor collect panicked");
                    self.complete(Completion {
                        slot: idx,
                        outcome: Err(SensorError::Io("collect panicked".to_string())),
                    });
                } else {
                    let slot = &mut self.slots[idx];
                    slot.in_flight = slot.in_flight.saturating_sub(1);
                }
            }
        }
    }

    fn complete(&mut self, completion: Completion) {
        let slot = &mut self.slots[completion.slot];
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if slot.retired {
            return;
        }
        let name = slot.descriptor.name.clone();

        let err = match completion.outcome {
            Ok(()) => {
                self.stats.update(&name, |s| {
                    s.successes += 1;
                    s.consecutive_failures = 0;
                });
                emit(&self.events, SchedulerEvent::Collected { sensor: name });
                return;
            }
            Err(err) => err,
        };

        let stats = self.stats.update(&name, |s| {
            s.failures += 1;
            s.consecutive_failures += 1;
            if matches!(err, SensorError::Timeout(_)) {
                s.timeouts += 1;
            }
            s.last_error = Some(err.to_string());
        });
        let consecutive = stats.consecutive_failures;
        tracing::warn!(sensor = %name, error = %err, consecutive, "sensor collect failed");
        emit(
            &self.events,
            SchedulerEvent::Failed {
                sensor: name.clone(),
                error: err,
                consecutive,
            },
        );

        if let FailurePolicy::DisableAfter(limit) = slot.descriptor.on_failure {
            if !slot.suspended && consecutive >= limit.get() {
                slot.suspended = true;
                self.stats.update(&name, |s| s.suspended = true);
                tracing::error!(sensor = %name, consecutive, "sensor suspended after repeated failures");
                emit(&self.events, SchedulerEvent::Suspended { sensor: name, consecutive });
            }
        }
    }

    async fn shutdown(mut self, mut tasks: JoinSet<Completion>) {
        if tasks.is_empty() {
            tracing::info!("scheduler stopped");
            return;
        }
        tracing::info!(
            in_flight = tasks.len(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "waiting for in-flight collects"
        );
        let grace = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(joined) => self.joined(joined),
                    None => break,
                },
                _ = &mut grace => {
                    tracing::warn!(abandoned = tasks.len(), "shutdown grace elapsed, abandoning collects");
                    tasks.shutdown().await;
                    break;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}

async fn collect_once(
    sensor: &dyn Sensor,
    timeout: Duration,
    permits: &Semaphore,
) -> Result<Sample, SensorError> {
    let deadline = Instant::now() + timeout.min(MAX_SENSOR_DURATION);
    let attempt = async {
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| SensorError::Io("scheduler closed".to_string()))?;
        sensor.collect(deadline).await
    };
    match tokio::time::timeout_at(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(SensorError::Timeout(timeout)),
    }
}

/// First tick after `scheduled` on the sensor's grid that is not already in
/// the past. `None` when the grid runs past what `Instant` can represent.
fn next_tick(scheduled: Instant, interval: Duration, now: Instant) -> Option<Instant> {
    let mut next = scheduled.checked_add(interval)?;
    if next < now {
        let behind = now.duration_since(next).as_nanos() / interval.as_nanos().max(1);
        let skip = u32::try_from(behind).unwrap_or(u32::MAX);
        next = next.checked_add(interval.saturating_mul(skip))?;
        if next < now {
            next = next.checked_add(interval)?;
        }
    }
    Some(next)
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn emit(events: &Option<mpsc::Sender<SchedulerEvent>>, event: SchedulerEvent) {
    if let Some(tx) = events {
        let _ = tx.try_send(event);
    }
}

#[cfg(test)]
mod tests;
