use crate::sample::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const OVERFLOW_LOG_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    DropOldest,
    RejectNewest,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "drop_oldest" => Ok(Self::DropOldest),
            "reject_newest" => Ok(Self::RejectNewest),
            other => Err(format!("unknown eviction policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    EvictedOldest,
    RejectedNewest,
}

/// Summary of samples a sensor lost to eviction, shipped with the next batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub sensor: String,
    pub count: u64,
    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub capacity: usize,
    pub policy: EvictionPolicy,
    pub accepted: u64,
    pub overflow: u64,
    pub pending_losses: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub policy: EvictionPolicy,
    pub record_gaps: bool,
}

#[derive(Default)]
struct QueueState {
    samples: VecDeque<Sample>,
    losses: Vec<LossRecord>,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    accepted: AtomicU64,
    overflow: AtomicU64,
}

/// Bounded FIFO between sensor invocations and the packager.
///
/// `push` never waits on the consumer; a full queue resolves through the
/// configured eviction policy instead.
#[derive(Clone)]
pub struct SampleQueue {
    inner: Arc<QueueInner>,
}

impl SampleQueue {
    pub fn new(config: QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            inner: Arc::new(QueueInner {
                config: QueueConfig { capacity, ..config },
                state: Mutex::new(QueueState {
                    samples: VecDeque::with_capacity(capacity.min(4096)),
                    losses: Vec::new(),
                }),
                notify: Notify::new(),
                accepted: AtomicU64::new(0),
                overflow: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation leaves the state consistent, so a poisoned lock is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, sample: Sample) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.samples.len() < self.inner.config.capacity {
                state.samples.push_back(sample);
                PushOutcome::Accepted
            } else {
                match self.inner.config.policy {
                    EvictionPolicy::DropOldest => {
                        if let Some(evicted) = state.samples.pop_front() {
                            self.record_loss(&mut state, &evicted);
                        }
                        state.samples.push_back(sample);
                        PushOutcome::EvictedOldest
                    }
                    EvictionPolicy::RejectNewest => {
                        self.record_loss(&mut state, &sample);
                        PushOutcome::RejectedNewest
                    }
                }
            }
        };

        if outcome != PushOutcome::RejectedNewest {
            self.inner.accepted.fetch_add(1, Ordering::Relaxed);
            self.inner.notify.notify_one();
        }
        if outcome != PushOutcome::Accepted {
            let total = self.inner.overflow.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % OVERFLOW_LOG_EVERY == 0 {
                tracing::warn!(
                    overflow_total = total,
                    capacity = self.inner.config.capacity,
                    policy = ?self.inner.config.policy,
                    "sample queue full, evicting"
                );
            }
        }
        outcome
    }

    fn record_loss(&self, state: &mut QueueState, lost: &Sample) {
        if !self.inner.config.record_gaps {
            return;
        }
        match state.losses.iter_mut().find(|loss| loss.sensor == lost.sensor) {
            Some(loss) => {
                loss.count += 1;
                loss.first_ts = loss.first_ts.min(lost.timestamp);
                loss.last_ts = loss.last_ts.max(lost.timestamp);
            }
            None => state.losses.push(LossRecord {
                sensor: lost.sensor.clone(),
                count: 1,
                first_ts: lost.timestamp,
                last_ts: lost.timestamp,
            }),
        }
    }

    /// Waits until `max` samples are queued or `flush_interval` elapses, then
    /// removes up to `max` samples from the head. May return an empty batch.
    pub async fn pop_batch(&self, max: usize, flush_interval: Duration) -> Vec<Sample> {
        let max = max.max(1);
        let deadline = Instant::now() + flush_interval;
        loop {
            {
                let mut state = self.lock();
                if state.samples.len() >= max {
                    return state.samples.drain(..max).collect();
                }
            }
            if tokio::time::timeout_at(deadline, self.inner.notify.notified())
                .await
                .is_err()
            {
                let mut state = self.lock();
                let take = state.samples.len().min(max);
                return state.samples.drain(..take).collect();
            }
        }
    }

    pub fn take_losses(&self) -> Vec<LossRecord> {
        std::mem::take(&mut self.lock().losses)
    }

    pub fn drain_all(&self) -> Vec<Sample> {
        self.lock().samples.drain(..).collect()
    }

    /// Puts previously taken samples back at the head, ahead of anything queued
    /// since. Older samples are evicted first if the result would overflow.
    pub fn restore(&self, samples: Vec<Sample>) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.lock();
        for sample in samples.into_iter().rev() {
            state.samples.push_front(sample);
        }
        while state.samples.len() > self.inner.config.capacity {
            if let Some(evicted) = state.samples.pop_front() {
                self.inner.overflow.fetch_add(1, Ordering::Relaxed);
                self.record_loss(&mut state, &evicted);
            }
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            depth: state.samples.len(),
            capacity: self.inner.config.capacity,
            policy: self.inner.config.policy,
            accepted: self.inner.accepted.load(Ordering::Relaxed),
            overflow: self.inner.overflow.load(Ordering::Relaxed),
            pending_losses: state.losses.len(),
        }
    }
}
