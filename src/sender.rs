use crate::backoff::Backoff;
use crate::enrollment::{EnrollmentHandle, EnrollmentState};
use crate::error::TransportError;
use crate::packager::OutboundBatch;
use crate::spool::Spool;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Delivers one encoded batch and returns the sequence number the server
/// acknowledged.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, batch: &OutboundBatch) -> Result<u64, TransportError>;

    /// Called whenever a new certificate generation becomes available.
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct SenderStats {
    pub sent_batches: AtomicU64,
    pub sent_samples: AtomicU64,
    pub retries: AtomicU64,
    pub certificate_rejections: AtomicU64,
    pub last_acked_seq: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderSnapshot {
    pub sent_batches: u64,
    pub sent_samples: u64,
    pub retries: u64,
    pub certificate_rejections: u64,
    pub last_acked_seq: Option<u64>,
    pub last_error: Option<String>,
}

impl SenderStats {
    pub fn new() -> Self {
        Self {
            sent_batches: AtomicU64::new(0),
            sent_samples: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            certificate_rejections: AtomicU64::new(0),
            last_acked_seq: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> SenderSnapshot {
        let acked = self.last_acked_seq.load(Ordering::Relaxed);
        SenderSnapshot {
            sent_batches: self.sent_batches.load(Ordering::Relaxed),
            sent_samples: self.sent_samples.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            certificate_rejections: self.certificate_rejections.load(Ordering::Relaxed),
            last_acked_seq: (acked > 0).then_some(acked),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for SenderStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub initial_retry: Duration,
    pub max_retry_interval: Duration,
}

/// Single-flight delivery: one batch is outstanding at a time and is resent
/// byte for byte until the server acknowledges its sequence number.
pub struct Sender {
    transport: Arc<dyn BatchTransport>,
    enrollment: EnrollmentHandle,
    spool: Option<Arc<Spool>>,
    backoff: Backoff,
    stats: Arc<SenderStats>,
    connected_generation: Option<u64>,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn BatchTransport>,
        enrollment: EnrollmentHandle,
        spool: Option<Arc<Spool>>,
        config: SenderConfig,
    ) -> Self {
        Self {
            transport,
            enrollment,
            spool,
            backoff: Backoff::new(config.initial_retry, config.max_retry_interval),
            stats: Arc::new(SenderStats::new()),
            connected_generation: None,
        }
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Sends `backlog` (spooled batches from a previous run) first, then
    /// whatever the packager produces, until cancelled or the channel closes.
    pub async fn run(
        mut self,
        backlog: Vec<OutboundBatch>,
        mut rx: mpsc::Receiver<OutboundBatch>,
        cancel: CancellationToken,
    ) {
        if !backlog.is_empty() {
            tracing::info!(batches = backlog.len(), "resending spooled batches");
        }
        for batch in backlog {
            if !self.deliver(&batch, &cancel).await {
                tracing::info!("sender stopped during backlog");
                return;
            }
        }

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            if !self.deliver(&batch, &cancel).await {
                if self.spool.is_none() {
                    tracing::warn!(seq = batch.seq, samples = batch.sample_count, "unsent batch dropped at shutdown");
                }
                break;
            }
        }
        tracing::info!(
            sent = self.stats.sent_batches.load(Ordering::Relaxed),
            "sender stopped"
        );
    }

    /// Returns false only when cancelled before the batch was acknowledged.
    async fn deliver(&mut self, batch: &OutboundBatch, cancel: &CancellationToken) -> bool {
        let mut rejected_generation = None;
        loop {
            let Some(generation) = self.ready(rejected_generation.take(), cancel).await else {
                return false;
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                outcome = self.transport.send(batch) => outcome,
            };

            let delay = match outcome {
                Ok(acked) if acked == batch.seq => {
                    self.acknowledged(batch);
                    return true;
                }
                Ok(acked) => {
                    let err = TransportError::Protocol(format!(
                        "server acknowledged seq {acked}, expected {}",
                        batch.seq
                    ));
                    let delay = self.backoff.next_delay();
                    tracing::warn!(seq = batch.seq, error = %err, retry_in_ms = delay.as_millis() as u64, "batch not acknowledged");
                    self.stats.record_error(err.to_string());
                    delay
                }
                Err(err @ TransportError::CertificateRejected(_)) => {
                    tracing::warn!(seq = batch.seq, generation, error = %err, "pausing delivery until re-enrolled");
                    self.stats.certificate_rejections.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_error(err.to_string());
                    self.enrollment.report_rejected(generation);
                    rejected_generation = Some(generation);
                    continue;
                }
                Err(err) if err.is_transient() => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(seq = batch.seq, error = %err, retry_in_ms = delay.as_millis() as u64, "batch delivery failed");
                    self.stats.record_error(err.to_string());
                    delay
                }
                Err(err) => {
                    let delay = self.backoff.max();
                    tracing::error!(seq = batch.seq, error = %err, retry_in_ms = delay.as_millis() as u64, "server refused batch");
                    self.stats.record_error(err.to_string());
                    delay
                }
            };

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Waits for a usable certificate and rebuilds the transport when its
    /// generation changed. Returns the generation to send under.
    async fn ready(&mut self, rejected: Option<u64>, cancel: &CancellationToken) -> Option<u64> {
        let mut rejected = rejected;
        loop {
            let current = self.enrollment.status();
            let status = match rejected.take() {
                Some(generation) => self.wait_enrolled(generation, cancel).await?,
                None if current.state == EnrollmentState::Enrolled => current,
                None => self.wait_enrolled(current.generation, cancel).await?,
            };

            if self.connected_generation == Some(status.generation) {
                return Some(status.generation);
            }
            match self.transport.reconnect().await {
                Ok(()) => {
                    tracing::info!(generation = status.generation, "sender using new client certificate");
                    self.connected_generation = Some(status.generation);
                    return Some(status.generation);
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "failed to build data channel");
                    self.stats.record_error(err.to_string());
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn wait_enrolled(
        &self,
        newer_than: u64,
        cancel: &CancellationToken,
    ) -> Option<crate::enrollment::EnrollmentStatus> {
        tracing::debug!(newer_than, "waiting for enrollment");
        tokio::select! {
            _ = cancel.cancelled() => None,
            status = self.enrollment.wait_enrolled(newer_than) => {
                if status.is_none() {
                    tracing::error!("enrollment task ended, sender cannot continue");
                }
                status
            }
        }
    }

    fn acknowledged(&mut self, batch: &OutboundBatch) {
        self.backoff.reset();
        self.stats.sent_batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .sent_samples
            .fetch_add(batch.sample_count as u64, Ordering::Relaxed);
        self.stats.last_acked_seq.store(batch.seq, Ordering::Relaxed);
        self.stats.clear_error();
        tracing::debug!(seq = batch.seq, samples = batch.sample_count, "batch acknowledged");

        if let Some(spool) = &self.spool {
            if let Err(err) = spool.remove(batch.seq) {
                tracing::warn!(seq = batch.seq, error = %err, "failed to remove acknowledged batch from spool");
            }
        }
    }
}
