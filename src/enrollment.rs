use crate::backoff::Backoff;
use crate::certs::{csr_fingerprint, CertificateStore, Validity};
use crate::error::EnrollmentError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Unenrolled,
    KeyGenerated,
    CsrSubmitted,
    AwaitingSignature,
    Enrolled,
    Expired,
    Revoked,
}

/// Published on every transition. `generation` increases each time the agent
/// becomes enrolled, so observers can tell a fresh certificate from the one
/// they saw rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnrollmentStatus {
    pub state: EnrollmentState,
    pub generation: u64,
    pub not_after: Option<DateTime<Utc>>,
}

/// Server side of enrollment, kept behind a trait so the state machine can be
/// driven without a network.
#[async_trait]
pub trait EnrollmentApi: Send + Sync {
    async fn submit_csr(&self, csr_pem: &str) -> Result<(), EnrollmentError>;

    /// Returns the signed certificate PEM, or `Pending`/`Revoked`/`Rejected`.
    async fn fetch_certificate(&self) -> Result<String, EnrollmentError>;
}

#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    pub agent_id: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub expiry_check_interval: Duration,
    pub renew_before: Duration,
}

/// Read side handed to the sender and the status endpoint.
#[derive(Clone)]
pub struct EnrollmentHandle {
    status: watch::Receiver<EnrollmentStatus>,
    rejected: mpsc::UnboundedSender<u64>,
}

impl EnrollmentHandle {
    pub fn status(&self) -> EnrollmentStatus {
        *self.status.borrow()
    }

    /// The server refused the certificate of `generation`.
    pub fn report_rejected(&self, generation: u64) {
        let _ = self.rejected.send(generation);
    }

    /// Resolves once enrolled with a generation newer than `newer_than`.
    /// `None` means the enrollment task is gone.
    pub async fn wait_enrolled(&self, newer_than: u64) -> Option<EnrollmentStatus> {
        let mut rx = self.status.clone();
        rx.wait_for(|s| s.state == EnrollmentState::Enrolled && s.generation > newer_than)
            .await
            .ok()
            .map(|status| *status)
    }

    /// Handle not backed by a state machine; the caller drives the status.
    #[cfg(test)]
    pub(crate) fn detached(
        initial: EnrollmentStatus,
    ) -> (Self, watch::Sender<EnrollmentStatus>, mpsc::UnboundedReceiver<u64>) {
        let (status_tx, status_rx) = watch::channel(initial);
        let (rejected_tx, rejected_rx) = mpsc::unbounded_channel();
        (
            Self {
                status: status_rx,
                rejected: rejected_tx,
            },
            status_tx,
            rejected_rx,
        )
    }
}

pub struct Enrollment<A> {
    api: A,
    store: CertificateStore,
    config: EnrollmentConfig,
    state: EnrollmentState,
    validity: Option<Validity>,
    generation: u64,
    backoff: Backoff,
    status_tx: watch::Sender<EnrollmentStatus>,
    rejected_rx: mpsc::UnboundedReceiver<u64>,
}

impl<A: EnrollmentApi> Enrollment<A> {
    /// Resumes from whatever the certificate store holds.
    pub fn new(
        api: A,
        store: CertificateStore,
        config: EnrollmentConfig,
    ) -> Result<(Self, EnrollmentHandle), EnrollmentError> {
        let persisted = store.load()?;
        let now = Utc::now();
        let (state, validity) = match persisted.validity {
            Some(validity) if validity.is_current(now, config.renew_before) => {
                (EnrollmentState::Enrolled, Some(validity))
            }
            Some(validity) => (EnrollmentState::Expired, Some(validity)),
            // The server may never have seen this request (`--initialize`, or a
            // crash before submission); resubmitting the same CSR is idempotent.
            None if persisted.cert_pem.is_none()
                && persisted.key_pem.is_some()
                && persisted.csr_pem.is_some() =>
            {
                (EnrollmentState::KeyGenerated, None)
            }
            None => (EnrollmentState::Unenrolled, None),
        };
        let generation = u64::from(state == EnrollmentState::Enrolled);

        let (status_tx, status_rx) = watch::channel(EnrollmentStatus {
            state,
            generation,
            not_after: validity.map(|v| v.not_after),
        });
        let (rejected_tx, rejected_rx) = mpsc::unbounded_channel();
        tracing::info!(state = ?state, certs_dir = %store.dir().display(), "enrollment state restored");

        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        Ok((
            Self {
                api,
                store,
                config,
                state,
                validity,
                generation,
                backoff,
                status_tx,
                rejected_rx,
            },
            EnrollmentHandle {
                status: status_rx,
                rejected: rejected_tx,
            },
        ))
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    fn transition(&mut self, next: EnrollmentState) {
        if next == EnrollmentState::Enrolled {
            self.generation += 1;
        }
        if next != self.state {
            tracing::info!(from = ?self.state, to = ?next, "enrollment transition");
        }
        self.state = next;
        self.status_tx.send_replace(EnrollmentStatus {
            state: next,
            generation: self.generation,
            not_after: self.validity.map(|v| v.not_after),
        });
    }

    /// Performs at most one transition. An error means "wait, then step again";
    /// the state has already been moved wherever the error requires.
    pub async fn step(&mut self) -> Result<(), EnrollmentError> {
        match self.state {
            EnrollmentState::Unenrolled => {
                let csr = self.store.generate_identity(&self.config.agent_id)?;
                tracing::info!(csr_id = %csr_fingerprint(&csr), "generated key and signing request");
                self.transition(EnrollmentState::KeyGenerated);
                Ok(())
            }
            EnrollmentState::KeyGenerated => {
                let Some(csr) = self.store.load()?.csr_pem else {
                    self.transition(EnrollmentState::Unenrolled);
                    return Err(EnrollmentError::Storage("signing request missing".to_string()));
                };
                match self.api.submit_csr(&csr).await {
                    Ok(()) => {
                        tracing::info!(csr_id = %csr_fingerprint(&csr), "signing request submitted");
                        self.transition(EnrollmentState::CsrSubmitted);
                        Ok(())
                    }
                    Err(err @ EnrollmentError::Rejected(_)) => {
                        self.transition(EnrollmentState::Unenrolled);
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
            EnrollmentState::CsrSubmitted | EnrollmentState::AwaitingSignature => {
                self.poll_certificate().await
            }
            EnrollmentState::Enrolled => {
                let current = self
                    .validity
                    .map(|v| v.is_current(Utc::now(), self.config.renew_before))
                    .unwrap_or(false);
                if !current {
                    tracing::warn!(not_after = ?self.validity.map(|v| v.not_after), "client certificate expired or due for renewal");
                    self.transition(EnrollmentState::Expired);
                }
                Ok(())
            }
            EnrollmentState::Expired | EnrollmentState::Revoked => {
                self.store.clear_identity()?;
                self.validity = None;
                self.transition(EnrollmentState::Unenrolled);
                Ok(())
            }
        }
    }

    async fn poll_certificate(&mut self) -> Result<(), EnrollmentError> {
        let pem = match self.api.fetch_certificate().await {
            Ok(pem) => pem,
            Err(EnrollmentError::Pending) => {
                self.transition(EnrollmentState::AwaitingSignature);
                return Err(EnrollmentError::Pending);
            }
            Err(EnrollmentError::Revoked) => {
                tracing::error!("certificate revoked by server, discarding identity");
                self.transition(EnrollmentState::Revoked);
                return Err(EnrollmentError::Revoked);
            }
            Err(err @ EnrollmentError::Rejected(_)) => {
                self.transition(EnrollmentState::Unenrolled);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match self.store.install_certificate(&pem) {
            Ok(validity) if validity.is_current(Utc::now(), Duration::ZERO) => {
                tracing::info!(not_after = %validity.not_after, "client certificate installed");
                self.validity = Some(validity);
                self.transition(EnrollmentState::Enrolled);
                Ok(())
            }
            Ok(_) => {
                self.transition(EnrollmentState::Expired);
                Err(EnrollmentError::Rejected(
                    "issued certificate is outside its validity window".to_string(),
                ))
            }
            Err(EnrollmentError::KeyMismatch) => {
                self.transition(EnrollmentState::Unenrolled);
                Err(EnrollmentError::KeyMismatch)
            }
            Err(err) => Err(err),
        }
    }

    pub fn mark_expired(&mut self, reason: &str) {
        if self.state == EnrollmentState::Enrolled {
            tracing::warn!(reason, generation = self.generation, "client certificate no longer accepted");
            self.transition(EnrollmentState::Expired);
        }
    }

    /// Drives enrollment forever: steps with capped backoff until enrolled, then
    /// watches for expiry and for rejections reported by the sender.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if self.state == EnrollmentState::Enrolled {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(generation) = self.rejected_rx.recv() => {
                        if generation == self.generation {
                            self.mark_expired("server rejected client certificate");
                        }
                    }
                    _ = tokio::time::sleep(self.config.expiry_check_interval) => {
                        if let Err(err) = self.step().await {
                            tracing::warn!(error = %err, "certificate expiry check failed");
                        }
                    }
                }
                continue;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.step() => result,
            };
            match result {
                Ok(()) => {
                    if self.state == EnrollmentState::Enrolled {
                        self.backoff.reset();
                    }
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    if err == EnrollmentError::Pending {
                        tracing::info!(retry_in_ms = delay.as_millis() as u64, "certificate not signed yet");
                    } else {
                        tracing::warn!(
                            state = ?self.state,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "enrollment step failed"
                        );
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!(state = ?self.state, "enrollment stopped");
    }
}
