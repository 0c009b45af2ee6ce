use crate::queue::{LossRecord, SampleQueue};
use crate::sample::{Sample, SCHEMA_VERSION};
use crate::spool::Spool;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crc32c::crc32c;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SEQUENCE_FILE: &str = "sequence.json";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to encode batch: {0}")]
    Encode(String),
    #[error("failed to decode batch: {0}")]
    Decode(String),
    #[error("batch checksum mismatch (header {expected:08x}, computed {actual:08x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Sequenced, checksummed group of samples. Encoded as gzip-compressed JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub agent_id: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub checksum: u32,
    pub schema_version: u32,
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub losses: Vec<LossRecord>,
}

impl Batch {
    pub fn new(agent_id: &str, seq: u64, samples: Vec<Sample>, losses: Vec<LossRecord>) -> Result<Self, BatchError> {
        let checksum = samples_checksum(&samples)?;
        Ok(Self {
            agent_id: agent_id.to_string(),
            seq,
            created_at: Utc::now(),
            checksum,
            schema_version: SCHEMA_VERSION,
            samples,
            losses,
        })
    }

    pub fn encode(&self) -> Result<Bytes, BatchError> {
        let json = serde_json::to_vec(self).map_err(|err| BatchError::Encode(err.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|err| BatchError::Encode(err.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|err| BatchError::Encode(err.to_string()))?;
        Ok(Bytes::from(compressed))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BatchError> {
        let mut json = Vec::new();
        GzDecoder::new(payload)
            .read_to_end(&mut json)
            .map_err(|err| BatchError::Decode(err.to_string()))?;
        let batch: Batch =
            serde_json::from_slice(&json).map_err(|err| BatchError::Decode(err.to_string()))?;
        let actual = samples_checksum(&batch.samples)?;
        if actual != batch.checksum {
            return Err(BatchError::ChecksumMismatch {
                expected: batch.checksum,
                actual,
            });
        }
        Ok(batch)
    }
}

fn samples_checksum(samples: &[Sample]) -> Result<u32, BatchError> {
    let canonical = serde_json::to_vec(samples).map_err(|err| BatchError::Encode(err.to_string()))?;
    Ok(crc32c(&canonical))
}

/// An encoded batch on its way to the sender. Retries reuse `payload` as is.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub seq: u64,
    pub sample_count: usize,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceDisk {
    next_seq: u64,
}

/// Persisted per-agent batch sequence. A number is written to disk before it is
/// handed out, so restarts never reuse one.
#[derive(Debug)]
pub struct SequenceCounter {
    path: PathBuf,
    next: u64,
}

impl SequenceCounter {
    pub fn load(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create state dir {}", state_dir.display()))?;
        let path = state_dir.join(SEQUENCE_FILE);
        let next = if path.exists() {
            let raw = fs::read_to_string(&path).context("read sequence state")?;
            let disk: SequenceDisk = serde_json::from_str(&raw).context("parse sequence state")?;
            disk.next_seq.max(1)
        } else {
            1
        };
        Ok(Self { path, next })
    }

    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Moves the counter beyond `seq`, e.g. past batches found in the spool.
    pub fn advance_past(&mut self, seq: u64) -> Result<()> {
        if seq >= self.next {
            self.persist(seq + 1)?;
            self.next = seq + 1;
        }
        Ok(())
    }

    pub fn next_seq(&mut self) -> Result<u64> {
        let seq = self.next;
        self.persist(seq + 1)?;
        self.next = seq + 1;
        Ok(seq)
    }

    fn persist(&self, next_seq: u64) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(&SequenceDisk { next_seq })?)
            .context("write sequence state tmp")?;
        fs::rename(&tmp, &self.path).context("rename sequence state")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PackagerConfig {
    pub agent_id: String,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

/// Drains the queue into sequenced batches until cancelled.
pub async fn run_packager(
    queue: SampleQueue,
    mut counter: SequenceCounter,
    spool: Option<Arc<Spool>>,
    tx: mpsc::Sender<OutboundBatch>,
    config: PackagerConfig,
    cancel: CancellationToken,
) {
    loop {
        let samples = tokio::select! {
            _ = cancel.cancelled() => break,
            samples = queue.pop_batch(config.max_batch_size, config.flush_interval) => samples,
        };
        if samples.is_empty() {
            continue;
        }

        let seq = match counter.next_seq() {
            Ok(seq) => seq,
            Err(err) => {
                tracing::error!(error = %err, "failed to persist batch sequence, holding samples");
                queue.restore(samples);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.flush_interval) => continue,
                }
            }
        };

        let losses = queue.take_losses();
        let batch = match Batch::new(&config.agent_id, seq, samples, losses) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(seq, error = %err, "failed to build batch, dropping");
                continue;
            }
        };
        let payload = match batch.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(seq, error = %err, "failed to encode batch, dropping");
                continue;
            }
        };

        let spooled = match &spool {
            Some(spool) => match spool.store(seq, &payload) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(seq, error = %err, "failed to spool batch, keeping it in memory only");
                    false
                }
            },
            None => false,
        };

        tracing::debug!(
            seq,
            samples = batch.samples.len(),
            losses = batch.losses.len(),
            bytes = payload.len(),
            "batch packaged"
        );
        let outbound = OutboundBatch {
            seq,
            sample_count: batch.samples.len(),
            payload,
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                if !spooled {
                    queue.restore(batch.samples);
                }
                break;
            }
            res = tx.send(outbound) => {
                if res.is_err() {
                    tracing::warn!(seq, "sender stopped, packager exiting");
                    if !spooled {
                        queue.restore(batch.samples);
                    }
                    break;
                }
            }
        }
    }
    tracing::info!(next_seq = counter.peek(), "packager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EvictionPolicy, QueueConfig};
    use crate::sample::SampleValue;
    use tempfile::TempDir;

    fn samples() -> Vec<Sample> {
        vec![
            Sample::new("disk", SampleValue::Float(41.5)),
            Sample::new("disk", SampleValue::Float(41.7)),
            Sample::new("port", SampleValue::Json(serde_json::json!({"is_open": true}))),
        ]
    }

    #[test]
    fn decode_reproduces_encoded_batch() {
        let batch = Batch::new("agent-1", 42, samples(), Vec::new()).unwrap();
        let payload = batch.encode().unwrap();
        let decoded = Batch::decode(&payload).unwrap();
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.samples, batch.samples);
        assert_eq!(decoded, batch);
    }

    #[test]
    fn decode_rejects_tampered_samples() {
        let mut batch = Batch::new("agent-1", 7, samples(), Vec::new()).unwrap();
        batch.samples.pop();
        let payload = batch.encode().unwrap();
        assert!(matches!(
            Batch::decode(&payload),
            Err(BatchError::ChecksumMismatch { .. })
        ));
        assert!(matches!(Batch::decode(b"not gzip"), Err(BatchError::Decode(_))));
    }

    #[test]
    fn sequence_survives_restart_without_reuse() {
        let dir = TempDir::new().unwrap();
        let mut counter = SequenceCounter::load(dir.path()).unwrap();
        assert_eq!(counter.next_seq().unwrap(), 1);
        assert_eq!(counter.next_seq().unwrap(), 2);
        drop(counter);

        let mut counter = SequenceCounter::load(dir.path()).unwrap();
        assert_eq!(counter.next_seq().unwrap(), 3);
        counter.advance_past(10).unwrap();
        counter.advance_past(4).unwrap();
        drop(counter);

        let mut counter = SequenceCounter::load(dir.path()).unwrap();
        assert_eq!(counter.next_seq().unwrap(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn packager_emits_strictly_increasing_batches() {
        let dir = TempDir::new().unwrap();
        let queue = SampleQueue::new(QueueConfig {
            capacity: 100,
            policy: EvictionPolicy::DropOldest,
            record_gaps: true,
        });
        for n in 0..7 {
            queue.push(Sample::new("load", SampleValue::Integer(n)));
        }
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_packager(
            queue.clone(),
            SequenceCounter::load(dir.path()).unwrap(),
            None,
            tx,
            PackagerConfig {
                agent_id: "agent-1".to_string(),
                max_batch_size: 3,
                flush_interval: Duration::from_millis(500),
            },
            cancel.clone(),
        ));

        let mut seqs = Vec::new();
        let mut values = Vec::new();
        for _ in 0..3 {
            let outbound = rx.recv().await.unwrap();
            let batch = Batch::decode(&outbound.payload).unwrap();
            assert_eq!(batch.seq, outbound.seq);
            assert_eq!(batch.samples.len(), outbound.sample_count);
            seqs.push(batch.seq);
            values.extend(batch.samples.into_iter().map(|s| s.value));
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(seqs, vec![1, 2, 3]);
        let expected: Vec<SampleValue> = (0..7).map(SampleValue::Integer).collect();
        assert_eq!(values, expected);
    }
}
