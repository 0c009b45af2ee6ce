use crate::packager::{Batch, OutboundBatch};
use crate::sample::Sample;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use crc32c::crc32c;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const BATCH_PREFIX: &str = "batch-";
const BATCH_SUFFIX: &str = ".bin";
const PENDING_FILE: &str = "pending.bin";
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct SpoolStatus {
    pub dir: String,
    pub batches: usize,
    pub bytes: u64,
    pub max_bytes: u64,
    pub oldest_seq: Option<u64>,
    pub free_bytes: Option<u64>,
}

/// On-disk store of unacknowledged batches, one framed file per sequence number.
///
/// Frame layout: `len: u32 LE | crc32c: u32 LE | payload`.
#[derive(Debug)]
pub struct Spool {
    dir: PathBuf,
    max_bytes: u64,
}

impl Spool {
    pub fn open(dir: &Path, max_bytes: u64) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create spool dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&self, seq: u64, payload: &[u8]) -> Result<()> {
        write_framed(&batch_path(&self.dir, seq), payload)?;
        self.enforce_cap()
    }

    /// Removes an acknowledged batch. Already missing is fine.
    pub fn remove(&self, seq: u64) -> Result<()> {
        match fs::remove_file(batch_path(&self.dir, seq)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("remove spooled batch"),
        }
    }

    /// Loads every intact batch in sequence order. Corrupt files are renamed
    /// aside so they are not retried forever.
    pub fn load(&self) -> Result<Vec<OutboundBatch>> {
        let mut batches = Vec::new();
        for (seq, path) in self.list()? {
            match read_framed(&path) {
                Ok(payload) => {
                    let sample_count = match Batch::decode(&payload) {
                        Ok(batch) => batch.samples.len(),
                        Err(err) => {
                            tracing::warn!(seq, error = %err, "spooled batch does not decode, resending as is");
                            0
                        }
                    };
                    batches.push(OutboundBatch {
                        seq,
                        sample_count,
                        payload: Bytes::from(payload),
                    });
                }
                Err(err) => {
                    tracing::warn!(seq, path = %path.display(), error = %err, "quarantining corrupt spool file");
                    quarantine(&path)?;
                }
            }
        }
        Ok(batches)
    }

    pub fn highest_seq(&self) -> Result<Option<u64>> {
        Ok(self.list()?.last().map(|(seq, _)| *seq))
    }

    /// Writes samples that never made it into a batch so the next start can requeue them.
    pub fn persist_pending(&self, samples: &[Sample]) -> Result<()> {
        let path = self.dir.join(PENDING_FILE);
        if samples.is_empty() {
            return match fs::remove_file(&path) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                    Err(err).context("remove pending samples")
                }
                _ => Ok(()),
            };
        }
        let json = serde_json::to_vec(samples).context("encode pending samples")?;
        write_framed(&path, &json)
    }

    pub fn take_pending(&self) -> Result<Vec<Sample>> {
        let path = self.dir.join(PENDING_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let samples = match read_framed(&path) {
            Ok(payload) => serde_json::from_slice(&payload).context("parse pending samples")?,
            Err(err) => {
                tracing::warn!(error = %err, "pending samples file corrupt, discarding");
                Vec::new()
            }
        };
        fs::remove_file(&path).context("remove pending samples")?;
        Ok(samples)
    }

    pub fn status(&self) -> SpoolStatus {
        let listed = self.list().unwrap_or_default();
        let bytes = listed
            .iter()
            .filter_map(|(_, path)| fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum();
        SpoolStatus {
            dir: self.dir.display().to_string(),
            batches: listed.len(),
            bytes,
            max_bytes: self.max_bytes,
            oldest_seq: listed.first().map(|(seq, _)| *seq),
            free_bytes: free_bytes(&self.dir).ok(),
        }
    }

    fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).context("read spool dir")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(seq) = name.to_str().and_then(parse_batch_name) else {
                continue;
            };
            out.push((seq, entry.path()));
        }
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out)
    }

    fn enforce_cap(&self) -> Result<()> {
        let mut listed: Vec<(u64, PathBuf, u64)> = self
            .list()?
            .into_iter()
            .map(|(seq, path)| {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                (seq, path, size)
            })
            .collect();
        let mut total: u64 = listed.iter().map(|(_, _, size)| size).sum();

        // The newest batch always stays, even if it alone exceeds the cap.
        while total > self.max_bytes && listed.len() > 1 {
            let (seq, path, size) = listed.remove(0);
            fs::remove_file(&path).ok();
            total = total.saturating_sub(size);
            tracing::warn!(seq, size, max_bytes = self.max_bytes, "spool over capacity, dropped oldest batch");
        }
        Ok(())
    }
}

fn batch_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{BATCH_PREFIX}{seq:020}{BATCH_SUFFIX}"))
}

fn parse_batch_name(name: &str) -> Option<u64> {
    name.strip_prefix(BATCH_PREFIX)?
        .strip_suffix(BATCH_SUFFIX)?
        .parse()
        .ok()
}

fn write_framed(path: &Path, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(anyhow!("frame of {} bytes exceeds limit", payload.len()));
    }
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).context("create spool tmp")?;
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(&crc32c(payload).to_le_bytes())?;
    file.write_all(payload)?;
    file.sync_all().context("sync spool tmp")?;
    drop(file);
    fs::rename(&tmp, path).context("rename spool tmp")?;
    Ok(())
}

fn read_framed(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path).context("read spool file")?;
    if raw.len() < FRAME_HEADER_LEN {
        return Err(anyhow!("spool file truncated"));
    }
    let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let crc = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let payload = &raw[FRAME_HEADER_LEN..];
    if len > MAX_FRAME_LEN || payload.len() != len {
        return Err(anyhow!("frame length {len} does not match file size"));
    }
    if crc32c(payload) != crc {
        return Err(anyhow!("frame checksum mismatch"));
    }
    Ok(payload.to_vec())
}

fn quarantine(path: &Path) -> Result<()> {
    let target = path.with_extension("corrupt");
    fs::rename(path, &target).context("quarantine spool file")?;
    Ok(())
}

fn free_bytes(dir: &Path) -> Result<u64> {
    use std::ffi::CString;
    let cpath = CString::new(dir.as_os_str().to_string_lossy().as_bytes().to_vec())
        .context("invalid spool path")?;

    let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out as *mut libc::statvfs) };
    if rc != 0 {
        return Err(anyhow!("statvfs failed"));
    }
    let block = if out.f_frsize > 0 {
        out.f_frsize as u64
    } else {
        out.f_bsize as u64
    };
    Ok((out.f_bavail as u64).saturating_mul(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleValue;
    use tempfile::TempDir;

    #[test]
    fn load_returns_batches_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path(), 1024 * 1024).unwrap();
        spool.store(12, b"twelve").unwrap();
        spool.store(3, b"three").unwrap();
        spool.store(7, b"seven").unwrap();
        spool.remove(7).unwrap();
        spool.remove(7).unwrap();

        let loaded = spool.load().unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![3, 12]);
        assert_eq!(&loaded[0].payload[..], b"three");
        assert_eq!(spool.highest_seq().unwrap(), Some(12));
    }

    #[test]
    fn recovered_batches_keep_their_sample_count() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path(), 1024 * 1024).unwrap();
        let samples = (0..3)
            .map(|n| Sample::new("uptime", SampleValue::Integer(n)))
            .collect();
        let batch = Batch::new("agent-1", 5, samples, Vec::new()).unwrap();
        spool.store(5, &batch.encode().unwrap()).unwrap();

        let loaded = spool.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].seq, 5);
        assert_eq!(loaded[0].sample_count, 3);
    }

    #[test]
    fn corrupt_batches_are_quarantined() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path(), 1024 * 1024).unwrap();
        spool.store(1, b"good").unwrap();
        spool.store(2, b"flipped").unwrap();

        let path = batch_path(dir.path(), 2);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();

        let loaded = spool.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].seq, 1);
        assert!(!path.exists());
        assert!(path.with_extension("corrupt").exists());
    }

    #[test]
    fn cap_drops_oldest_batches() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path(), 250).unwrap();
        for seq in 1..=4 {
            spool.store(seq, &[seq as u8; 100]).unwrap();
        }
        let seqs: Vec<u64> = spool.load().unwrap().iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(spool.status().batches, 2);
    }

    #[test]
    fn pending_samples_round_trip_once() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path(), 1024 * 1024).unwrap();
        let samples = vec![
            Sample::new("load", SampleValue::Float(0.25)),
            Sample::new("load", SampleValue::Float(0.5)),
        ];
        spool.persist_pending(&samples).unwrap();

        assert_eq!(spool.take_pending().unwrap(), samples);
        assert!(spool.take_pending().unwrap().is_empty());
    }
}
