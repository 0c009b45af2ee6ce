use super::{param_str, param_u64, Sensor};
use crate::descriptor::SensorParams;
use crate::error::{ConfigError, SensorError};
use crate::sample::{Sample, SampleValue};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;

const DEFAULT_MAX_LINES: u64 = 100;

/// Tails a log file, emitting the complete lines appended since the last call.
pub struct LogReadSensor {
    name: String,
    path: PathBuf,
    max_lines: usize,
    offset: Mutex<u64>,
}

impl LogReadSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: PathBuf::new(),
            max_lines: DEFAULT_MAX_LINES as usize,
            offset: Mutex::new(0),
        }
    }

    async fn read_new_lines(&self, offset: u64) -> Result<(Vec<String>, u64), SensorError> {
        let mut file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        // Shrunk since last read: rotated or truncated.
        let mut position = if len < offset { 0 } else { offset };
        file.seek(SeekFrom::Start(position)).await?;

        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < self.max_lines {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await?;
            if read == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            position += read as u64;
            // Logs are not guaranteed to be UTF-8; bad bytes become U+FFFD.
            let line = String::from_utf8_lossy(&buf);
            lines.push(line.trim_end_matches(&['\r', '\n'][..]).to_string());
        }
        Ok((lines, position))
    }
}

#[async_trait]
impl Sensor for LogReadSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &SensorParams) -> Result<(), ConfigError> {
        self.path = PathBuf::from(param_str(params, "filename")?);
        let max_lines = param_u64(params, "max_lines", Some(DEFAULT_MAX_LINES))?;
        if max_lines == 0 {
            return Err(ConfigError::invalid("max_lines", "must be greater than zero"));
        }
        self.max_lines = max_lines as usize;
        Ok(())
    }

    async fn collect(&self, deadline: Instant) -> Result<Sample, SensorError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let mut offset = self.offset.lock().await;
        let (lines, next) = tokio::time::timeout_at(deadline, self.read_new_lines(*offset))
            .await
            .map_err(|_| SensorError::Timeout(budget))??;
        *offset = next;
        Ok(Sample::new(
            &self.name,
            SampleValue::Json(serde_json::json!({ "lines": lines, "offset": next })),
        ))
    }
}
