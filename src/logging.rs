use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;

const DEFAULT_FILTER: &str = "info,probe_agent=info";

/// Installs the global subscriber. Logs go to stdout unless `log_file` is set,
/// in which case a background worker writes them to a file capped at
/// `max_size` bytes with one rotated copy. Hold the returned guard until exit
/// so buffered lines are flushed.
pub fn init_tracing(log_file: Option<&Path>, max_size: Option<u64>) -> Result<Option<WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match log_file {
        Some(path) => {
            let file = RotatingFile::open(path, max_size.unwrap_or(u64::MAX))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            builder
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            builder
                .try_init()
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
            if max_size.is_some() {
                tracing::warn!("logs-max_size has no effect without log_file");
            }
            Ok(None)
        }
    }
}

/// Size-capped log file; once a write would cross the cap the current file
/// moves to `<path>.1` and a fresh one is started.
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
}

impl RotatingFile {
    pub fn open(path: &Path, max_size: u64) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = append(path).with_context(|| format!("open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_size: max_size.max(1),
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, rotated_path(&self.path))?;
        self.file = append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}
