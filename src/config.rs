use crate::cli::Args;
use crate::enrollment::EnrollmentConfig;
use crate::error::ConfigError;
use crate::packager::PackagerConfig;
use crate::queue::{EvictionPolicy, QueueConfig};
use crate::scheduler::SchedulerConfig;
use crate::sender::SenderConfig;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const ENV_PREFIX: &str = "PROBE_AGENT_";
const AGENT_ID_HEX_LEN: usize = 40;

/// Agent configuration file as written on disk. Every key is optional here;
/// defaults and validation happen in [`Config::resolve`].
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub run: Option<bool>,
    #[serde(alias = "sensors-config")]
    pub sensors_config: Option<PathBuf>,
    #[serde(alias = "webapi-url")]
    pub webapi_url: Option<String>,
    #[serde(alias = "logs-max_size", alias = "logs-max-size")]
    pub logs_max_size: Option<u64>,
    pub agent_id: Option<String>,
    pub certs_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
    pub queue_capacity: Option<usize>,
    pub eviction: Option<String>,
    pub record_gaps: Option<bool>,
    pub max_batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub max_inflight_batches: Option<usize>,
    pub max_concurrent_sensors: Option<usize>,
    pub shutdown_grace_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub initial_retry_ms: Option<u64>,
    pub max_retry_interval_ms: Option<u64>,
    pub enrollment_max_backoff_ms: Option<u64>,
    pub expiry_check_interval_secs: Option<u64>,
    pub renew_before_secs: Option<u64>,
    pub max_spool_bytes: Option<u64>,
    pub status_bind: Option<String>,
    pub log_file: Option<PathBuf>,
    pub max_clock_skew_secs: Option<u64>,
    pub remote_config_interval_secs: Option<u64>,
    pub report_errors: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Applies `PROBE_AGENT_<KEY>` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let env = EnvSource { lookup };
        env.bool("RUN", &mut self.run)?;
        env.path("SENSORS_CONFIG", &mut self.sensors_config);
        env.string("WEBAPI_URL", &mut self.webapi_url);
        env.number("LOGS_MAX_SIZE", &mut self.logs_max_size)?;
        env.string("AGENT_ID", &mut self.agent_id);
        env.path("CERTS_DIR", &mut self.certs_dir);
        env.path("STATE_DIR", &mut self.state_dir);
        env.path("SPOOL_DIR", &mut self.spool_dir);
        env.number("QUEUE_CAPACITY", &mut self.queue_capacity)?;
        env.string("EVICTION", &mut self.eviction);
        env.bool("RECORD_GAPS", &mut self.record_gaps)?;
        env.number("MAX_BATCH_SIZE", &mut self.max_batch_size)?;
        env.number("FLUSH_INTERVAL_MS", &mut self.flush_interval_ms)?;
        env.number("MAX_INFLIGHT_BATCHES", &mut self.max_inflight_batches)?;
        env.number("MAX_CONCURRENT_SENSORS", &mut self.max_concurrent_sensors)?;
        env.number("SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms)?;
        env.number("REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        env.number("INITIAL_RETRY_MS", &mut self.initial_retry_ms)?;
        env.number("MAX_RETRY_INTERVAL_MS", &mut self.max_retry_interval_ms)?;
        env.number("ENROLLMENT_MAX_BACKOFF_MS", &mut self.enrollment_max_backoff_ms)?;
        env.number("EXPIRY_CHECK_INTERVAL_SECS", &mut self.expiry_check_interval_secs)?;
        env.number("RENEW_BEFORE_SECS", &mut self.renew_before_secs)?;
        env.number("MAX_SPOOL_BYTES", &mut self.max_spool_bytes)?;
        env.string("STATUS_BIND", &mut self.status_bind);
        env.path("LOG_FILE", &mut self.log_file);
        env.number("MAX_CLOCK_SKEW_SECS", &mut self.max_clock_skew_secs)?;
        env.number("REMOTE_CONFIG_INTERVAL_SECS", &mut self.remote_config_interval_secs)?;
        env.bool("REPORT_ERRORS", &mut self.report_errors)?;
        Ok(())
    }

    /// Command-line flags win over file and environment.
    pub fn apply_args(&mut self, args: &Args) {
        if args.run {
            self.run = Some(true);
        }
        if let Some(url) = &args.webapi_url {
            self.webapi_url = Some(url.clone());
        }
        if let Some(size) = args.logs_max_size {
            self.logs_max_size = Some(size);
        }
    }
}

struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvSource<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, slot: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            *slot = Some(value);
        }
    }

    fn path(&self, key: &str, slot: &mut Option<PathBuf>) {
        if let Some(value) = self.get(key) {
            *slot = Some(PathBuf::from(value));
        }
    }

    fn number<T: std::str::FromStr>(&self, key: &str, slot: &mut Option<T>) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            let parsed = value
                .parse::<T>()
                .map_err(|_| ConfigError::invalid(format!("{ENV_PREFIX}{key}"), format!("`{value}` is not a number")))?;
            *slot = Some(parsed);
        }
        Ok(())
    }

    fn bool(&self, key: &str, slot: &mut Option<bool>) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            let parsed = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::invalid(
                        format!("{ENV_PREFIX}{key}"),
                        format!("`{value}` is not a boolean"),
                    ))
                }
            };
            *slot = Some(parsed);
        }
        Ok(())
    }
}

/// Validated, immutable agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub run: bool,
    pub sensors_config: Option<PathBuf>,
    pub webapi_url: Url,
    pub logs_max_size: Option<u64>,
    pub agent_id: String,
    pub certs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub spool_dir: Option<PathBuf>,
    pub queue_capacity: usize,
    pub eviction: EvictionPolicy,
    pub record_gaps: bool,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub max_inflight_batches: usize,
    pub max_concurrent_sensors: usize,
    pub shutdown_grace: Duration,
    pub request_timeout: Duration,
    pub initial_retry: Duration,
    pub max_retry_interval: Duration,
    pub enrollment_max_backoff: Duration,
    pub expiry_check_interval: Duration,
    pub renew_before: Duration,
    pub max_spool_bytes: u64,
    pub status_bind: Option<SocketAddr>,
    pub log_file: Option<PathBuf>,
    pub max_clock_skew: Duration,
    /// Unset: the sensor set only changes on SIGHUP.
    pub remote_config_interval: Option<Duration>,
    pub report_errors: bool,
}

impl Config {
    /// File (if given), then `.env`/process environment, then flags.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        file.apply_env(&|key: &str| env::var(key).ok())?;
        file.apply_args(args);
        let base_dir = args
            .config
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::resolve(file, &base_dir)
    }

    /// Fills defaults and validates. `base_dir` anchors a relative
    /// `sensors-config`.
    pub fn resolve(file: FileConfig, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw_url = file
            .webapi_url
            .ok_or_else(|| ConfigError::Missing("webapi-url".to_string()))?;
        let webapi_url = Url::parse(&raw_url).map_err(|err| ConfigError::invalid("webapi-url", err.to_string()))?;
        if webapi_url.scheme() != "https" {
            return Err(ConfigError::invalid("webapi-url", "collector must be reached over https"));
        }
        if webapi_url.host_str().is_none() {
            return Err(ConfigError::invalid("webapi-url", "missing host"));
        }

        let agent_id = match file.agent_id {
            Some(id) => {
                validate_agent_id(&id)?;
                id
            }
            None => default_agent_id(),
        };

        let eviction = match file.eviction {
            Some(raw) => raw
                .parse::<EvictionPolicy>()
                .map_err(|message| ConfigError::invalid("eviction", message))?,
            None => EvictionPolicy::DropOldest,
        };

        let status_bind = file
            .status_bind
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .map_err(|err| ConfigError::invalid("status_bind", err.to_string()))
            })
            .transpose()?;

        let sensors_config = file.sensors_config.map(|path| {
            if path.is_relative() {
                base_dir.join(path)
            } else {
                path
            }
        });

        let initial_retry = millis(file.initial_retry_ms, 1_000, "initial_retry_ms")?;
        let max_retry_interval = millis(file.max_retry_interval_ms, 300_000, "max_retry_interval_ms")?;
        if max_retry_interval < initial_retry {
            return Err(ConfigError::invalid(
                "max_retry_interval_ms",
                "must not be smaller than initial_retry_ms",
            ));
        }

        Ok(Self {
            run: file.run.unwrap_or(false),
            sensors_config,
            webapi_url,
            logs_max_size: file.logs_max_size.filter(|size| *size > 0),
            agent_id,
            certs_dir: file.certs_dir.unwrap_or_else(|| PathBuf::from("./certs")),
            state_dir: file.state_dir.unwrap_or_else(|| PathBuf::from("./state")),
            spool_dir: file.spool_dir,
            queue_capacity: positive(file.queue_capacity, 10_000, "queue_capacity")?,
            eviction,
            record_gaps: file.record_gaps.unwrap_or(true),
            max_batch_size: positive(file.max_batch_size, 250, "max_batch_size")?,
            flush_interval: millis(file.flush_interval_ms, 1_000, "flush_interval_ms")?,
            max_inflight_batches: positive(file.max_inflight_batches, 8, "max_inflight_batches")?,
            max_concurrent_sensors: positive(file.max_concurrent_sensors, 16, "max_concurrent_sensors")?,
            shutdown_grace: Duration::from_millis(file.shutdown_grace_ms.unwrap_or(5_000)),
            request_timeout: millis(file.request_timeout_ms, 30_000, "request_timeout_ms")?,
            initial_retry,
            max_retry_interval,
            enrollment_max_backoff: millis(file.enrollment_max_backoff_ms, 600_000, "enrollment_max_backoff_ms")?,
            expiry_check_interval: Duration::from_secs(positive(
                file.expiry_check_interval_secs,
                86_400,
                "expiry_check_interval_secs",
            )?),
            renew_before: Duration::from_secs(file.renew_before_secs.unwrap_or(7 * 86_400)),
            max_spool_bytes: positive(file.max_spool_bytes, 256 * 1024 * 1024, "max_spool_bytes")?,
            status_bind,
            log_file: file.log_file,
            max_clock_skew: Duration::from_secs(file.max_clock_skew_secs.unwrap_or(600)),
            remote_config_interval: match file.remote_config_interval_secs {
                Some(0) => {
                    return Err(ConfigError::invalid(
                        "remote_config_interval_secs",
                        "must be greater than zero",
                    ))
                }
                secs => secs.map(Duration::from_secs),
            },
            report_errors: file.report_errors.unwrap_or(true),
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
            policy: self.eviction,
            record_gaps: self.record_gaps,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent_sensors,
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn packager_config(&self) -> PackagerConfig {
        PackagerConfig {
            agent_id: self.agent_id.clone(),
            max_batch_size: self.max_batch_size,
            flush_interval: self.flush_interval,
        }
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            initial_retry: self.initial_retry,
            max_retry_interval: self.max_retry_interval,
        }
    }

    pub fn enrollment_config(&self) -> EnrollmentConfig {
        EnrollmentConfig {
            agent_id: self.agent_id.clone(),
            initial_backoff: self.initial_retry,
            max_backoff: self.enrollment_max_backoff,
            expiry_check_interval: self.expiry_check_interval,
            renew_before: self.renew_before,
        }
    }
}

fn positive<T>(value: Option<T>, default: T, key: &str) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + Copy,
{
    let value = value.unwrap_or(default);
    if value <= T::default() {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn millis(value: Option<u64>, default: u64, key: &str) -> Result<Duration, ConfigError> {
    positive(value, default, key).map(Duration::from_millis)
}

fn validate_agent_id(id: &str) -> Result<(), ConfigError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "agent_id",
            "use 1-64 characters from [A-Za-z0-9._-]",
        ))
    }
}

/// Stable identifier derived from the host name.
pub fn default_agent_id() -> String {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    agent_id_for_host(&hostname)
}

fn agent_id_for_host(hostname: &str) -> String {
    let digest = hex::encode(Sha256::digest(hostname.trim().as_bytes()));
    digest[..AGENT_ID_HEX_LEN].to_string()
}
