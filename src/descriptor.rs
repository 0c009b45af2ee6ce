use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::num::NonZeroU32;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub type SensorParams = serde_json::Map<String, serde_json::Value>;

const MAX_NAME_LEN: usize = 32;

/// Upper bound for intervals and timeouts.
pub const MAX_SENSOR_DURATION: Duration = Duration::from_secs(365 * 86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "limit")]
pub enum FailurePolicy {
    Skip,
    DisableAfter(NonZeroU32),
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw == "skip" {
            return Ok(Self::Skip);
        }
        if let Some(limit) = raw.strip_prefix("disable_after:") {
            let limit = limit
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(NonZeroU32::new)
                .ok_or_else(|| {
                    ConfigError::invalid("on_failure", format!("bad failure limit in `{raw}`"))
                })?;
            return Ok(Self::DisableAfter(limit));
        }
        Err(ConfigError::invalid(
            "on_failure",
            format!("expected `skip` or `disable_after:<N>`, got `{raw}`"),
        ))
    }
}

/// Validated, immutable description of one configured sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    pub name: String,
    pub kind: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub on_failure: FailurePolicy,
    pub params: SensorParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn resolve(&self, key: &str) -> Result<Duration, ConfigError> {
        let duration = match self {
            Self::Seconds(secs) => Duration::from_secs(*secs),
            Self::Text(text) => parse_duration(text).map_err(|msg| ConfigError::invalid(key, msg))?,
        };
        if duration.is_zero() {
            return Err(ConfigError::invalid(key, "must be greater than zero"));
        }
        if duration > MAX_SENSOR_DURATION {
            return Err(ConfigError::invalid(key, "must not exceed 365d"));
        }
        Ok(duration)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFields {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    interval: RawDuration,
    #[serde(default)]
    timeout: Option<RawDuration>,
    #[serde(default)]
    on_failure: Option<String>,
    #[serde(default)]
    params: SensorParams,
}

/// One `[[sensor]]` table. Name and type are lifted out even when the rest of
/// the table does not deserialize, so a broken entry is disabled on its own.
#[derive(Debug, Clone)]
pub struct RawDescriptor {
    pub name: String,
    pub kind: String,
    fields: Result<DescriptorFields, String>,
}

impl RawDescriptor {
    fn from_parts<E: Display>(
        index: usize,
        name: Option<&str>,
        kind: Option<&str>,
        fields: Result<DescriptorFields, E>,
    ) -> Self {
        Self {
            // Unnamed entries get a placeholder that no valid name can collide with.
            name: name.map_or_else(|| format!("sensor#{}", index + 1), str::to_string),
            kind: kind.unwrap_or_default().trim().to_string(),
            fields: fields.map_err(|err| err.to_string()),
        }
    }

    pub fn validate(&self) -> Result<SensorDescriptor, ConfigError> {
        let fields = self
            .fields
            .as_ref()
            .map_err(|message| ConfigError::invalid("sensor", message.clone()))?;
        validate_name(&fields.name)?;
        let interval = fields.interval.resolve("interval")?;
        let timeout = match &fields.timeout {
            Some(raw) => raw.resolve("timeout")?,
            None => interval,
        };
        let on_failure = match &fields.on_failure {
            Some(raw) => raw.parse()?,
            None => FailurePolicy::Skip,
        };
        Ok(SensorDescriptor {
            name: fields.name.clone(),
            kind: fields.kind.trim().to_string(),
            interval,
            timeout,
            on_failure,
            params: fields.params.clone(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SensorsFile {
    #[serde(default, rename = "sensor")]
    sensors: Vec<toml::Value>,
}

/// Sensor list as served by the collector's `agent_config` endpoint.
#[derive(Debug, Default, Deserialize)]
struct RemoteSensors {
    #[serde(default)]
    sensors: Vec<serde_json::Value>,
}

pub fn load_sensors_file(path: &Path) -> Result<Vec<RawDescriptor>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_sensors(&raw).map_err(|err| match err {
        ConfigError::Parse { message, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })
}

/// Parses a sensors file. Only a file that is not valid TOML, or whose
/// `sensor` key is not an array, fails as a whole.
pub fn parse_sensors(raw: &str) -> Result<Vec<RawDescriptor>, ConfigError> {
    let file: SensorsFile = toml::from_str(raw).map_err(|err| ConfigError::Parse {
        path: "<sensors>".into(),
        message: err.to_string(),
    })?;
    Ok(file
        .sensors
        .into_iter()
        .enumerate()
        .map(|(index, table)| {
            let name = table.get("name").and_then(toml::Value::as_str).map(str::to_string);
            let kind = table.get("type").and_then(toml::Value::as_str).map(str::to_string);
            RawDescriptor::from_parts(
                index,
                name.as_deref(),
                kind.as_deref(),
                table.try_into::<DescriptorFields>(),
            )
        })
        .collect())
}

/// Same as [`parse_sensors`] for the JSON document `{"sensors": [...]}`.
pub fn parse_sensors_json(raw: &str) -> Result<Vec<RawDescriptor>, ConfigError> {
    let document: RemoteSensors = serde_json::from_str(raw).map_err(|err| ConfigError::Parse {
        path: "<agent_config>".into(),
        message: err.to_string(),
    })?;
    Ok(document
        .sensors
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let name = entry.get("name").and_then(serde_json::Value::as_str).map(str::to_string);
            let kind = entry.get("type").and_then(serde_json::Value::as_str).map(str::to_string);
            RawDescriptor::from_parts(
                index,
                name.as_deref(),
                kind.as_deref(),
                serde_json::from_value::<DescriptorFields>(entry),
            )
        })
        .collect())
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && !name.starts_with('_')
        && name.chars().count() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !ok {
        return Err(ConfigError::invalid(
            "name",
            format!("`{name}` must be 1-{MAX_NAME_LEN} word characters, not starting with `_`"),
        ));
    }
    Ok(())
}

/// Parses `500ms`, `10s`, `5m`, `1h`, `2d` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("`{raw}` is not a duration"))?;
    let (scale, millis) = match unit.trim() {
        "" | "s" => (1, false),
        "ms" => (1, true),
        "m" => (60, false),
        "h" => (3600, false),
        "d" => (86_400, false),
        other => return Err(format!("unknown duration unit `{other}`")),
    };
    if millis {
        return Ok(Duration::from_millis(value));
    }
    value
        .checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("`{raw}` is too large"))
}
