use super::{param_str, param_u64, Sensor};
use crate::descriptor::SensorParams;
use crate::error::{ConfigError, SensorError};
use crate::sample::{Sample, SampleValue};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Reports whether a remote TCP port accepts connections.
pub struct CheckPortSensor {
    name: String,
    hostname: String,
    port: u16,
}

impl CheckPortSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hostname: String::new(),
            port: 0,
        }
    }
}

#[async_trait]
impl Sensor for CheckPortSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &SensorParams) -> Result<(), ConfigError> {
        let protocol = match params.get("protocol") {
            Some(_) => param_str(params, "protocol")?,
            None => "tcp",
        };
        if protocol != "tcp" {
            return Err(ConfigError::invalid("protocol", format!("unsupported protocol `{protocol}`")));
        }
        let port = param_u64(params, "port", None)?;
        self.port = u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigError::invalid("port", "must be between 1 and 65535"))?;
        self.hostname = param_str(params, "hostname")?.to_string();
        Ok(())
    }

    async fn collect(&self, deadline: Instant) -> Result<Sample, SensorError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout_at(
            deadline,
            TcpStream::connect((self.hostname.as_str(), self.port)),
        )
        .await
        .map_err(|_| SensorError::Timeout(budget))?;

        let payload = match attempt {
            Ok(_stream) => serde_json::json!({ "is_open": true, "error": null }),
            Err(err) => serde_json::json!({ "is_open": false, "error": err.to_string() }),
        };
        Ok(Sample::new(&self.name, SampleValue::Json(payload)))
    }

    fn reentrant(&self) -> bool {
        true
    }
}
