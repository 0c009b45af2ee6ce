use super::{blocking_until, param_str, Sensor};
use crate::descriptor::SensorParams;
use crate::error::{ConfigError, SensorError};
use crate::sample::{Sample, SampleValue};
use async_trait::async_trait;
use sysinfo::{Disks, System};
use tokio::time::Instant;

pub struct UptimeSensor {
    name: String,
}

impl UptimeSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Sensor for UptimeSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &SensorParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn collect(&self, _deadline: Instant) -> Result<Sample, SensorError> {
        let uptime = System::uptime();
        Ok(Sample::new(&self.name, SampleValue::Float(uptime as f64)))
    }

    fn reentrant(&self) -> bool {
        true
    }
}

pub struct LoadAvgSensor {
    name: String,
}

impl LoadAvgSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Sensor for LoadAvgSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &SensorParams) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn collect(&self, _deadline: Instant) -> Result<Sample, SensorError> {
        let load = System::load_average();
        if !load.one.is_finite() {
            return Err(SensorError::InvalidData("load average unavailable".to_string()));
        }
        Ok(Sample::new(&self.name, SampleValue::Float(load.one)))
    }

    fn reentrant(&self) -> bool {
        true
    }
}

pub struct DiskUsageSensor {
    name: String,
    mount: String,
}

impl DiskUsageSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mount: String::new(),
        }
    }
}

#[async_trait]
impl Sensor for DiskUsageSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &SensorParams) -> Result<(), ConfigError> {
        self.mount = param_str(params, "mount")?.to_string();
        Ok(())
    }

    async fn collect(&self, deadline: Instant) -> Result<Sample, SensorError> {
        let mount = self.mount.clone();
        let (total, available) = blocking_until(deadline, move || {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .find(|disk| disk.mount_point().as_os_str() == mount.as_str())
                .map(|disk| (disk.total_space(), disk.available_space()))
                .ok_or_else(|| SensorError::Io(format!("mount point {mount} not found")))
        })
        .await?;

        let used_percent = if total == 0 {
            0.0
        } else {
            (total.saturating_sub(available)) as f64 * 100.0 / total as f64
        };
        Ok(Sample::new(
            &self.name,
            SampleValue::Json(serde_json::json!({
                "total_bytes": total,
                "available_bytes": available,
                "used_percent": used_percent,
            })),
        ))
    }
}
