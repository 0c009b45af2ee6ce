use crate::descriptor::{RawDescriptor, SensorDescriptor};
use crate::error::ConfigError;
use crate::sensor::{
    CheckPortSensor, DiskUsageSensor, LoadAvgSensor, LogReadSensor, Sensor, UptimeSensor,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type SensorConstructor = Arc<dyn Fn(&str) -> Box<dyn Sensor> + Send + Sync>;

#[derive(Clone)]
pub struct ConfiguredSensor {
    pub descriptor: Arc<SensorDescriptor>,
    pub sensor: Arc<dyn Sensor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisabledSensor {
    pub name: String,
    pub kind: String,
    pub reason: String,
}

#[derive(Default)]
pub struct LoadedSensors {
    pub active: Vec<ConfiguredSensor>,
    pub disabled: Vec<DisabledSensor>,
}

/// Maps sensor type tags to constructors and turns descriptors into configured sensors.
#[derive(Default)]
pub struct SensorRegistry {
    constructors: HashMap<String, SensorConstructor>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("uptime", |name| Box::new(UptimeSensor::new(name)));
        registry.register("loadavg", |name| Box::new(LoadAvgSensor::new(name)));
        registry.register("disk_usage", |name| Box::new(DiskUsageSensor::new(name)));
        registry.register("check_port", |name| Box::new(CheckPortSensor::new(name)));
        registry.register("logread", |name| Box::new(LogReadSensor::new(name)));
        registry
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&str) -> Box<dyn Sensor> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Duplicate names reject the whole set; any other problem disables only the
    /// offending sensor.
    pub fn load(&self, raw: &[RawDescriptor]) -> Result<LoadedSensors, ConfigError> {
        let mut seen = HashSet::new();
        for descriptor in raw {
            if !seen.insert(descriptor.name.as_str()) {
                return Err(ConfigError::Duplicate(descriptor.name.clone()));
            }
        }

        let mut loaded = LoadedSensors::default();
        for descriptor in raw {
            match self.instantiate(descriptor) {
                Ok(sensor) => {
                    tracing::info!(
                        sensor = %sensor.descriptor.name,
                        kind = %sensor.descriptor.kind,
                        interval_ms = sensor.descriptor.interval.as_millis() as u64,
                        "sensor configured"
                    );
                    loaded.active.push(sensor);
                }
                Err(err) => {
                    tracing::warn!(
                        sensor = %descriptor.name,
                        kind = %descriptor.kind,
                        error = %err,
                        "sensor disabled"
                    );
                    loaded.disabled.push(DisabledSensor {
                        name: descriptor.name.clone(),
                        kind: descriptor.kind.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(loaded)
    }

    fn instantiate(&self, raw: &RawDescriptor) -> Result<ConfiguredSensor, ConfigError> {
        let descriptor = raw.validate()?;
        let constructor = self
            .constructors
            .get(&descriptor.kind)
            .ok_or_else(|| ConfigError::UnknownType(descriptor.kind.clone()))?;
        let mut sensor = constructor(&descriptor.name);
        sensor.configure(&descriptor.params)?;
        Ok(ConfiguredSensor {
            descriptor: Arc::new(descriptor),
            sensor: Arc::from(sensor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_sensors;

    #[test]
    fn disables_misconfigured_and_unknown_sensors() {
        let raw = parse_sensors(
            r#"
            [[sensor]]
            name = "uptime"
            type = "uptime"
            interval = "30s"

            [[sensor]]
            name = "web"
            type = "check_port"
            interval = "10s"
            params = { hostname = "example.org" }

            [[sensor]]
            name = "raid"
            type = "megaraid"
            interval = "1m"

            [[sensor]]
            name = "flaky"
            type = "loadavg"
            interval = "1s"
            on_failure = "sometimes"
            "#,
        )
        .unwrap();

        let loaded = SensorRegistry::with_builtins().load(&raw).unwrap();
        let active: Vec<&str> = loaded
            .active
            .iter()
            .map(|s| s.descriptor.name.as_str())
            .collect();
        assert_eq!(active, vec!["uptime"]);

        let disabled: Vec<&str> = loaded.disabled.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(disabled, vec!["web", "raid", "flaky"]);
        assert!(loaded.disabled[0].reason.contains("port"));
        assert!(loaded.disabled[1].reason.contains("megaraid"));
    }

    #[test]
    fn malformed_table_disables_only_that_sensor() {
        let raw = parse_sensors(
            r#"
            [[sensor]]
            name = "good"
            type = "uptime"
            interval = "10s"

            [[sensor]]
            name = "typo"
            type = "loadavg"
            intreval = "10s"
            "#,
        )
        .unwrap();

        let loaded = SensorRegistry::with_builtins().load(&raw).unwrap();
        assert_eq!(loaded.active.len(), 1);
        assert_eq!(loaded.active[0].descriptor.name, "good");
        assert_eq!(loaded.disabled.len(), 1);
        assert_eq!(loaded.disabled[0].name, "typo");
        assert_eq!(loaded.disabled[0].kind, "loadavg");
        assert!(loaded.disabled[0].reason.contains("interval"), "{}", loaded.disabled[0].reason);
    }

    #[test]
    fn duplicate_names_are_fatal() {
        let raw = parse_sensors(
            r#"
            [[sensor]]
            name = "load"
            type = "loadavg"
            interval = 5

            [[sensor]]
            name = "load"
            type = "uptime"
            interval = 5
            "#,
        )
        .unwrap();

        let err = SensorRegistry::with_builtins().load(&raw).err().unwrap();
        assert!(matches!(err, ConfigError::Duplicate(name) if name == "load"));
    }

    #[test]
    fn lists_builtin_kinds() {
        assert_eq!(
            SensorRegistry::with_builtins().kinds(),
            vec!["check_port", "disk_usage", "loadavg", "logread", "uptime"]
        );
    }
}
