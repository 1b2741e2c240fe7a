//! Configuration types, handed in by host applications. Both
//! structs derive `Serialize`/`Deserialize` so a host can embed them in
//! its own TOML/JSON/etc. configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DeviceModel;
use crate::error::{Error, Result};
use crate::transport::DEFAULT_BAUD_RATE;

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_update_interval() -> Duration {
    Duration::from_secs(60)
}

/// How a [`crate::realtime::RealtimeContainer`] behaves while it comes
/// up, before the caller gets control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartupGate {
    /// Return immediately; the transport opens in the background.
    DoNothing,
    /// Block until the transport has opened.
    WaitUntilOpen,
    /// Block until the first fetch cycle completes, successfully or not.
    #[default]
    WaitForFirstUpdate,
    /// Block until the first fetch cycle completes successfully.
    WaitForFirstValidUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    pub model: DeviceModel,
}

impl DeviceConfig {
    pub fn new(path: impl Into<String>, model: DeviceModel) -> Self {
        Self {
            path: path.into(),
            baud_rate: default_baud_rate(),
            model,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::MissingDevicePath);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub device: DeviceConfig,
    #[serde(default = "default_update_interval", with = "duration_secs")]
    pub update_interval: Duration,
    #[serde(default)]
    pub on_create: StartupGate,
}

impl RealtimeConfig {
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device,
            update_interval: default_update_interval(),
            on_create: StartupGate::default(),
        }
    }
}

/// `Duration` has no native serde impl; the config surface stores it as
/// whole seconds rather than a duration string.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_defaults_baud_rate() {
        let json = r#"{"path": "/dev/ttyUSB0", "model": "VantagePro2"}"#;
        let cfg: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.baud_rate, 19200);
    }

    #[test]
    fn missing_path_fails_validation() {
        let cfg = DeviceConfig::new("", DeviceModel::VantagePro);
        assert!(matches!(cfg.validate(), Err(Error::MissingDevicePath)));
    }

    #[test]
    fn realtime_config_defaults_on_create() {
        let json = r#"{"device": {"path": "/dev/ttyUSB0", "model": "VantageVue"}, "update_interval": 30}"#;
        let cfg: RealtimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.on_create, StartupGate::WaitForFirstUpdate);
        assert_eq!(cfg.update_interval, Duration::from_secs(30));
    }
}
