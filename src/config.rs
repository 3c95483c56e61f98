use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cia402::DEFAULT_ENCODER_RESOLUTION;
use crate::drive::{
    DriveParams, DEFAULT_DEADZONE, DEFAULT_HYSTERESIS_RPM, DEFAULT_MAX_RPM,
    DEFAULT_STOP_THRESHOLD_RPM,
};
use crate::error::{Error, Result};
use crate::id::NodeId;

/// Robot configuration. Every field has a default, so an empty file (or no
/// file at all) gives a working setup for nodes 1 and 2 on `can0`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub can: CanConfig,
    pub motors: MotorConfig,
    pub drive: DriveConfig,
    pub status: StatusConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanConfig {
    pub interface: String,
    /// Informational; the link is brought up outside this program.
    pub bitrate: u32,
    pub sdo_timeout_ms: u64,
    pub sdo_poll_interval_ms: u64,
    pub tap_capacity: usize,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_owned(),
            bitrate: 500_000,
            sdo_timeout_ms: 2000,
            sdo_poll_interval_ms: 1,
            tap_capacity: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotorConfig {
    pub left_node: u8,
    pub right_node: u8,
    pub encoder_resolution: f64,
    pub use_pdo: bool,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            left_node: 1,
            right_node: 2,
            encoder_resolution: DEFAULT_ENCODER_RESOLUTION,
            use_pdo: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriveConfig {
    pub max_rpm: f64,
    pub deadzone: f64,
    pub update_interval_ms: u64,
    pub hysteresis_rpm: f64,
    pub stop_threshold_rpm: f64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            max_rpm: DEFAULT_MAX_RPM,
            deadzone: DEFAULT_DEADZONE,
            update_interval_ms: 20,
            hysteresis_rpm: DEFAULT_HYSTERESIS_RPM,
            stop_threshold_rpm: DEFAULT_STOP_THRESHOLD_RPM,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    pub interval_ms: u64,
    /// Every n-th status report also logs per-node TPDO1 details.
    pub detail_every: u32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            detail_every: 10,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {}", path.display(), err)))?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let (left, right) = self.node_ids()?;
        if left == right {
            return Err(Error::Config(format!(
                "left and right motors share node {}",
                left
            )));
        }
        if !is_positive(self.motors.encoder_resolution) {
            return Err(Error::Config(format!(
                "encoder_resolution must be positive, got {}",
                self.motors.encoder_resolution
            )));
        }
        if !is_positive(self.drive.max_rpm) {
            return Err(Error::Config(format!(
                "max_rpm must be positive, got {}",
                self.drive.max_rpm
            )));
        }
        if self.status.interval_ms == 0 {
            return Err(Error::Config("status interval_ms must be at least 1".to_owned()));
        }
        if self.status.detail_every == 0 {
            return Err(Error::Config("detail_every must be at least 1".to_owned()));
        }
        Ok(())
    }

    pub fn node_ids(&self) -> Result<(NodeId, NodeId)> {
        let node = |raw| {
            NodeId::new(raw).map_err(|_| Error::Config(format!("invalid node id {}", raw)))
        };
        Ok((node(self.motors.left_node)?, node(self.motors.right_node)?))
    }

    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.can.sdo_timeout_ms)
    }

    pub fn sdo_poll_interval(&self) -> Duration {
        Duration::from_millis(self.can.sdo_poll_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status.interval_ms)
    }

    pub fn drive_params(&self) -> DriveParams {
        DriveParams {
            max_rpm: self.drive.max_rpm,
            deadzone: self.drive.deadzone,
            update_interval: Duration::from_millis(self.drive.update_interval_ms),
            hysteresis_rpm: self.drive.hysteresis_rpm,
            stop_threshold_rpm: self.drive.stop_threshold_rpm,
        }
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
