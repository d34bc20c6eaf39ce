//! Live execution runtime
//!
//! Runs parsed sequences directly against controllers: a registry tracks which
//! devices are free, the field-protocol traits abstract the transport, and the
//! interpreter walks the sequence step by step with cooperative cancellation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub mod interpreter;
pub mod protocol;
pub mod registry;
pub mod simulator;
pub mod storage;

/// A controller known at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,
    /// Network address; also the device id
    pub address: String,
}

/// Configuration for the sequence runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for persisted state (default: .seqctl/)
    pub root: PathBuf,

    /// Devices registered at startup
    pub devices: Vec<DeviceConfig>,

    /// Field-protocol port appended to each device address
    pub endpoint_port: u16,

    /// Delay between sensor polls
    pub poll_interval_ms: u64,

    /// Pause after driving every actuator to rest
    pub settle_ms: u64,

    /// Maximum wait for a sensor before the run fails; unbounded when absent
    pub sensor_timeout_ms: Option<u64>,

    /// Upper bound of the seeded runtime variables
    pub runtime_var_max: i16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".seqctl"),
            devices: vec![DeviceConfig {
                name: "PLC_5".to_string(),
                address: "192.168.0.42".to_string(),
            }],
            endpoint_port: 4840,
            poll_interval_ms: 100,
            settle_ms: 1000,
            sensor_timeout_ms: None,
            runtime_var_max: 3,
        }
    }
}

impl RuntimeConfig {
    /// Sensor poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Post-initialisation pause.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Optional sensor wait bound.
    pub fn sensor_timeout(&self) -> Option<Duration> {
        self.sensor_timeout_ms.map(Duration::from_millis)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> error::Result<()> {
        if self.runtime_var_max < 1 {
            return Err(error::RuntimeError::Config(format!(
                "runtime_var_max must be at least 1, got {}",
                self.runtime_var_max
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(error::RuntimeError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// Re-export commonly used types
pub use error::{ProtocolError, ProtocolResult, Result, RuntimeError};
pub use interpreter::{Engine, RunHandle, RunOutcome, RunReport};
pub use protocol::{FieldClient, FieldConnector, FieldSession, TagValue, TagWrite, endpoint};
pub use registry::{DeviceLease, DeviceRecord, DeviceRegistry};
pub use simulator::{SimulatedConnector, SimulatedPlc};
pub use storage::{ProjectStore, Storage};
