// Protocol constants, timing and driver parameters
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::base::DriverError;

// Host runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Telemetry watchdog: stream data older than this marks the runtime stale
pub const STREAM_TIMEOUT: Duration = Duration::from_millis(250);

// Serial port the Kobuki base enumerates as (FTDI adapter)
pub const DEFAULT_PORT: &str = "/dev/kobuki";
pub const DEFAULT_BAUDRATE: u32 = 115_200;

// Bounded wait for a single transport read; also bounds shutdown latency
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 20;

// Base control is retransmitted at this period while enabled.
// The firmware stops the wheels if it hears nothing for ~200ms.
pub const COMMAND_PERIOD: Duration = Duration::from_millis(20);

// Kinematic defaults for the Kobuki base
pub const DEFAULT_WHEELBASE: f64 = 0.230; // metres
pub const DEFAULT_WHEEL_RADIUS: f64 = 0.035; // metres
pub const DEFAULT_TICK_TO_MM: f64 = 0.0845813406577;
pub const DEFAULT_TICK_TO_RAD: f64 = 0.00201384144460884;

/// Where the driver takes its heading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingSource {
    /// Heading integrated from wheel encoders only.
    #[default]
    Encoder,
    /// Encoder heading shifted by the configured IMU offset.
    EncoderBiased,
    /// Gyro angle (minus offset) replaces the encoder heading once inertia data arrives.
    Imu,
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub device_port: String,
    pub baud_rate: u32,
    pub protocol_version: String,
    pub device_type: String,
    /// Distance between the wheel contact points, metres
    pub wheelbase: f64,
    pub wheel_radius: f64,
    pub tick_to_mm: f64,
    pub tick_to_rad: f64,
    /// Radians
    pub imu_heading_offset: f64,
    pub heading_source: HeadingSource,
    /// Milliseconds
    pub read_timeout: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            device_port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUDRATE,
            protocol_version: "2.0".to_string(),
            device_type: "kobuki".to_string(),
            wheelbase: DEFAULT_WHEELBASE,
            wheel_radius: DEFAULT_WHEEL_RADIUS,
            tick_to_mm: DEFAULT_TICK_TO_MM,
            tick_to_rad: DEFAULT_TICK_TO_RAD,
            imu_heading_offset: 0.0,
            heading_source: HeadingSource::default(),
            read_timeout: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl Parameters {
    /// Check the parameters before anything is opened
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.device_port.trim().is_empty() {
            return Err(invalid("device_port", "must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate", "must be non-zero"));
        }
        positive("wheelbase", self.wheelbase)?;
        positive("wheel_radius", self.wheel_radius)?;
        positive("tick_to_mm", self.tick_to_mm)?;
        positive("tick_to_rad", self.tick_to_rad)?;
        if !self.imu_heading_offset.is_finite() {
            return Err(invalid("imu_heading_offset", "must be finite"));
        }
        if self.read_timeout == 0 {
            return Err(invalid("read_timeout", "must be non-zero"));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), DriverError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, format!("must be positive and finite, got {}", value)))
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> DriverError {
    DriverError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}
