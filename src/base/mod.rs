// Kobuki mobile base core
//
// Provides:
// - Packet framing and checksum verification over the serial byte stream
// - Sub-payload decoding into sensor and version records
// - Differential-drive kinematics and encoder odometry
// - Command encoding (base control, LEDs, sounds, service requests)
// - The driver loop tying it together on a background thread

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod command;
mod driver;
pub mod kinematics;
pub mod odometry;
pub mod packet;
pub mod payloads;
pub mod transport;

pub use command::{Command, LedColour, LedNumber, SoundSequence};
pub use driver::{ConnectionState, Driver, Statistics};
pub use kinematics::{DiffDrive, Pose2D};
pub use odometry::{OdometryUpdate, PoseRates, WheelJointStates};
pub use packet::{Frame, FrameFinder};
pub use payloads::{CoreSensors, VersionInfo};
pub use transport::{SerialTransport, Transport};

/// Error types for the driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Not connected to the base")]
    NotConnected,

    #[error("Already connected to the base")]
    AlreadyConnected,

    #[error("Driver is not enabled for commands")]
    NotEnabled,

    #[error("Driver loop is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Lock a record, recovering the value if a writer panicked.
/// Records are plain values, so a poisoned lock never holds a torn one.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
