// Notification and health types

use serde::{Deserialize, Serialize};

use crate::base::VersionInfo;

/// Severity of a driver diagnostic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Notifications raised on the driver thread.
///
/// Delivered through [`crate::base::Driver::subscribe`]; sending never blocks
/// the driver loop.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    /// New streamed telemetry was decoded this cycle
    StreamData,
    /// A hardware or firmware version reply arrived
    VersionInfo(VersionInfo),
    Diagnostic { severity: Severity, message: String },
}

/// Health status published by the host runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    StreamStale,
    Disconnected,
}
