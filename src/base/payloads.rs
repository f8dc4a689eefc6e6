// Feedback sub-payloads streamed by the Kobuki base
//
// Every frame payload is a run of [Id, Len, Data...] records. Each id maps
// to a fixed-size record; multi-byte fields are little-endian.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use super::lock;
use super::packet::Frame;

/// Feedback sub-payload ids
pub mod id {
    pub const CORE_SENSORS: u8 = 1;
    pub const DOCK_IR: u8 = 3;
    pub const INERTIA: u8 = 4;
    pub const CLIFF: u8 = 5;
    pub const CURRENT: u8 = 6;
    pub const HARDWARE: u8 = 10;
    pub const FIRMWARE: u8 = 11;
    pub const GP_INPUT: u8 = 16;
}

/// Sub-payload decoding failures. These never leave the driver loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Unknown sub-payload id {id}")]
    UnknownId { id: u8 },

    #[error("Sub-payload {id} has length {actual}, expected {expected}")]
    LengthMismatch { id: u8, expected: usize, actual: usize },

    #[error("Sub-payload at offset {offset} runs past the end of the frame")]
    Truncated { offset: usize },
}

/// A fixed-size record carried in a sub-payload
pub(crate) trait Record: Sized {
    /// Exact data length on the wire
    const LENGTH: usize;

    /// Parse from exactly `LENGTH` bytes
    fn parse(data: &mut Reader<'_>) -> Self;
}

/// Little-endian field reader over a sub-payload's data
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn u8(&mut self) -> u8 {
        let b = self.data[self.pos];
        self.pos += 1;
        b
    }

    pub fn i8(&mut self) -> i8 {
        self.u8() as i8
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes([self.u8(), self.u8()])
    }

    pub fn i16(&mut self) -> i16 {
        self.u16() as i16
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        std::array::from_fn(|_| self.u8())
    }
}

/// Basic sensor data, including the wheel encoders used for odometry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoreSensors {
    /// Milliseconds, wraps at 65536
    pub time_stamp: u16,
    pub bumper: u8,
    pub wheel_drop: u8,
    pub cliff: u8,
    pub left_encoder: u16,
    pub right_encoder: u16,
    pub left_pwm: i8,
    pub right_pwm: i8,
    pub buttons: u8,
    pub charger: u8,
    /// Tenths of a volt
    pub battery: u8,
    pub over_current: u8,
}

impl Record for CoreSensors {
    const LENGTH: usize = 15;

    fn parse(r: &mut Reader<'_>) -> Self {
        Self {
            time_stamp: r.u16(),
            bumper: r.u8(),
            wheel_drop: r.u8(),
            cliff: r.u8(),
            left_encoder: r.u16(),
            right_encoder: r.u16(),
            left_pwm: r.i8(),
            right_pwm: r.i8(),
            buttons: r.u8(),
            charger: r.u8(),
            battery: r.u8(),
            over_current: r.u8(),
        }
    }
}

/// Docking infrared receivers (right, central, left)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DockIr {
    pub docking: [u8; 3],
}

impl Record for DockIr {
    const LENGTH: usize = 3;

    fn parse(r: &mut Reader<'_>) -> Self {
        Self { docking: r.array() }
    }
}

/// Gyro heading and rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Inertia {
    /// Hundredths of a degree
    pub angle: i16,
    /// Hundredths of a degree per second
    pub angle_rate: i16,
    pub acc: [u8; 3],
}

impl Inertia {
    /// Heading in radians
    pub fn heading(&self) -> f64 {
        (f64::from(self.angle) / 100.0).to_radians()
    }

    /// Angular rate in radians per second
    pub fn angular_velocity(&self) -> f64 {
        (f64::from(self.angle_rate) / 100.0).to_radians()
    }
}

impl Record for Inertia {
    const LENGTH: usize = 7;

    fn parse(r: &mut Reader<'_>) -> Self {
        Self {
            angle: r.i16(),
            angle_rate: r.i16(),
            acc: r.array(),
        }
    }
}

/// Raw cliff sensor ADC readings (right, central, left)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cliff {
    pub bottom: [u16; 3],
}

impl Record for Cliff {
    const LENGTH: usize = 6;

    fn parse(r: &mut Reader<'_>) -> Self {
        Self {
            bottom: [r.u16(), r.u16(), r.u16()],
        }
    }
}

/// Wheel motor currents (left, right), 10mA units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Current {
    pub current: [u8; 2],
}

impl Record for Current {
    const LENGTH: usize = 2;

    fn parse(r: &mut Reader<'_>) -> Self {
        Self { current: r.array() }
    }
}

/// General purpose digital and analog inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GpInput {
    pub digital_input: u16,
    pub analog_input: [u16; 7],
}

impl Record for GpInput {
    const LENGTH: usize = 16;

    fn parse(r: &mut Reader<'_>) -> Self {
        Self {
            digital_input: r.u16(),
            analog_input: std::array::from_fn(|_| r.u16()),
        }
    }
}

/// Hardware or firmware version, sent as [patch, minor, major, reserved]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Record for Version {
    const LENGTH: usize = 4;

    fn parse(r: &mut Reader<'_>) -> Self {
        let patch = r.u8();
        let minor = r.u8();
        let major = r.u8();
        let _reserved = r.u8();
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Last seen hardware and firmware versions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub hardware: Version,
    pub firmware: Version,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hardware {}, firmware {}", self.hardware, self.firmware)
    }
}

/// One decoded sub-payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    CoreSensors(CoreSensors),
    DockIr(DockIr),
    Inertia(Inertia),
    Cliff(Cliff),
    Current(Current),
    GpInput(GpInput),
    Hardware(Version),
    Firmware(Version),
}

impl Payload {
    /// Decode one sub-payload's data by id
    pub fn decode(id: u8, data: &[u8]) -> Result<Self, PayloadError> {
        match id {
            id::CORE_SENSORS => parse(id, data).map(Payload::CoreSensors),
            id::DOCK_IR => parse(id, data).map(Payload::DockIr),
            id::INERTIA => parse(id, data).map(Payload::Inertia),
            id::CLIFF => parse(id, data).map(Payload::Cliff),
            id::CURRENT => parse(id, data).map(Payload::Current),
            id::GP_INPUT => parse(id, data).map(Payload::GpInput),
            id::HARDWARE => parse(id, data).map(Payload::Hardware),
            id::FIRMWARE => parse(id, data).map(Payload::Firmware),
            _ => Err(PayloadError::UnknownId { id }),
        }
    }

    /// Service payloads answer a request rather than stream continuously
    pub fn is_service(&self) -> bool {
        matches!(self, Payload::Hardware(_) | Payload::Firmware(_))
    }
}

fn parse<T: Record>(id: u8, data: &[u8]) -> Result<T, PayloadError> {
    if data.len() != T::LENGTH {
        return Err(PayloadError::LengthMismatch {
            id,
            expected: T::LENGTH,
            actual: data.len(),
        });
    }
    Ok(T::parse(&mut Reader::new(data)))
}

/// Iterator over the sub-payloads of one frame.
///
/// A record with a bad id or length yields an error and iteration continues
/// with the next record. A record that overruns the frame ends iteration.
pub struct SubPayloads<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> SubPayloads<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl Iterator for SubPayloads<'_> {
    type Item = Result<Payload, PayloadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        if rest.is_empty() {
            return None;
        }

        let offset = self.offset;
        let (id, len) = match rest {
            [id, len, ..] => (*id, *len as usize),
            _ => {
                self.offset = self.data.len();
                return Some(Err(PayloadError::Truncated { offset }));
            }
        };
        let Some(data) = rest.get(2..2 + len) else {
            self.offset = self.data.len();
            return Some(Err(PayloadError::Truncated { offset }));
        };

        self.offset += 2 + len;
        Some(Payload::decode(id, data))
    }
}

/// Latest value of every record, one lock per record.
///
/// The driver loop is the only writer; any thread may take snapshots.
#[derive(Debug, Default)]
pub struct RecordStore {
    core_sensors: Mutex<CoreSensors>,
    dock_ir: Mutex<DockIr>,
    inertia: Mutex<Option<Inertia>>,
    cliff: Mutex<Cliff>,
    current: Mutex<Current>,
    gp_input: Mutex<GpInput>,
    hardware: Mutex<Version>,
    firmware: Mutex<Version>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the record matching `payload`
    pub fn apply(&self, payload: Payload) {
        match payload {
            Payload::CoreSensors(data) => *lock(&self.core_sensors) = data,
            Payload::DockIr(data) => *lock(&self.dock_ir) = data,
            Payload::Inertia(data) => *lock(&self.inertia) = Some(data),
            Payload::Cliff(data) => *lock(&self.cliff) = data,
            Payload::Current(data) => *lock(&self.current) = data,
            Payload::GpInput(data) => *lock(&self.gp_input) = data,
            Payload::Hardware(data) => *lock(&self.hardware) = data,
            Payload::Firmware(data) => *lock(&self.firmware) = data,
        }
    }

    pub fn core_sensors(&self) -> CoreSensors {
        *lock(&self.core_sensors)
    }

    pub fn dock_ir(&self) -> DockIr {
        *lock(&self.dock_ir)
    }

    /// `None` until the first inertia record arrives
    pub fn inertia(&self) -> Option<Inertia> {
        *lock(&self.inertia)
    }

    pub fn cliff(&self) -> Cliff {
        *lock(&self.cliff)
    }

    pub fn current(&self) -> Current {
        *lock(&self.current)
    }

    pub fn gp_input(&self) -> GpInput {
        *lock(&self.gp_input)
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo {
            hardware: *lock(&self.hardware),
            firmware: *lock(&self.firmware),
        }
    }
}

/// What a single frame changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Any streamed record was refreshed
    pub streamed: bool,
    /// Core sensors were refreshed, odometry needs an update
    pub core_sensors: bool,
    /// A hardware or firmware version arrived
    pub version: bool,
    /// Sub-payloads skipped for a bad id, length or overrun
    pub skipped: u32,
}

/// Apply every valid sub-payload in `frame` to `store`
pub fn decode_frame(frame: &Frame, store: &RecordStore) -> DecodeReport {
    let mut report = DecodeReport::default();

    for result in SubPayloads::new(frame.payload()) {
        match result {
            Ok(payload) => {
                if payload.is_service() {
                    report.version = true;
                } else {
                    report.streamed = true;
                }
                if matches!(payload, Payload::CoreSensors(_)) {
                    report.core_sensors = true;
                }
                store.apply(payload);
            }
            Err(e) => {
                tracing::debug!("Skipping sub-payload: {}", e);
                report.skipped += 1;
            }
        }
    }

    report
}
