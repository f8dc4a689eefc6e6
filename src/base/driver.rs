// High-level driver for the Kobuki base
//
// Owns the transport on a background thread that reads and decodes
// telemetry, keeps odometry current and retransmits the base control
// command so the firmware watchdog stays fed. Other threads read snapshots
// through the accessors and listen for events on a broadcast channel.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::command::{apply_led, BaseControl, Command, LedColour, LedNumber};
use super::kinematics::{wrap_angle, Pose2D};
use super::lock;
use super::odometry::{Odometry, OdometryUpdate, WheelJointStates};
use super::packet::{FrameFinder, FrameStats};
use super::payloads::{
    decode_frame, Cliff, CoreSensors, Current, DockIr, GpInput, Inertia, RecordStore, VersionInfo,
};
use super::transport::{SerialTransport, Transport};
use super::{DriverError, Result};
use crate::config::{HeadingSource, Parameters, COMMAND_PERIOD};
use crate::messages::{DriverEvent, Severity};

/// Events buffered per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 64;

/// Bytes pulled from the transport per cycle
const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Enabled,
    Running,
    Stopping,
}

/// Link quality counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub frames: u64,
    pub dropped_frames: u64,
    pub skipped_payloads: u64,
    pub discarded_bytes: u64,
}

/// Most recent motion and LED request
#[derive(Debug, Clone, Copy, Default)]
struct CommandState {
    linear: f64,
    angular: f64,
    base: BaseControl,
    digital_output: u16,
}

/// State shared between the driver handle and its loop thread
struct Shared {
    records: RecordStore,
    odometry: Mutex<Odometry>,
    command: Mutex<CommandState>,
    /// Encoded frames waiting for the loop to write them
    outgoing: Mutex<Vec<u8>>,

    connected: AtomicBool,
    enabled: AtomicBool,
    running: AtomicBool,
    stopping: AtomicBool,
    stop: AtomicBool,

    frames: AtomicU64,
    dropped_frames: AtomicU64,
    skipped_payloads: AtomicU64,
    discarded_bytes: AtomicU64,

    events: broadcast::Sender<DriverEvent>,
    heading_source: HeadingSource,
    imu_heading_offset: f64,
    wheelbase: f64,
}

impl Shared {
    fn new(params: &Parameters, events: broadcast::Sender<DriverEvent>) -> Self {
        Self {
            records: RecordStore::new(),
            odometry: Mutex::new(Odometry::from_parameters(params)),
            command: Mutex::new(CommandState::default()),
            outgoing: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            skipped_payloads: AtomicU64::new(0),
            discarded_bytes: AtomicU64::new(0),
            events,
            heading_source: params.heading_source,
            imu_heading_offset: params.imu_heading_offset,
            wheelbase: params.wheelbase,
        }
    }

    fn emit(&self, event: DriverEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn notify(&self, severity: Severity, message: String) {
        match severity {
            Severity::Debug => debug!("{}", message),
            Severity::Info => info!("{}", message),
            Severity::Warn => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
        self.emit(DriverEvent::Diagnostic { severity, message });
    }

    /// Gyro heading with the offset removed, if gyro heading is in use
    fn gyro_heading(&self) -> Option<f64> {
        if self.heading_source != HeadingSource::Imu {
            return None;
        }
        self.records
            .inertia()
            .map(|inertia| wrap_angle(inertia.heading() - self.imu_heading_offset))
    }

    fn refresh_odometry(&self) {
        let core = self.records.core_sensors();
        let gyro = self.gyro_heading();
        lock(&self.odometry).update(&core, gyro);
    }

    fn record_stats(&self, stats: FrameStats) {
        self.frames.store(stats.frames, Ordering::Relaxed);
        self.discarded_bytes
            .store(stats.discarded_bytes, Ordering::Relaxed);
        let before = self
            .dropped_frames
            .swap(stats.dropped_frames, Ordering::Relaxed);
        if stats.dropped_frames > before {
            self.notify(
                Severity::Warn,
                format!(
                    "Dropped {} corrupt frame(s), {} in total",
                    stats.dropped_frames - before,
                    stats.dropped_frames
                ),
            );
        }
    }

    fn fault(&self, err: &io::Error) {
        self.connected.store(false, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        self.notify(Severity::Error, format!("Transport fault: {}", err));
    }
}

/// Driver for one Kobuki base.
///
/// # Lifecycle
/// 1. [`init`](Self::init) opens the transport (`Connected`)
/// 2. [`enable`](Self::enable) permits commands (`Enabled`)
/// 3. [`start`](Self::start) launches the loop thread (`Running`)
/// 4. [`close`](Self::close) stops everything (`Disconnected`), also run on drop
///
/// All methods except `init` take `&self`, so the driver can be shared
/// between threads behind an `Arc`.
pub struct Driver {
    params: Parameters,
    events: broadcast::Sender<DriverEvent>,
    shared: Arc<Shared>,
    /// Held here until the loop takes it over
    transport: Mutex<Option<Box<dyn Transport>>>,
    worker: Mutex<Option<JoinHandle<Box<dyn Transport>>>>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    /// Create a disconnected driver with zeroed records
    pub fn new() -> Self {
        let params = Parameters::default();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared::new(&params, events.clone()));
        Self {
            params,
            events,
            shared,
            transport: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Validate `params` and open the serial port they name
    pub fn init(&mut self, params: Parameters) -> Result<()> {
        self.check_can_init()?;
        params.validate()?;
        let transport =
            SerialTransport::open(&params.device_port, params.baud_rate, params.read_timeout())?;
        self.attach(params, Box::new(transport));
        Ok(())
    }

    /// Like [`init`](Self::init) over an already open transport
    pub fn init_with_transport(
        &mut self,
        params: Parameters,
        transport: Box<dyn Transport>,
    ) -> Result<()> {
        self.check_can_init()?;
        params.validate()?;
        self.attach(params, transport);
        Ok(())
    }

    fn check_can_init(&self) -> Result<()> {
        if self.connected() {
            return Err(DriverError::AlreadyConnected);
        }
        // Reap a loop that died on a transport fault
        self.close()
    }

    fn attach(&mut self, params: Parameters, transport: Box<dyn Transport>) {
        info!(
            "Connected to {} (device type {}, protocol {})",
            params.device_port, params.device_type, params.protocol_version
        );
        self.shared = Arc::new(Shared::new(&params, self.events.clone()));
        self.shared.connected.store(true, Ordering::Release);
        *lock(&self.transport) = Some(transport);
        self.params = params;
    }

    /// Start the loop thread
    pub fn start(&self) -> Result<()> {
        if !self.connected() {
            return Err(DriverError::NotConnected);
        }

        let mut slot = lock(&self.transport);
        let Some(transport) = slot.take() else {
            return Err(DriverError::AlreadyRunning);
        };
        self.shared.stop.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("kobuki-driver".to_string())
            .spawn(move || run_loop(shared, transport));
        drop(slot);

        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                info!("Driver loop running");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.connected.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Permit command transmission
    pub fn enable(&self) -> Result<()> {
        if !self.connected() {
            return Err(DriverError::NotConnected);
        }
        if !self.shared.enabled.swap(true, Ordering::AcqRel) {
            self.shared
                .notify(Severity::Info, "Commands enabled".to_string());
        }
        Ok(())
    }

    /// Stop the base and cease command transmission. Telemetry keeps flowing.
    pub fn disable(&self) -> Result<()> {
        if !self.shared.enabled.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let mut command = lock(&self.shared.command);
            command.linear = 0.0;
            command.angular = 0.0;
            command.base = BaseControl::stop();
        }
        self.shared.enabled.store(false, Ordering::Release);
        self.shared
            .notify(Severity::Info, "Commands disabled".to_string());
        self.write_frame(Command::BaseControl(BaseControl::stop()).encode())
    }

    /// Stop the loop, close the transport and return to `Disconnected`.
    /// Safe to call in any state, any number of times.
    pub fn close(&self) -> Result<()> {
        let worker = lock(&self.worker).take();
        let transport = lock(&self.transport).take();
        if worker.is_none() && transport.is_none() && !self.connected() {
            return Ok(());
        }

        if self.shared.enabled.load(Ordering::Acquire) {
            // Direct write is gone with the transport, so queue the stop for the loop
            if worker.is_some() {
                if let Err(e) = self.disable() {
                    warn!("Failed to stop base on close: {}", e);
                }
            } else if let Some(mut transport) = transport {
                self.shared.enabled.store(false, Ordering::Release);
                let stop = Command::BaseControl(BaseControl::stop()).encode();
                if let Err(e) = transport.write_all(&stop) {
                    warn!("Failed to stop base on close: {}", e);
                }
            }
        }

        self.shared.stopping.store(true, Ordering::Release);
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = worker {
            match handle.join() {
                Ok(transport) => drop(transport),
                Err(_) => error!("Driver loop panicked"),
            }
        }

        self.shared.connected.store(false, Ordering::Release);
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        self.shared.stopping.store(false, Ordering::Release);
        info!("Driver closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        let shared = &self.shared;
        if shared.stopping.load(Ordering::Acquire) {
            ConnectionState::Stopping
        } else if !shared.connected.load(Ordering::Acquire) {
            ConnectionState::Disconnected
        } else if shared.running.load(Ordering::Acquire) {
            ConnectionState::Running
        } else if shared.enabled.load(Ordering::Acquire) {
            ConnectionState::Enabled
        } else {
            ConnectionState::Connected
        }
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Receive driver events from here on
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    // === Raw data ===

    pub fn core_sensor_data(&self) -> CoreSensors {
        self.shared.records.core_sensors()
    }

    pub fn dock_ir_data(&self) -> DockIr {
        self.shared.records.dock_ir()
    }

    pub fn cliff_data(&self) -> Cliff {
        self.shared.records.cliff()
    }

    pub fn current_data(&self) -> Current {
        self.shared.records.current()
    }

    pub fn gp_input_data(&self) -> GpInput {
        self.shared.records.gp_input()
    }

    /// `None` until the gyro has reported
    pub fn inertia_data(&self) -> Option<Inertia> {
        self.shared.records.inertia()
    }

    pub fn version_info(&self) -> VersionInfo {
        self.shared.records.version_info()
    }

    pub fn statistics(&self) -> Statistics {
        let shared = &self.shared;
        Statistics {
            frames: shared.frames.load(Ordering::Relaxed),
            dropped_frames: shared.dropped_frames.load(Ordering::Relaxed),
            skipped_payloads: shared.skipped_payloads.load(Ordering::Relaxed),
            discarded_bytes: shared.discarded_bytes.load(Ordering::Relaxed),
        }
    }

    // === Feedback ===

    /// Heading in radians, from the configured source
    pub fn heading(&self) -> f64 {
        let pose = lock(&self.shared.odometry).pose();
        match self.shared.heading_source {
            HeadingSource::Encoder => pose.heading,
            HeadingSource::EncoderBiased => {
                wrap_angle(pose.heading + self.shared.imu_heading_offset)
            }
            HeadingSource::Imu => self.shared.gyro_heading().unwrap_or(pose.heading),
        }
    }

    /// Angular velocity in rad/s
    pub fn angular_velocity(&self) -> f64 {
        if self.shared.heading_source == HeadingSource::Imu {
            if let Some(inertia) = self.shared.records.inertia() {
                return inertia.angular_velocity();
            }
        }
        lock(&self.shared.odometry).rates().angular
    }

    pub fn wheel_joint_states(&self) -> WheelJointStates {
        lock(&self.shared.odometry).wheel_joint_states()
    }

    /// Pose change since the previous call, with the latest velocity estimate
    pub fn update_odometry(&self) -> OdometryUpdate {
        lock(&self.shared.odometry).take_update()
    }

    /// Pose accumulated since start or the last reset
    pub fn pose(&self) -> Pose2D {
        lock(&self.shared.odometry).pose()
    }

    /// Zero the pose, keeping sensor data
    pub fn reset_odometry(&self) {
        let mut odometry = lock(&self.shared.odometry);
        let latest = odometry
            .is_initialised()
            .then(|| self.shared.records.core_sensors());
        odometry.reset(latest.as_ref());
        debug!("Odometry reset");
    }

    // === Commands ===

    /// Set a single LED, keeping the other one as it was
    pub fn toggle_led(&self, number: LedNumber, colour: LedColour) -> Result<()> {
        self.ensure_enabled()?;
        let output = {
            let mut command = lock(&self.shared.command);
            command.digital_output = apply_led(command.digital_output, number, colour);
            command.digital_output
        };
        self.send_command(Command::SetDigitalOutput(output))
    }

    /// Store a body velocity (m/s, rad/s); the loop keeps sending it while enabled
    pub fn set_base_control_command(&self, linear: f64, angular: f64) {
        let base = BaseControl::from_velocity(linear, angular, self.shared.wheelbase);
        let mut command = lock(&self.shared.command);
        command.linear = linear;
        command.angular = angular;
        command.base = base;
    }

    /// Last requested body velocity (m/s, rad/s)
    pub fn base_control_command(&self) -> (f64, f64) {
        let command = lock(&self.shared.command);
        (command.linear, command.angular)
    }

    /// Send the stored base control command now
    pub fn send_base_control_command(&self) -> Result<()> {
        let base = lock(&self.shared.command).base;
        self.send_command(Command::BaseControl(base))
    }

    /// Send any command
    pub fn send_command(&self, command: Command) -> Result<()> {
        self.ensure_enabled()?;
        self.write_frame(command.encode())
    }

    fn ensure_enabled(&self) -> Result<()> {
        if !self.connected() {
            return Err(DriverError::NotConnected);
        }
        if !self.is_enabled() {
            return Err(DriverError::NotEnabled);
        }
        Ok(())
    }

    /// Write now if the transport is still here, otherwise hand it to the loop
    fn write_frame(&self, bytes: Vec<u8>) -> Result<()> {
        let mut slot = lock(&self.transport);
        if let Some(transport) = slot.as_mut() {
            transport.write_all(&bytes)?;
        } else {
            // The loop clears `running` under this lock after its last drain
            let mut outgoing = lock(&self.shared.outgoing);
            if !self.is_running() {
                return Err(DriverError::NotConnected);
            }
            outgoing.extend_from_slice(&bytes);
        }
        Ok(())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Stop the base and the loop when the driver goes away
        if let Err(e) = self.close() {
            warn!("Failed to close driver on drop: {}", e);
        }
    }
}

/// Body of the loop thread. Hands the transport back when it exits.
fn run_loop(shared: Arc<Shared>, mut transport: Box<dyn Transport>) -> Box<dyn Transport> {
    let mut finder = FrameFinder::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut last_sent: Option<Instant> = None;

    // Service request, answered with the version payloads
    let mut result = transport.write_all(&Command::version_request().encode());
    while result.is_ok() && !shared.stop.load(Ordering::Acquire) {
        result = cycle(&shared, transport.as_mut(), &mut finder, &mut buf, &mut last_sent);
    }

    finish(&shared, transport.as_mut(), result);
    debug!("Driver loop exited");
    transport
}

/// Flush or discard queued commands, then leave `Running`
fn finish(shared: &Shared, transport: &mut dyn Transport, result: io::Result<()>) {
    let mut outgoing = lock(&shared.outgoing);
    match result {
        Ok(()) => {
            let pending = mem::take(&mut *outgoing);
            if !pending.is_empty() {
                if let Err(e) = transport.write_all(&pending) {
                    warn!("Failed to flush commands on shutdown: {}", e);
                }
            }
        }
        Err(e) => {
            outgoing.clear();
            shared.fault(&e);
        }
    }
    shared.running.store(false, Ordering::Release);
}

/// One read-decode-write pass
fn cycle(
    shared: &Shared,
    transport: &mut dyn Transport,
    finder: &mut FrameFinder,
    buf: &mut [u8],
    last_sent: &mut Option<Instant>,
) -> io::Result<()> {
    // 1. Bounded-wait read
    let n = transport.read(buf)?;

    // 2-3. Frame, decode, notify
    let mut streamed = false;
    for frame in finder.feed(&buf[..n]) {
        let report = decode_frame(&frame, &shared.records);
        if report.core_sensors {
            shared.refresh_odometry();
        }
        if report.version {
            let version = shared.records.version_info();
            info!("Version info: {}", version);
            shared.emit(DriverEvent::VersionInfo(version));
        }
        if report.skipped > 0 {
            shared
                .skipped_payloads
                .fetch_add(u64::from(report.skipped), Ordering::Relaxed);
        }
        streamed |= report.streamed;
    }
    shared.record_stats(finder.stats());
    if streamed {
        shared.emit(DriverEvent::StreamData);
    }

    // 4. Explicit commands, then the watchdog-feeding retransmission
    let queued = mem::take(&mut *lock(&shared.outgoing));
    if !queued.is_empty() {
        transport.write_all(&queued)?;
    }

    let due = last_sent.is_none_or(|sent| sent.elapsed() >= COMMAND_PERIOD);
    if shared.enabled.load(Ordering::Acquire) && due {
        let base = lock(&shared.command).base;
        transport.write_all(&Command::BaseControl(base).encode())?;
        *last_sent = Some(Instant::now());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::packet::build_frame;
    use crate::base::payloads::id;
    use crate::base::transport::mock::MockTransport;
    use std::thread::sleep;
    use std::time::Duration;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(5));
        }
        false
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn core_frame(time_stamp: u16, left: u16, right: u16) -> Vec<u8> {
        let mut payload = vec![id::CORE_SENSORS, 15];
        payload.extend(time_stamp.to_le_bytes());
        payload.extend([0, 0, 0]);
        payload.extend(left.to_le_bytes());
        payload.extend(right.to_le_bytes());
        payload.extend([0, 0, 0, 0, 150, 0]);
        build_frame(&payload)
    }

    fn connected_driver() -> (Driver, MockTransport) {
        let mock = MockTransport::new();
        let mut driver = Driver::new();
        driver
            .init_with_transport(Parameters::default(), Box::new(mock.clone()))
            .unwrap();
        (driver, mock)
    }

    #[test]
    fn test_close_while_disconnected_is_noop() {
        let driver = Driver::new();
        assert_eq!(driver.state(), ConnectionState::Disconnected);
        assert!(driver.close().is_ok());
        assert!(driver.close().is_ok());
        assert_eq!(driver.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_invalid_parameters_rejected_at_init() {
        let mut driver = Driver::new();
        let params = Parameters {
            wheelbase: 0.0,
            ..Parameters::default()
        };
        let result = driver.init_with_transport(params, Box::new(MockTransport::new()));
        assert!(matches!(result, Err(DriverError::InvalidParameter { .. })));
        assert_eq!(driver.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_missing_port_fails_init() {
        let mut driver = Driver::new();
        let params = Parameters {
            device_port: "/dev/kobuki-does-not-exist".to_string(),
            ..Parameters::default()
        };
        assert!(driver.init(params).is_err());
        assert!(!driver.connected());
    }

    #[test]
    fn test_lifecycle_states() {
        let (driver, _mock) = connected_driver();
        assert_eq!(driver.state(), ConnectionState::Connected);

        driver.enable().unwrap();
        assert_eq!(driver.state(), ConnectionState::Enabled);

        driver.start().unwrap();
        assert_eq!(driver.state(), ConnectionState::Running);
        assert!(matches!(driver.start(), Err(DriverError::AlreadyRunning)));

        driver.close().unwrap();
        assert_eq!(driver.state(), ConnectionState::Disconnected);
        driver.close().unwrap();
    }

    #[test]
    fn test_commands_need_enable() {
        let (driver, mock) = connected_driver();
        let result = driver.send_command(Command::version_request());
        assert!(matches!(result, Err(DriverError::NotEnabled)));
        assert!(matches!(
            driver.toggle_led(LedNumber::Led1, LedColour::Red),
            Err(DriverError::NotEnabled)
        ));
        assert!(mock.written().is_empty());
    }

    #[test]
    fn test_command_before_start_writes_directly() {
        let (driver, mock) = connected_driver();
        driver.enable().unwrap();
        driver.toggle_led(LedNumber::Led2, LedColour::Green).unwrap();
        assert_eq!(mock.written(), Command::SetDigitalOutput(0x0800).encode());
    }

    #[test]
    fn test_version_requested_on_start() {
        let (driver, mock) = connected_driver();
        let mut events = driver.subscribe();
        driver.start().unwrap();

        let request = Command::version_request().encode();
        assert!(wait_for(|| contains(&mock.written(), &request)));

        mock.push_incoming(&build_frame(&[
            id::HARDWARE, 4, 4, 0, 1, 0, //
            id::FIRMWARE, 4, 3, 1, 1, 0,
        ]));
        assert!(wait_for(|| driver.version_info().firmware.minor == 1));
        assert_eq!(driver.version_info().hardware.patch, 4);

        assert!(wait_for(|| matches!(
            events.try_recv(),
            Ok(DriverEvent::VersionInfo(_))
        )));
        driver.close().unwrap();
    }

    #[test]
    fn test_stream_data_updates_records_and_notifies() {
        let (driver, mock) = connected_driver();
        let mut events = driver.subscribe();
        driver.start().unwrap();

        let mut bytes = core_frame(100, 1000, 2000);
        bytes.extend([0x00, 0x13]); // line noise
        bytes.extend(build_frame(&[id::CLIFF, 6, 1, 0, 2, 0, 3, 0]));
        mock.push_incoming(&bytes);

        assert!(wait_for(|| driver.cliff_data().bottom == [1, 2, 3]));
        assert_eq!(driver.core_sensor_data().left_encoder, 1000);
        assert_eq!(driver.core_sensor_data().battery, 150);
        assert!(wait_for(|| matches!(events.try_recv(), Ok(DriverEvent::StreamData))));
        assert!(wait_for(|| driver.statistics().frames == 2));

        driver.close().unwrap();
    }

    #[test]
    fn test_corrupt_frame_counted() {
        let (driver, mock) = connected_driver();
        driver.start().unwrap();

        let mut bad = core_frame(0, 1, 1);
        let last = bad.len() - 1;
        bad[last] ^= 0x40;
        mock.push_incoming(&bad);
        mock.push_incoming(&core_frame(10, 5, 5));

        assert!(wait_for(|| driver.core_sensor_data().left_encoder == 5));
        assert!(wait_for(|| driver.statistics().dropped_frames == 1));
        driver.close().unwrap();
    }

    #[test]
    fn test_odometry_through_driver() {
        let (driver, mock) = connected_driver();
        driver.start().unwrap();

        mock.push_incoming(&core_frame(0, 65500, 65500));
        mock.push_incoming(&core_frame(20, 20, 20));
        assert!(wait_for(|| driver.pose().x > 0.0));

        let update = driver.update_odometry();
        assert!(update.delta.x > 0.0);
        assert!(update.rates.linear > 0.0);
        assert!(driver.wheel_joint_states().left_angle > 0.0);

        driver.reset_odometry();
        assert_eq!(driver.pose(), Pose2D::identity());
        driver.reset_odometry();
        assert_eq!(driver.pose(), Pose2D::identity());
        assert_eq!(driver.core_sensor_data().left_encoder, 20);

        driver.close().unwrap();
    }

    #[test]
    fn test_base_control_retransmitted_until_disabled() {
        let (driver, mock) = connected_driver();
        driver.enable().unwrap();
        driver.set_base_control_command(0.1, 0.0);
        driver.start().unwrap();

        let forward = Command::BaseControl(BaseControl {
            speed: 100,
            radius: 0,
        })
        .encode();
        assert!(wait_for(|| mock
            .written()
            .windows(forward.len())
            .filter(|w| *w == forward.as_slice())
            .count()
            >= 2));

        driver.disable().unwrap();
        assert_eq!(driver.state(), ConnectionState::Running);
        let stop = Command::BaseControl(BaseControl::stop()).encode();
        assert!(wait_for(|| mock.written().ends_with(&stop)));

        sleep(Duration::from_millis(60));
        let settled = mock.written().len();
        sleep(Duration::from_millis(60));
        assert_eq!(mock.written().len(), settled);

        // Telemetry still flows while disabled
        mock.push_incoming(&core_frame(5, 42, 43));
        assert!(wait_for(|| driver.core_sensor_data().right_encoder == 43));

        driver.close().unwrap();
    }

    #[test]
    fn test_queued_commands_flushed_or_refused_at_loop_exit() {
        let (driver, mock) = connected_driver();
        driver.enable().unwrap();

        // Stand in for a running loop that owns the transport
        let mut transport = lock(&driver.transport).take().unwrap();
        driver.shared.running.store(true, Ordering::Release);

        let stop = Command::BaseControl(BaseControl::stop()).encode();
        driver.write_frame(stop.clone()).unwrap();
        assert!(mock.written().is_empty());

        finish(&driver.shared, transport.as_mut(), Ok(()));
        assert!(contains(&mock.written(), &stop));
        assert!(!driver.is_running());

        // Nothing can be queued once the loop is gone
        assert!(matches!(
            driver.write_frame(stop),
            Err(DriverError::NotConnected)
        ));
        assert!(lock(&driver.shared.outgoing).is_empty());
    }

    #[test]
    fn test_transport_fault_disconnects() {
        let (driver, mock) = connected_driver();
        let mut events = driver.subscribe();
        driver.enable().unwrap();
        driver.start().unwrap();

        mock.break_link();
        assert!(wait_for(|| driver.state() == ConnectionState::Disconnected));
        assert!(!driver.is_enabled());
        assert!(wait_for(|| matches!(
            events.try_recv(),
            Ok(DriverEvent::Diagnostic {
                severity: Severity::Error,
                ..
            })
        )));

        assert!(matches!(
            driver.send_base_control_command(),
            Err(DriverError::NotConnected)
        ));
        driver.close().unwrap();
        assert_eq!(driver.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reinit_after_close() {
        let (mut driver, _mock) = connected_driver();
        driver.start().unwrap();
        driver.close().unwrap();

        driver
            .init_with_transport(Parameters::default(), Box::new(MockTransport::new()))
            .unwrap();
        assert_eq!(driver.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_heading_sources() {
        let mock = MockTransport::new();
        let mut driver = Driver::new();
        let params = Parameters {
            heading_source: HeadingSource::Imu,
            imu_heading_offset: 0.5,
            ..Parameters::default()
        };
        driver.init_with_transport(params, Box::new(mock.clone())).unwrap();
        driver.start().unwrap();

        // No gyro yet: encoder heading
        assert_eq!(driver.heading(), 0.0);

        // 90.00 degrees, 10.00 deg/s
        mock.push_incoming(&build_frame(&[id::INERTIA, 7, 0x28, 0x23, 0xE8, 0x03, 0, 0, 0]));
        assert!(wait_for(|| driver.inertia_data().is_some()));
        assert!((driver.heading() - (std::f64::consts::FRAC_PI_2 - 0.5)).abs() < 1e-9);
        assert!((driver.angular_velocity() - 10f64.to_radians()).abs() < 1e-9);

        driver.close().unwrap();
    }
}
