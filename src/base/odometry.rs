// Encoder odometry
//
// Integrates wheel encoder ticks from successive core sensor records into a
// pose. Heading is open-loop from the encoders unless a gyro heading is
// supplied, so wheel slip accumulates as drift.

use std::mem;

use serde::Serialize;

use super::kinematics::{wrap_angle, DiffDrive, Pose2D};
use super::payloads::CoreSensors;
use crate::config::Parameters;

const TICK_MODULUS: i32 = 1 << 16;
const HALF_MODULUS: i32 = 1 << 15;

/// Signed difference between two 16-bit counter readings.
///
/// A raw difference larger than half the counter range is taken to have
/// wrapped around.
pub fn tick_delta(last: u16, current: u16) -> i32 {
    let raw = i32::from(current) - i32::from(last);
    if raw > HALF_MODULUS {
        raw - TICK_MODULUS
    } else if raw < -HALF_MODULUS {
        raw + TICK_MODULUS
    } else {
        raw
    }
}

/// Body velocity estimate: m/s and rad/s
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoseRates {
    pub linear: f64,
    pub angular: f64,
}

/// Pose change and the rate it happened at
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OdometryUpdate {
    pub delta: Pose2D,
    pub rates: PoseRates,
}

/// Accumulated wheel angles (rad) and angular rates (rad/s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WheelJointStates {
    pub left_angle: f64,
    pub left_rate: f64,
    pub right_angle: f64,
    pub right_rate: f64,
}

#[derive(Debug, Clone)]
pub struct Odometry {
    drive: DiffDrive,
    tick_to_mm: f64,
    tick_to_rad: f64,

    initialised: bool,
    last_tick_left: u16,
    last_tick_right: u16,
    last_timestamp: u16,
    /// Seconds between the last two distinct timestamps
    last_diff_time: f64,
    last_gyro_heading: Option<f64>,

    wheels: WheelJointStates,
    pose: Pose2D,
    /// Motion not yet handed out by `take_update`
    pending: Pose2D,
    rates: PoseRates,
}

impl Odometry {
    pub fn new(wheelbase: f64, tick_to_mm: f64, tick_to_rad: f64) -> Self {
        Self {
            drive: DiffDrive::new(wheelbase),
            tick_to_mm,
            tick_to_rad,
            initialised: false,
            last_tick_left: 0,
            last_tick_right: 0,
            last_timestamp: 0,
            last_diff_time: 0.0,
            last_gyro_heading: None,
            wheels: WheelJointStates::default(),
            pose: Pose2D::identity(),
            pending: Pose2D::identity(),
            rates: PoseRates::default(),
        }
    }

    pub fn from_parameters(params: &Parameters) -> Self {
        Self::new(params.wheelbase, params.tick_to_mm, params.tick_to_rad)
    }

    /// Fold in a new core sensor record.
    ///
    /// When `gyro_heading` is given (and was given last time too), its change
    /// replaces the encoder heading delta. The first record only sets the baseline.
    pub fn update(&mut self, core: &CoreSensors, gyro_heading: Option<f64>) -> OdometryUpdate {
        if !self.initialised {
            self.baseline(core);
            self.last_gyro_heading = gyro_heading;
            self.initialised = true;
            return OdometryUpdate::default();
        }

        let left_ticks = tick_delta(self.last_tick_left, core.left_encoder);
        let right_ticks = tick_delta(self.last_tick_right, core.right_encoder);
        self.last_tick_left = core.left_encoder;
        self.last_tick_right = core.right_encoder;

        let left_rad = f64::from(left_ticks) * self.tick_to_rad;
        let right_rad = f64::from(right_ticks) * self.tick_to_rad;
        self.wheels.left_angle += left_rad;
        self.wheels.right_angle += right_rad;

        // tick_to_mm is millimetres, the pose is in metres
        let left_m = f64::from(left_ticks) * self.tick_to_mm / 1000.0;
        let right_m = f64::from(right_ticks) * self.tick_to_mm / 1000.0;
        let mut delta = self.drive.forward(left_m, right_m);

        if let (Some(now), Some(before)) = (gyro_heading, self.last_gyro_heading) {
            delta.heading = wrap_angle(now - before);
        }
        if gyro_heading.is_some() {
            self.last_gyro_heading = gyro_heading;
        }

        // A timestamp that did not advance keeps the previous interval
        let elapsed_ms = tick_delta(self.last_timestamp, core.time_stamp);
        if elapsed_ms > 0 {
            self.last_diff_time = f64::from(elapsed_ms) / 1000.0;
            self.last_timestamp = core.time_stamp;
        }

        if self.last_diff_time > 0.0 {
            let dt = self.last_diff_time;
            self.wheels.left_rate = left_rad / dt;
            self.wheels.right_rate = right_rad / dt;
            self.rates = PoseRates {
                linear: delta.x / dt,
                angular: delta.heading / dt,
            };
        }

        self.pose = self.pose.compose(&delta);
        self.pending = self.pending.compose(&delta);

        OdometryUpdate {
            delta,
            rates: self.rates,
        }
    }

    /// Motion since the previous call, with the latest rate estimate
    pub fn take_update(&mut self) -> OdometryUpdate {
        OdometryUpdate {
            delta: mem::take(&mut self.pending),
            rates: self.rates,
        }
    }

    /// Zero the pose and re-baseline on `core` (the latest sensor snapshot)
    pub fn reset(&mut self, core: Option<&CoreSensors>) {
        self.pose = Pose2D::identity();
        self.pending = Pose2D::identity();
        self.rates = PoseRates::default();
        if let Some(core) = core {
            self.baseline(core);
            self.initialised = true;
        }
    }

    fn baseline(&mut self, core: &CoreSensors) {
        self.last_tick_left = core.left_encoder;
        self.last_tick_right = core.right_encoder;
        self.last_timestamp = core.time_stamp;
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    pub fn rates(&self) -> PoseRates {
        self.rates
    }

    pub fn wheel_joint_states(&self) -> WheelJointStates {
        self.wheels
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }
}
