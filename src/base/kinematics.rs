// Differential-drive kinematics for the Kobuki base
// Converts wheel travel into body-frame pose deltas, and body velocities into wheel speeds.

use std::f64::consts::PI;

use serde::Serialize;

/// Planar pose: position in metres, heading in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose2D {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    /// Apply `delta`, expressed in this pose's frame
    pub fn compose(&self, delta: &Pose2D) -> Pose2D {
        let (sin, cos) = self.heading.sin_cos();
        Pose2D {
            x: self.x + cos * delta.x - sin * delta.y,
            y: self.y + sin * delta.x + cos * delta.y,
            heading: wrap_angle(self.heading + delta.heading),
        }
    }
}

/// Wrap an angle into (-pi, pi]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI { PI } else { wrapped }
}

/// Individual wheel speeds in m/s
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelSpeeds {
    pub left: f64,
    pub right: f64,
}

/// Two-wheel differential drive with a fixed wheelbase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffDrive {
    wheelbase: f64,
}

impl DiffDrive {
    pub fn new(wheelbase: f64) -> Self {
        Self { wheelbase }
    }

    pub fn wheelbase(&self) -> f64 {
        self.wheelbase
    }

    /// Pose delta in the robot frame for the given wheel travel (metres).
    ///
    /// The robot's x axis points forward, so the lateral component is always zero.
    pub fn forward(&self, left_distance: f64, right_distance: f64) -> Pose2D {
        let linear = (right_distance + left_distance) / 2.0;
        let heading = (right_distance - left_distance) / self.wheelbase;
        Pose2D::new(linear, 0.0, heading)
    }

    /// Wheel speeds producing the body velocities `linear` (m/s) and `angular` (rad/s)
    pub fn inverse(&self, linear: f64, angular: f64) -> WheelSpeeds {
        let offset = angular * self.wheelbase / 2.0;
        WheelSpeeds {
            left: linear - offset,
            right: linear + offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: f64 = 0.23;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_straight_travel() {
        let drive = DiffDrive::new(B);
        let delta = drive.forward(0.1, 0.1);
        assert!(close(delta.x, 0.1));
        assert!(close(delta.heading, 0.0));
        assert_eq!(delta.y, 0.0);
    }

    #[test]
    fn test_spin_in_place() {
        let drive = DiffDrive::new(B);
        let d = 0.05;
        let delta = drive.forward(-d, d);
        assert!(close(delta.x, 0.0));
        assert!(close(delta.heading, 2.0 * d / B));

        // Opposite spin gives the mirrored heading delta
        let delta = drive.forward(d, -d);
        assert!(close(delta.heading, -2.0 * d / B));
    }

    #[test]
    fn test_inverse_matches_forward() {
        let drive = DiffDrive::new(B);
        let wheels = drive.inverse(0.3, 1.2);
        let delta = drive.forward(wheels.left, wheels.right);
        assert!(close(delta.x, 0.3));
        assert!(close(delta.heading, 1.2));
    }

    #[test]
    fn test_compose_rotates_into_heading_frame() {
        let pose = Pose2D::new(1.0, 2.0, PI / 2.0);
        let moved = pose.compose(&Pose2D::new(0.5, 0.0, 0.0));
        assert!((moved.x - 1.0).abs() < 1e-12);
        assert!((moved.y - 2.5).abs() < 1e-12);
        assert!(close(moved.heading, PI / 2.0));
    }

    #[test]
    fn test_wrap_angle() {
        assert!(close(wrap_angle(0.0), 0.0));
        assert!(close(wrap_angle(PI), PI));
        assert!(close(wrap_angle(-PI), PI));
        assert!(close(wrap_angle(3.0 * PI / 2.0), -PI / 2.0));
        assert!(close(wrap_angle(-5.0 * PI / 2.0), -PI / 2.0));
    }
}
