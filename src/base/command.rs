// Outgoing Kobuki commands
//
// Commands are sub-payloads [Id, Len, Data...] wrapped in the same framing
// and checksum as feedback.

use serde::Serialize;

use super::packet::build_frame;

/// Command sub-payload ids
pub mod id {
    pub const BASE_CONTROL: u8 = 1;
    pub const SOUND: u8 = 3;
    pub const SOUND_SEQUENCE: u8 = 4;
    pub const REQUEST_EXTRA: u8 = 9;
    pub const SET_DIGITAL_OUTPUT: u8 = 12;
}

/// Flags for [`Command::RequestExtra`]
pub mod request {
    pub const HARDWARE_VERSION: u16 = 0x01;
    pub const FIRMWARE_VERSION: u16 = 0x02;
    pub const UNIQUE_DEVICE_ID: u16 = 0x08;
}

/// Below this a velocity counts as zero
const EPSILON: f64 = 0.0001;

/// Radius sentinel for straight travel (infinite radius)
pub const RADIUS_STRAIGHT: i16 = 0;
/// Radius sentinel for rotating in place (zero radius)
pub const RADIUS_SPIN: i16 = 1;

/// Base motion in the firmware's native form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BaseControl {
    /// mm/s of the outer wheel (or of both wheels when straight)
    pub speed: i16,
    /// Turning radius in mm; see the `RADIUS_*` sentinels
    pub radius: i16,
}

impl BaseControl {
    pub fn stop() -> Self {
        Self::default()
    }

    /// Map a body velocity (m/s, rad/s) onto speed and radius.
    ///
    /// `wheelbase` is in metres.
    pub fn from_velocity(linear: f64, angular: f64, wheelbase: f64) -> Self {
        // Straight run
        if angular.abs() < EPSILON {
            return Self {
                speed: to_i16(1000.0 * linear),
                radius: RADIUS_STRAIGHT,
            };
        }

        // Radius as it goes on the wire; arcs wider than i16 saturate and
        // keep the commanded angular rate
        let radius = to_i16(linear * 1000.0 / angular);

        // Pure rotation, or a radius that would read back as a sentinel
        if linear.abs() < EPSILON || (-RADIUS_SPIN..=RADIUS_SPIN).contains(&radius) {
            return Self {
                speed: to_i16(1000.0 * wheelbase * angular / 2.0),
                radius: RADIUS_SPIN,
            };
        }

        let half_base = 1000.0 * wheelbase / 2.0;
        let r = f64::from(radius);
        let speed = if radius > 0 {
            (r + half_base) * angular
        } else {
            (r - half_base) * angular
        };

        Self {
            speed: to_i16(speed),
            radius,
        }
    }

    /// Recover the body velocity (m/s, rad/s) this command asks for
    pub fn velocity(&self, wheelbase: f64) -> (f64, f64) {
        let speed = f64::from(self.speed);
        match self.radius {
            RADIUS_STRAIGHT => (speed / 1000.0, 0.0),
            RADIUS_SPIN => (0.0, 2.0 * speed / (1000.0 * wheelbase)),
            radius => {
                let radius = f64::from(radius);
                let half_base = 1000.0 * wheelbase / 2.0;
                let angular = if radius > 0.0 {
                    speed / (radius + half_base)
                } else {
                    speed / (radius - half_base)
                };
                (radius * angular / 1000.0, angular)
            }
        }
    }
}

fn to_i16(value: f64) -> i16 {
    value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// The two LEDs on the Kobuki top panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedNumber {
    Led1,
    Led2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColour {
    Black,
    Red,
    Green,
    Orange,
}

impl LedNumber {
    /// Digital output bits driving this LED
    pub fn mask(self) -> u16 {
        match self {
            LedNumber::Led1 => 0x0300,
            LedNumber::Led2 => 0x0C00,
        }
    }
}

impl LedColour {
    /// Digital output bits for this colour on `led`
    pub fn bits(self, led: LedNumber) -> u16 {
        let (red, green) = match led {
            LedNumber::Led1 => (0x0100, 0x0200),
            LedNumber::Led2 => (0x0400, 0x0800),
        };
        match self {
            LedColour::Black => 0,
            LedColour::Red => red,
            LedColour::Green => green,
            LedColour::Orange => red | green,
        }
    }
}

/// Set `led` to `colour` in a digital output word, leaving the other bits alone
pub fn apply_led(output: u16, led: LedNumber, colour: LedColour) -> u16 {
    (output & !led.mask()) | colour.bits(led)
}

/// Built-in sound sequences
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundSequence {
    On = 0,
    Off = 1,
    Recharge = 2,
    Button = 3,
    Error = 4,
    CleaningStart = 5,
    CleaningEnd = 6,
}

/// A command the base understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    BaseControl(BaseControl),
    /// Tone with the given note period, for `duration` ms
    Sound { note: u16, duration: u8 },
    SoundSequence(SoundSequence),
    /// Ask for service payloads, see [`request`]
    RequestExtra(u16),
    /// Digital outputs, external power and LED bits
    SetDigitalOutput(u16),
}

impl Command {
    pub fn base_control(linear: f64, angular: f64, wheelbase: f64) -> Self {
        Command::BaseControl(BaseControl::from_velocity(linear, angular, wheelbase))
    }

    pub fn version_request() -> Self {
        Command::RequestExtra(request::HARDWARE_VERSION | request::FIRMWARE_VERSION)
    }

    pub fn id(&self) -> u8 {
        match self {
            Command::BaseControl(_) => id::BASE_CONTROL,
            Command::Sound { .. } => id::SOUND,
            Command::SoundSequence(_) => id::SOUND_SEQUENCE,
            Command::RequestExtra(_) => id::REQUEST_EXTRA,
            Command::SetDigitalOutput(_) => id::SET_DIGITAL_OUTPUT,
        }
    }

    /// Append this command as a sub-payload
    pub fn write_payload(&self, out: &mut Vec<u8>) {
        out.push(self.id());
        match *self {
            Command::BaseControl(BaseControl { speed, radius }) => {
                out.push(4);
                out.extend_from_slice(&speed.to_le_bytes());
                out.extend_from_slice(&radius.to_le_bytes());
            }
            Command::Sound { note, duration } => {
                out.push(3);
                out.extend_from_slice(&note.to_le_bytes());
                out.push(duration);
            }
            Command::SoundSequence(sequence) => {
                out.push(1);
                out.push(sequence as u8);
            }
            Command::RequestExtra(flags) | Command::SetDigitalOutput(flags) => {
                out.push(2);
                out.extend_from_slice(&flags.to_le_bytes());
            }
        }
    }

    /// Complete wire frame carrying just this command
    pub fn encode(&self) -> Vec<u8> {
        encode_all(std::slice::from_ref(self))
    }
}

/// One frame carrying several commands
pub fn encode_all(commands: &[Command]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(commands.len() * 6);
    for command in commands {
        command.write_payload(&mut payload);
    }
    build_frame(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::packet::FrameFinder;

    const B: f64 = 0.23;

    #[test]
    fn test_straight_uses_infinite_radius() {
        let cmd = BaseControl::from_velocity(0.25, 0.0, B);
        assert_eq!(cmd, BaseControl { speed: 250, radius: RADIUS_STRAIGHT });
        assert_eq!(cmd.velocity(B), (0.25, 0.0));
    }

    #[test]
    fn test_pure_rotation_uses_zero_radius() {
        let cmd = BaseControl::from_velocity(0.0, 1.0, B);
        assert_eq!(cmd, BaseControl { speed: 115, radius: RADIUS_SPIN });

        let (linear, angular) = cmd.velocity(B);
        assert_eq!(linear, 0.0);
        assert!((angular - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pure_rotation_round_trip() {
        // One mm/s of speed is 2 / (1000 * B) rad/s
        let tolerance = 2.0 / (1000.0 * B);
        for omega in [-2.5, -0.7, -0.01, 0.01, 0.3, 1.9] {
            let (linear, angular) = BaseControl::from_velocity(0.0, omega, B).velocity(B);
            assert_eq!(linear, 0.0);
            assert!(
                (angular - omega).abs() <= tolerance,
                "omega {} came back as {}",
                omega,
                angular
            );
        }
    }

    #[test]
    fn test_arc_round_trip() {
        let cmd = BaseControl::from_velocity(0.2, 0.5, B);
        assert_eq!(cmd.radius, 400);
        assert_eq!(cmd.speed, 258); // (400 + 115) * 0.5 = 257.5

        let (linear, angular) = cmd.velocity(B);
        assert!((linear - 0.2).abs() < 0.01);
        assert!((angular - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_reverse_arc_round_trip() {
        let cmd = BaseControl::from_velocity(-0.2, 0.5, B);
        assert_eq!(cmd.radius, -400);
        let (linear, angular) = cmd.velocity(B);
        assert!((linear + 0.2).abs() < 0.01);
        assert!((angular - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_tight_radius_becomes_spin() {
        let cmd = BaseControl::from_velocity(0.0005, 1.0, B);
        assert_eq!(cmd.radius, RADIUS_SPIN);
    }

    #[test]
    fn test_radius_rounding_to_sentinel_becomes_spin() {
        // 1.4 mm rounds to the spin sentinel, so it must be sent as a spin
        let cmd = BaseControl::from_velocity(0.0014, 1.0, B);
        assert_eq!(cmd, BaseControl { speed: 115, radius: RADIUS_SPIN });

        let (linear, angular) = cmd.velocity(B);
        assert!(linear.abs() < 0.002);
        assert!((angular - 1.0).abs() < 1e-9);

        let cmd = BaseControl::from_velocity(-0.0012, 1.0, B);
        assert_eq!(cmd.radius, RADIUS_SPIN);
    }

    #[test]
    fn test_wide_arc_keeps_angular_rate() {
        // 50 m radius does not fit in i16 mm
        let cmd = BaseControl::from_velocity(0.5, 0.01, B);
        assert_eq!(cmd.radius, i16::MAX);

        let (linear, angular) = cmd.velocity(B);
        assert!((angular - 0.01).abs() < 0.002, "angular came back as {}", angular);
        assert!(linear > 0.0 && linear <= 0.5);

        let cmd = BaseControl::from_velocity(-0.5, 0.01, B);
        assert_eq!(cmd.radius, i16::MIN);
        let (linear, angular) = cmd.velocity(B);
        assert!((angular - 0.01).abs() < 0.002, "angular came back as {}", angular);
        assert!(linear < 0.0);
    }

    #[test]
    fn test_speed_saturates() {
        let cmd = BaseControl::from_velocity(100.0, 0.0, B);
        assert_eq!(cmd.speed, i16::MAX);
    }

    #[test]
    fn test_base_control_wire_bytes() {
        let bytes = Command::BaseControl(BaseControl { speed: -100, radius: 0 }).encode();
        // -100 = 0xFF9C little-endian
        assert_eq!(&bytes[..9], &[0xAA, 0x55, 6, 1, 4, 0x9C, 0xFF, 0x00, 0x00]);

        let mut finder = FrameFinder::new();
        let frame = finder.feed(&bytes).next().expect("command frame should validate");
        assert_eq!(frame.payload(), &[1, 4, 0x9C, 0xFF, 0, 0]);
    }

    #[test]
    fn test_version_request_payload() {
        let mut payload = Vec::new();
        Command::version_request().write_payload(&mut payload);
        assert_eq!(payload, vec![9, 2, 0x03, 0x00]);
    }

    #[test]
    fn test_sound_payloads() {
        let mut payload = Vec::new();
        Command::Sound { note: 0x0123, duration: 50 }.write_payload(&mut payload);
        Command::SoundSequence(SoundSequence::Button).write_payload(&mut payload);
        assert_eq!(payload, vec![3, 3, 0x23, 0x01, 50, 4, 1, 3]);
    }

    #[test]
    fn test_led_bits_merge() {
        let output = apply_led(0, LedNumber::Led1, LedColour::Red);
        assert_eq!(output, 0x0100);
        let output = apply_led(output, LedNumber::Led2, LedColour::Orange);
        assert_eq!(output, 0x0D00);
        let output = apply_led(output, LedNumber::Led1, LedColour::Green);
        assert_eq!(output, 0x0E00);
        let output = apply_led(output | 0x0001, LedNumber::Led2, LedColour::Black);
        assert_eq!(output, 0x0201);
    }

    #[test]
    fn test_encode_all_single_frame() {
        let bytes = encode_all(&[
            Command::SetDigitalOutput(0x0100),
            Command::SoundSequence(SoundSequence::On),
        ]);
        assert_eq!(bytes[2], 7);
        assert_eq!(bytes.len(), 4 + 7);
    }
}
