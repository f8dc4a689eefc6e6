// Keyboard teleop: W/S forward/back, A/D turn, R/F speed, 1/2 LEDs, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use kobuki_driver::base::{Driver, LedColour, LedNumber};
use kobuki_driver::config::{Parameters, DEFAULT_PORT};
use std::time::{Duration, Instant};
use tracing::info;

const SPEEDS: [f64; 3] = [0.05, 0.15, 0.3]; // m/s
const TURN_SPEEDS: [f64; 3] = [0.3, 0.8, 1.5]; // rad/s
const INPUT_TIMEOUT_MS: u64 = 100; // Reset velocities after this much time with no input
const COLOURS: [LedColour; 4] = [
    LedColour::Black,
    LedColour::Green,
    LedColour::Orange,
    LedColour::Red,
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PORT.to_string());

    info!("Opening Kobuki on {}...", port);
    let mut driver = Driver::new();
    driver.init(Parameters {
        device_port: port,
        ..Parameters::default()
    })?;
    driver.start()?;
    driver.enable()?;

    info!("Controls: W/S=move, A/D=turn, R/F=speed, 1/2=LEDs, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&driver);
    disable_raw_mode()?;

    driver.close()?;
    result
}

fn run_teleop(driver: &Driver) -> Result<(), Box<dyn std::error::Error>> {
    let mut speed_idx: usize = 0;
    let mut led_idx = [0usize; 2];

    // Persistent velocity state
    let mut linear = 0.0;
    let mut angular = 0.0;
    let mut last_movement_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    // Movement - update velocity and refresh timestamp
                    KeyCode::Char('w') if pressed => {
                        linear = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        linear = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        angular = TURN_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        angular = -TURN_SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }

                    // Speed control
                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    // Cycle LED colours
                    KeyCode::Char(c @ ('1' | '2')) if pressed => {
                        let (slot, led) = if c == '1' {
                            (0, LedNumber::Led1)
                        } else {
                            (1, LedNumber::Led2)
                        };
                        led_idx[slot] = (led_idx[slot] + 1) % COLOURS.len();
                        driver.toggle_led(led, COLOURS[led_idx[slot]])?;
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        // Reset velocities if no movement input for INPUT_TIMEOUT_MS
        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            linear = 0.0;
            angular = 0.0;
        }

        // The driver loop keeps retransmitting this
        driver.set_base_control_command(linear, angular);

        if !driver.connected() {
            return Err("lost connection to the base".into());
        }
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
