// Telemetry dump: READ-ONLY check that the base is talking
//
// Commands are never enabled, so the base will not move.
// Use this first before running teleop.
//
// Usage: cargo run --example telemetry_dump -- [port] [seconds]
// Example: cargo run --example telemetry_dump -- /dev/ttyUSB0 5

use kobuki_driver::base::Driver;
use kobuki_driver::config::{Parameters, DEFAULT_PORT};
use kobuki_driver::messages::DriverEvent;
use std::thread::sleep;
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    // Get port and duration from args or use defaults
    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_PORT.to_string());
    let seconds: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Kobuki Telemetry Dump (READ-ONLY)                 ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Commands stay disabled - the base will not move             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Serial port: {}", port);
    println!();

    println!("Step 1: Opening serial port...");
    let mut driver = Driver::new();
    let mut events = driver.subscribe();
    let params = Parameters {
        device_port: port,
        ..Parameters::default()
    };
    if let Err(e) = driver.init(params) {
        println!("  ✗ Failed to open serial port: {}", e);
        println!();
        println!("Troubleshooting:");
        println!("  - Check the port path is correct (udev rule usually gives /dev/kobuki)");
        println!("  - Verify the USB cable is connected and the base is switched on");
        println!("  - Check you are in the dialout group");
        return Err(e.into());
    }
    println!("  ✓ Serial port opened");
    println!();

    println!("Step 2: Listening for {}s...", seconds);
    driver.start()?;
    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut stream_cycles = 0u32;
    let mut version = None;
    while Instant::now() < deadline {
        while let Ok(event) = events.try_recv() {
            match event {
                DriverEvent::StreamData => stream_cycles += 1,
                DriverEvent::VersionInfo(info) => version = Some(info),
                DriverEvent::Diagnostic { severity, message } => {
                    println!("  [{:?}] {}", severity, message)
                }
            }
        }
        sleep(Duration::from_millis(20));
    }
    println!();

    if stream_cycles == 0 {
        println!("⚠ WARNING: No telemetry received!");
        println!("  - Check the base is powered on");
        println!("  - Check the baud rate (115200)");
        driver.close()?;
        return Ok(());
    }

    println!("Step 3: Latest records");
    println!();
    match version {
        Some(info) => println!("  Versions:      {}", info),
        None => println!("  Versions:      no reply to the version request"),
    }

    let core = driver.core_sensor_data();
    println!("  Timestamp:     {} ms", core.time_stamp);
    println!(
        "  Encoders:      left={} right={}",
        core.left_encoder, core.right_encoder
    );
    println!("  Battery:       {:.1} V", f64::from(core.battery) / 10.0);
    println!(
        "  Bumper/drop/cliff: 0x{:02X} 0x{:02X} 0x{:02X}",
        core.bumper, core.wheel_drop, core.cliff
    );
    println!("  Cliff ADC:     {:?}", driver.cliff_data().bottom);
    println!("  Currents:      {:?}", driver.current_data().current);
    println!("  Dock IR:       {:?}", driver.dock_ir_data().docking);
    match driver.inertia_data() {
        Some(inertia) => println!(
            "  Gyro:          {:.2}° at {:.2}°/s",
            f64::from(inertia.angle) / 100.0,
            f64::from(inertia.angle_rate) / 100.0
        ),
        None => println!("  Gyro:          no data"),
    }

    let stats = driver.statistics();
    println!();
    println!(
        "  Link: {} frames in {} cycles, {} dropped, {} sub-payloads skipped",
        stats.frames, stream_cycles, stats.dropped_frames, stats.skipped_payloads
    );

    driver.close()?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Diagnostic Complete                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Next step: Run 'cargo run --example teleop' with the base on the floor");

    Ok(())
}
