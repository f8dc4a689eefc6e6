use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use kobuki_driver::config::{self, HeadingSource, Parameters};
use kobuki_driver::runtime::RunOptions;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Heading {
    Encoder,
    EncoderBiased,
    Imu,
}

impl From<Heading> for HeadingSource {
    fn from(heading: Heading) -> Self {
        match heading {
            Heading::Encoder => HeadingSource::Encoder,
            Heading::EncoderBiased => HeadingSource::EncoderBiased,
            Heading::Imu => HeadingSource::Imu,
        }
    }
}

/// Kobuki base runtime
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Serial port of the base
    #[arg(long, default_value = config::DEFAULT_PORT)]
    port: String,

    #[arg(long, default_value_t = config::DEFAULT_BAUDRATE)]
    baud: u32,

    /// Wheelbase in metres
    #[arg(long, default_value_t = config::DEFAULT_WHEELBASE)]
    wheelbase: f64,

    #[arg(long, value_enum, default_value = "encoder")]
    heading: Heading,

    /// IMU heading offset in radians
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    imu_offset: f64,

    /// Enable commands (holds the base stopped)
    #[arg(long)]
    enable: bool,

    /// Print telemetry as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let params = Parameters {
        device_port: args.port,
        baud_rate: args.baud,
        wheelbase: args.wheelbase,
        heading_source: args.heading.into(),
        imu_heading_offset: args.imu_offset,
        ..Parameters::default()
    };
    let options = RunOptions {
        enable: args.enable,
        json: args.json,
    };

    if let Err(e) = kobuki_driver::runtime::run(params, options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
