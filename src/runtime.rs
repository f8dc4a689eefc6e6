// Host process loop: fixed-rate telemetry watchdog around the driver
// Note: the firmware has its own command watchdog; this one watches the other
// direction, flagging the base as stale when telemetry stops arriving.

use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tracing::{error, info, warn};

use serde::Serialize;

use crate::base::{Driver, OdometryUpdate, Pose2D};
use crate::config::{LOOP_HZ, Parameters, STREAM_TIMEOUT};
use crate::messages::{DriverEvent, RuntimeHealth};

/// What the host process should do besides watching telemetry
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Enable commands (the base is held stopped while enabled)
    pub enable: bool,
    /// Print one JSON line of telemetry per loop tick
    pub json: bool,
}

/// One line of JSON telemetry
#[derive(Debug, Serialize)]
struct TelemetryLine {
    health: RuntimeHealth,
    pose: Pose2D,
    odometry: OdometryUpdate,
    battery: u8,
}

pub struct Runtime {
    stream_received_at: Option<Instant>,
    health: RuntimeHealth,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            stream_received_at: None,
            health: RuntimeHealth::StreamStale, // Start stale until first telemetry
        }
    }

    /// Process a driver event
    pub fn on_event(&mut self, event: &DriverEvent) {
        self.on_event_at(event, Instant::now());
    }

    fn on_event_at(&mut self, event: &DriverEvent, now: Instant) {
        match event {
            DriverEvent::StreamData => self.stream_received_at = Some(now),
            DriverEvent::VersionInfo(version) => info!("Base reports {}", version),
            DriverEvent::Diagnostic { .. } => {} // already logged on the driver thread
        }
    }

    /// Compute health from telemetry age and link state
    pub fn compute_health(&mut self, connected: bool) -> RuntimeHealth {
        self.compute_health_at(connected, Instant::now())
    }

    fn compute_health_at(&mut self, connected: bool, now: Instant) -> RuntimeHealth {
        let age = self
            .stream_received_at
            .map(|at| now.saturating_duration_since(at));

        let health = match age {
            _ if !connected => RuntimeHealth::Disconnected,
            Some(age) if age <= STREAM_TIMEOUT => RuntimeHealth::Ok,
            _ => RuntimeHealth::StreamStale,
        };

        if health != self.health && health != RuntimeHealth::Ok {
            warn!("Runtime health {:?} (telemetry age {:?})", health, age);
        }
        self.health = health;
        health
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }
}

pub async fn run(
    params: Parameters,
    options: RunOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Kobuki on {}...", params.device_port);
    let mut driver = Driver::new();
    let mut events = driver.subscribe();
    driver.init(params)?;
    driver.start()?;
    if options.enable {
        driver.enable()?;
    }

    let mut runtime = Runtime::new();
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Runtime started: {}Hz loop, {}ms telemetry timeout",
        LOOP_HZ,
        STREAM_TIMEOUT.as_millis()
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => runtime.on_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} driver events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                let health = runtime.compute_health(driver.connected());
                if health == RuntimeHealth::Disconnected {
                    error!("Lost connection to the base");
                    break;
                }
                if options.json {
                    let line = TelemetryLine {
                        health,
                        pose: driver.pose(),
                        odometry: driver.update_odometry(),
                        battery: driver.core_sensor_data().battery,
                    };
                    println!("{}", serde_json::to_string(&line)?);
                }
            }
        }
    }

    driver.close()?;
    Ok(())
}
