//! Runtime core for the Kobuki mobile base: serial framing, telemetry
//! decoding, encoder odometry and motion/LED commands.

pub mod base;
pub mod config;
pub mod messages;
pub mod runtime;
