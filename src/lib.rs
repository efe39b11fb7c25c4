pub mod actions;
pub mod config;
pub mod errors;
pub mod telemetry;
