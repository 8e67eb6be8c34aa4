//! Error types for the simulation boundary.
//!
//! Protocol rejections are not errors; these only cover misuse of the
//! driver. Use `error_stack::Report<...>` with attachments for details.

use std::fmt;

/// Marker error for invalid simulation configuration.
#[derive(Debug)]
pub struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid simulation configuration")
    }
}

impl std::error::Error for ConfigError {}

/// Marker error for commands issued to a running simulation.
#[derive(Debug)]
pub struct SimulationError;

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("simulation command failed")
    }
}

impl std::error::Error for SimulationError {}
