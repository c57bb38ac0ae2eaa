//! Error types for the coordinator.

use herald_bus::BusError;
use herald_core::error::HeraldError;

use crate::types::{CommandStatus, SubTaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid step transition: {0} -> {1}")]
    InvalidTransition(SubTaskStatus, SubTaskStatus),
    #[error("Invalid command transition: {0} -> {1}")]
    InvalidCommandTransition(CommandStatus, CommandStatus),
    #[error("Could not decompose command: {0}")]
    Decomposition(String),
    #[error("Step {step} depends on unknown or later step {depends_on}")]
    InvalidDependency { step: String, depends_on: String },
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("Event channel error: {0}")]
    Bus(#[from] BusError),
}

impl From<CoordinatorError> for HeraldError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Bus(bus) => bus.into(),
            other => HeraldError::Coordinator(other.to_string()),
        }
    }
}
