//! Validated status transitions.
//!
//! Steps: Pending -> Executing -> Completed/Failed, Pending -> Cancelled.
//! Commands: Pending -> Executing -> Completed/Failed.
//! Both are one-directional; nothing re-enters a prior status.

use crate::error::CoordinatorError;
use crate::types::{CommandStatus, SubTaskStatus};

pub fn validate_transition(from: SubTaskStatus, to: SubTaskStatus) -> Result<(), CoordinatorError> {
    let valid = matches!(
        (from, to),
        (SubTaskStatus::Pending, SubTaskStatus::Executing)
            | (SubTaskStatus::Pending, SubTaskStatus::Cancelled)
            | (SubTaskStatus::Executing, SubTaskStatus::Completed)
            | (SubTaskStatus::Executing, SubTaskStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidTransition(from, to))
    }
}

pub fn validate_command_transition(
    from: CommandStatus,
    to: CommandStatus,
) -> Result<(), CoordinatorError> {
    let valid = matches!(
        (from, to),
        (CommandStatus::Pending, CommandStatus::Executing)
            | (CommandStatus::Executing, CommandStatus::Completed)
            | (CommandStatus::Executing, CommandStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidCommandTransition(from, to))
    }
}
