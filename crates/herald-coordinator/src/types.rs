//! Sub-tasks, compound commands and their reports.

use std::collections::HashSet;
use std::fmt;

use herald_core::events::DomainEvent;
use herald_core::types::{Parameters, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::state_machine::{validate_command_transition, validate_transition};

/// Reason recorded when a command is cancelled by its caller.
pub const CANCELLED_REASON: &str = "cancelled";

// =============================================================================
// Statuses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubTaskStatus::Completed | SubTaskStatus::Failed | SubTaskStatus::Cancelled
        )
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubTaskStatus::Pending => write!(f, "pending"),
            SubTaskStatus::Executing => write!(f, "executing"),
            SubTaskStatus::Completed => write!(f, "completed"),
            SubTaskStatus::Failed => write!(f, "failed"),
            SubTaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Pending => write!(f, "pending"),
            CommandStatus::Executing => write!(f, "executing"),
            CommandStatus::Completed => write!(f, "completed"),
            CommandStatus::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// SubTask
// =============================================================================

/// One atomic step of a compound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub depends_on: Option<String>,
    pub status: SubTaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Invocations made, retries included.
    pub attempts: u32,
}

impl SubTask {
    pub fn new(
        id: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        parameters: Parameters,
    ) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            target: target.into(),
            parameters,
            depends_on: None,
            status: SubTaskStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn depending_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on = Some(id.into());
        self
    }

    pub fn transition(&mut self, to: SubTaskStatus) -> Result<(), CoordinatorError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }

    /// Short human label, e.g. `step-1 (search mail)`.
    pub fn label(&self) -> String {
        format!("{} ({} {})", self.id, self.action, self.target)
    }
}

// =============================================================================
// CompoundCommand
// =============================================================================

/// A multi-step instruction and its execution state.
///
/// Owned by the coordinator call executing it; `state` accumulates the
/// results of completed steps keyed by step id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundCommand {
    pub id: Uuid,
    pub original_text: String,
    pub context_id: String,
    pub sub_tasks: Vec<SubTask>,
    pub state: serde_json::Map<String, serde_json::Value>,
    pub status: CommandStatus,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    /// First step that failed, if any.
    pub failing_step: Option<String>,
    #[serde(skip)]
    cancelled: bool,
}

impl CompoundCommand {
    /// Build a command, checking that ids are unique and that every
    /// dependency names an earlier step. The graph is therefore acyclic.
    pub fn new(
        original_text: impl Into<String>,
        context_id: impl Into<String>,
        sub_tasks: Vec<SubTask>,
    ) -> Result<Self, CoordinatorError> {
        if sub_tasks.is_empty() {
            return Err(CoordinatorError::Decomposition("no steps".into()));
        }
        let mut seen = HashSet::new();
        for task in &sub_tasks {
            if let Some(dep) = &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(CoordinatorError::InvalidDependency {
                        step: task.id.clone(),
                        depends_on: dep.clone(),
                    });
                }
            }
            if !seen.insert(task.id.as_str()) {
                return Err(CoordinatorError::DuplicateStep(task.id.clone()));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            original_text: original_text.into(),
            context_id: context_id.into(),
            sub_tasks,
            state: serde_json::Map::new(),
            status: CommandStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            failing_step: None,
            cancelled: false,
        })
    }

    pub fn sub_task(&self, id: &str) -> Option<&SubTask> {
        self.sub_tasks.iter().find(|t| t.id == id)
    }

    fn status_of(&self, id: &str) -> Option<SubTaskStatus> {
        self.sub_task(id).map(|t| t.status)
    }

    pub fn begin(&mut self) -> Result<(), CoordinatorError> {
        validate_command_transition(self.status, CommandStatus::Executing)?;
        self.status = CommandStatus::Executing;
        self.started_at = Some(Timestamp::now());
        Ok(())
    }

    /// First pending step whose dependency has completed.
    pub fn next_ready(&self) -> Option<usize> {
        self.sub_tasks.iter().position(|t| {
            t.status == SubTaskStatus::Pending
                && match &t.depends_on {
                    None => true,
                    Some(dep) => self.status_of(dep) == Some(SubTaskStatus::Completed),
                }
        })
    }

    /// Record a step result and merge it into the shared state.
    pub fn record_success(
        &mut self,
        index: usize,
        result: serde_json::Value,
        attempts: u32,
    ) -> Result<(), CoordinatorError> {
        let task = &mut self.sub_tasks[index];
        task.transition(SubTaskStatus::Completed)?;
        task.attempts = attempts;
        task.result = Some(result.clone());
        self.state.insert(task.id.clone(), result);
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        index: usize,
        error: String,
        attempts: u32,
    ) -> Result<(), CoordinatorError> {
        let task = &mut self.sub_tasks[index];
        task.transition(SubTaskStatus::Failed)?;
        task.attempts = attempts;
        task.error = Some(error.clone());
        if self.failing_step.is_none() {
            self.failing_step = Some(task.id.clone());
            self.error = Some(format!("{} failed: {}", task.label(), error));
        }
        Ok(())
    }

    /// Mark the command as cancelled by its caller.
    pub fn mark_cancelled(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            if self.error.is_none() {
                self.error = Some(CANCELLED_REASON.to_string());
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Cancel pending steps whose dependency failed or was cancelled,
    /// directly or transitively. Returns the ids cancelled.
    pub fn cancel_blocked(&mut self) -> Vec<String> {
        let mut cancelled = Vec::new();
        // Dependencies always point backwards, so one forward pass reaches
        // the transitive closure.
        for i in 0..self.sub_tasks.len() {
            let blocked = self.sub_tasks[i].status == SubTaskStatus::Pending
                && self.sub_tasks[i].depends_on.as_deref().is_some_and(|dep| {
                    matches!(
                        self.status_of(dep),
                        Some(SubTaskStatus::Failed | SubTaskStatus::Cancelled)
                    )
                });
            if blocked && self.sub_tasks[i].transition(SubTaskStatus::Cancelled).is_ok() {
                cancelled.push(self.sub_tasks[i].id.clone());
            }
        }
        cancelled
    }

    /// Cancel every step still pending.
    pub fn cancel_pending(&mut self) -> Vec<String> {
        self.sub_tasks
            .iter_mut()
            .filter(|t| t.status == SubTaskStatus::Pending)
            .filter_map(|t| t.transition(SubTaskStatus::Cancelled).ok().map(|_| t.id.clone()))
            .collect()
    }

    /// Move to the terminal status derived from the steps.
    ///
    /// Failed when any step failed or the caller cancelled; otherwise every
    /// step has completed.
    pub fn finish(&mut self) -> Result<CommandStatus, CoordinatorError> {
        let failed = self.cancelled
            || self
                .sub_tasks
                .iter()
                .any(|t| t.status != SubTaskStatus::Completed);
        let to = if failed {
            CommandStatus::Failed
        } else {
            CommandStatus::Completed
        };
        validate_command_transition(self.status, to)?;
        self.status = to;
        self.completed_at = Some(Timestamp::now());
        if failed && self.error.is_none() {
            self.error = Some("not every step completed".into());
        }
        Ok(to)
    }

    pub fn steps_with(&self, status: SubTaskStatus) -> Vec<String> {
        self.sub_tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn report(&self, duration_ms: u64) -> CommandReport {
        CommandReport {
            command_id: self.id,
            original_text: self.original_text.clone(),
            status: self.status,
            failing_step: self.failing_step.clone(),
            error: self.error.clone(),
            completed_steps: self.steps_with(SubTaskStatus::Completed),
            cancelled_steps: self.steps_with(SubTaskStatus::Cancelled),
            duration_ms,
        }
    }
}

// =============================================================================
// Report
// =============================================================================

/// Consolidated outcome of one compound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    pub command_id: Uuid,
    pub original_text: String,
    pub status: CommandStatus,
    pub failing_step: Option<String>,
    pub error: Option<String>,
    pub completed_steps: Vec<String>,
    pub cancelled_steps: Vec<String>,
    pub duration_ms: u64,
}

impl CommandReport {
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    /// One user-facing explanation.
    pub fn summary(&self) -> String {
        let completed = if self.completed_steps.is_empty() {
            "none".to_string()
        } else {
            self.completed_steps.join(", ")
        };
        if self.succeeded() {
            return format!(
                "Done: completed {} step(s) ({}).",
                self.completed_steps.len(),
                completed
            );
        }
        let reason = self.error.as_deref().unwrap_or("unknown error");
        match &self.failing_step {
            Some(step) => format!(
                "Command failed at {}: {}. Completed before: {}.",
                step, reason, completed
            ),
            None => format!("Command {}. Completed before: {}.", reason, completed),
        }
    }

    pub fn to_domain_event(&self) -> DomainEvent {
        if self.succeeded() {
            DomainEvent::CommandCompleted {
                command_id: self.command_id,
                original_text: self.original_text.clone(),
                completed_steps: self.completed_steps.clone(),
                duration_ms: self.duration_ms,
                timestamp: Timestamp::now(),
            }
        } else {
            DomainEvent::CommandFailed {
                command_id: self.command_id,
                original_text: self.original_text.clone(),
                failing_step: self.failing_step.clone(),
                error: self.error.clone().unwrap_or_default(),
                completed_steps: self.completed_steps.clone(),
                cancelled_steps: self.cancelled_steps.clone(),
                timestamp: Timestamp::now(),
            }
        }
    }
}

/// Coordinator counters over the audit history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub active: usize,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,
}
