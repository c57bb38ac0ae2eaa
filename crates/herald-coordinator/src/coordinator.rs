//! Dependency-aware execution of compound commands.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use herald_bus::EventChannel;
use herald_core::config::{CoordinatorConfig, FailureMode};
use herald_core::types::{Intent, Timestamp};
use herald_router::{CapabilityError, RuleMatcher, TextGenerator};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::decompose::Decomposer;
use crate::error::CoordinatorError;
use crate::executor::SubTaskExecutor;
use crate::template::resolve_params;
use crate::types::{
    CommandReport, CommandStatus, CompoundCommand, CoordinatorStats, SubTaskStatus,
};

/// Cooperative cancellation, honoured between steps only.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Snapshot of a command in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCommand {
    pub id: Uuid,
    pub original_text: String,
    pub started_at: Timestamp,
    pub steps: usize,
}

struct ActiveEntry {
    info: ActiveCommand,
    cancel: CancelHandle,
}

struct StepOutcome {
    index: usize,
    result: Result<serde_json::Value, CapabilityError>,
    attempts: u32,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.max)
    }
}

pub struct Coordinator {
    decomposer: Decomposer,
    executor: Arc<dyn SubTaskExecutor>,
    bus: Option<Arc<EventChannel>>,
    config: CoordinatorConfig,
    active: Mutex<HashMap<Uuid, ActiveEntry>>,
    history: Mutex<VecDeque<CompoundCommand>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, executor: Arc<dyn SubTaskExecutor>) -> Self {
        let timeout = Duration::from_secs(config.capability_timeout_secs);
        Self {
            decomposer: Decomposer::new(RuleMatcher::default(), timeout),
            executor,
            bus: None,
            config,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Publish reports on the channel.
    pub fn with_bus(mut self, bus: Arc<EventChannel>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_decomposer(mut self, decomposer: Decomposer) -> Self {
        self.decomposer = decomposer;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.decomposer = self.decomposer.with_generator(generator);
        self
    }

    pub fn is_compound(&self, text: &str) -> bool {
        self.decomposer.is_compound(text)
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.config.failure_mode
    }

    /// Decompose `text` into a pending command.
    pub async fn plan(&self, text: &str, context_id: &str) -> Result<CompoundCommand, CoordinatorError> {
        let steps = self.decomposer.decompose(text).await?;
        CompoundCommand::new(text, context_id, steps)
    }

    /// Decompose and execute `text`.
    pub async fn run(&self, text: &str, context_id: &str) -> Result<CommandReport, CoordinatorError> {
        let command = self.plan(text, context_id).await?;
        Ok(self.execute(command, CancelHandle::new()).await)
    }

    /// Request cancellation of an active command.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock_active().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(command_id = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<ActiveCommand> {
        self.lock_active().values().map(|e| e.info.clone()).collect()
    }

    /// Most recent finished commands, oldest first.
    pub fn history(&self, limit: usize) -> Vec<CompoundCommand> {
        let history = self.lock_history();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let active = self.lock_active().len();
        let history = self.lock_history();
        let total = history.len();
        let completed = history
            .iter()
            .filter(|c| c.status == CommandStatus::Completed)
            .count();
        let failed = history
            .iter()
            .filter(|c| c.status == CommandStatus::Failed)
            .count();
        CoordinatorStats {
            active,
            total,
            completed,
            failed,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Drive `command` to a terminal state and publish one report.
    ///
    /// Steps start only once their dependency has completed; independent
    /// steps run concurrently up to `max_parallel`. In fail-fast mode the
    /// first failure stops new steps from starting; in best-effort mode only
    /// the failed step's dependents are cancelled.
    pub async fn execute(&self, mut command: CompoundCommand, cancel: CancelHandle) -> CommandReport {
        let started = Instant::now();
        let id = command.id;
        if let Err(e) = command.begin() {
            error!(command_id = %id, error = %e, "Command is not pending");
            return command.report(0);
        }
        self.lock_active().insert(
            id,
            ActiveEntry {
                info: ActiveCommand {
                    id,
                    original_text: command.original_text.clone(),
                    started_at: command.started_at.unwrap_or_else(Timestamp::now),
                    steps: command.sub_tasks.len(),
                },
                cancel: cancel.clone(),
            },
        );
        info!(command_id = %id, steps = command.sub_tasks.len(), "Executing compound command");

        let mode = self.config.failure_mode;
        let max_parallel = self.config.max_parallel.max(1);
        let mut running: JoinSet<StepOutcome> = JoinSet::new();
        let mut halted = false;

        loop {
            if !halted && cancel.is_cancelled() {
                info!(command_id = %id, "Command cancelled at step boundary");
                command.mark_cancelled();
                halted = true;
            }
            if !halted {
                while running.len() < max_parallel {
                    let Some(index) = command.next_ready() else {
                        break;
                    };
                    self.launch(&mut command, index, &mut running);
                }
            }
            if mode == FailureMode::BestEffort {
                for step in command.cancel_blocked() {
                    debug!(command_id = %id, step = %step, "Dependent step cancelled");
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Steps catch their own panics; this only fires on abort.
                    error!(command_id = %id, error = %e, "Step task lost");
                    continue;
                }
            };
            let failed = self.settle(&mut command, outcome);
            if failed && mode == FailureMode::FailFast {
                halted = true;
            }
        }

        let cancelled = command.cancel_pending();
        if !cancelled.is_empty() {
            debug!(command_id = %id, ?cancelled, "Pending steps cancelled");
        }
        if let Err(e) = command.finish() {
            error!(command_id = %id, error = %e, "Could not finish command");
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let report = command.report(duration_ms);
        if report.succeeded() {
            info!(command_id = %id, duration_ms, "Compound command completed");
        } else {
            warn!(
                command_id = %id,
                failing_step = ?report.failing_step,
                error = ?report.error,
                "Compound command failed"
            );
        }

        self.lock_active().remove(&id);
        self.archive(command);
        self.publish(&report).await;
        report
    }

    fn launch(&self, command: &mut CompoundCommand, index: usize, running: &mut JoinSet<StepOutcome>) {
        let task = &mut command.sub_tasks[index];
        if let Err(e) = task.transition(SubTaskStatus::Executing) {
            error!(step = %task.id, error = %e, "Step could not start");
            return;
        }
        debug!(step = %task.id, action = %task.action, target = %task.target, "Step executing");

        let mut params = match resolve_params(&task.parameters, &command.state) {
            Ok(params) => params,
            Err(reason) => {
                running.spawn(async move {
                    StepOutcome {
                        index,
                        result: Err(CapabilityError::InvalidParameters(reason)),
                        attempts: 0,
                    }
                });
                return;
            }
        };
        if let Some(previous) = task.depends_on.as_ref().and_then(|d| command.state.get(d)) {
            params.insert("previous_result".into(), previous.clone());
        }

        let intent = Intent::new(
            task.action.clone(),
            task.target.clone(),
            params,
            1.0,
            command.id.to_string(),
            format!("{} on {}", task.action, task.target),
        );
        let executor = Arc::clone(&self.executor);
        let timeout = Duration::from_secs(self.config.capability_timeout_secs);
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            base: Duration::from_millis(self.config.backoff_base_ms),
            max: Duration::from_millis(self.config.backoff_max_ms),
        };
        running.spawn(async move {
            // A panicking executor fails its step instead of the command.
            let attempt = tokio::spawn(run_with_retry(executor, intent, timeout, policy));
            match attempt.await {
                Ok((result, attempts)) => StepOutcome {
                    index,
                    result,
                    attempts,
                },
                Err(e) => StepOutcome {
                    index,
                    result: Err(CapabilityError::Other(format!("step panicked: {}", e))),
                    attempts: 1,
                },
            }
        });
    }

    /// Apply a step outcome. Returns true when the step failed.
    fn settle(&self, command: &mut CompoundCommand, outcome: StepOutcome) -> bool {
        let step = command.sub_tasks[outcome.index].id.clone();
        match outcome.result {
            Ok(value) => {
                if let Err(e) = command.record_success(outcome.index, value, outcome.attempts) {
                    error!(step = %step, error = %e, "Could not record step result");
                }
                debug!(step = %step, attempts = outcome.attempts, "Step completed");
                false
            }
            Err(e) => {
                warn!(
                    step = %step,
                    attempts = outcome.attempts,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Step failed"
                );
                if let Err(err) = command.record_failure(outcome.index, e.to_string(), outcome.attempts) {
                    error!(step = %step, error = %err, "Could not record step failure");
                }
                true
            }
        }
    }

    fn archive(&self, command: CompoundCommand) {
        let mut history = self.lock_history();
        history.push_back(command);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    async fn publish(&self, report: &CommandReport) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus.publish_event(&report.to_domain_event()).await {
            warn!(command_id = %report.command_id, error = %e, "Could not publish command report");
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ActiveEntry>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<CompoundCommand>> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Invoke with bounded exponential backoff on retryable errors.
async fn run_with_retry(
    executor: Arc<dyn SubTaskExecutor>,
    intent: Intent,
    timeout: Duration,
    policy: RetryPolicy,
) -> (Result<serde_json::Value, CapabilityError>, u32) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match executor.execute(&intent, timeout).await {
            Ok(value) => return (Ok(value), attempts),
            Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                let delay = policy.backoff(attempts - 1);
                info!(
                    action = %intent.action,
                    target = %intent.target,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying step"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}
