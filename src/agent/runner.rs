//! Run boundary: options, results and the per-run context shared by both engines.
//!
//! A [`TaskRunner`] owns the collaborators (model gateway, device, optional
//! artifact sink and execution gate). Every call to [`TaskRunner::run`] or
//! [`TaskRunner::run_stream`] creates a fresh [`InfoPool`] and device session,
//! so concurrent runs never share mutable state.

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{
    Action, ActionHandler, ActionOutcome, ActionValidator, BoundsPolicy,
};
use crate::artifacts::ArtifactSink;
use crate::device::{DeviceAdapter, DeviceError};
use crate::model::{ChatMessage, Completion, Decision, ModelError, ModelGateway};
use crate::perception::{Frame, ImageBudget, PerceptionAdapter, PerceptionError};

use super::error::{AgentError, ErrorKind};
use super::events::{EventKind, EventSink, EventStream, StepStatus};
use super::gate::ExecutionGate;
use super::info_pool::{ActionRecord, InfoPool, InfoPoolError, Outcome, PoolSnapshot, Validity};
use super::legacy::SingleAgentEngine;
use super::orchestrator::MultiAgentEngine;
use super::roles::{NotePolicy, Role, RoleKind, DEFAULT_ERR_TO_MANAGER_THRESHOLD};
use super::stats::{RunStats, StatsTracker};

/// Upper bound for the exponential backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Which control loop drives the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    MultiAgent,
    SingleAgent,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "multi_agent" | "multi" => Ok(Self::MultiAgent),
            "single_agent" | "single" | "legacy" => Ok(Self::SingleAgent),
            other => Err(format!("unknown engine `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Aborted,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    TaskFailed,
    BudgetExhausted,
    RetryBudgetExhausted,
    Cancelled,
    DeviceDisconnected,
    InvalidInstruction,
    Busy,
    Fatal,
}

/// Budgets and policies of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_steps: u32,
    /// Attempts per transient operation, and consecutive invalid decisions
    /// tolerated before the run is aborted.
    pub max_retry_attempts: u32,
    /// Re-ask the model on the same screenshot after an invalid decision.
    pub enable_smart_retry: bool,
    pub wait_after_action: Duration,
    /// First backoff delay; doubled per attempt.
    pub retry_delay: Duration,
    pub model_timeout: Duration,
    pub device_timeout: Duration,
    pub streaming: bool,
    pub note_policy: NotePolicy,
    pub bounds_policy: BoundsPolicy,
    pub image_budget: ImageBudget,
    pub err_to_manager_threshold: usize,
    pub engine: EngineKind,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_retry_attempts: 3,
            enable_smart_retry: true,
            wait_after_action: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
            model_timeout: Duration::from_secs(120),
            device_timeout: Duration::from_secs(30),
            streaming: false,
            note_policy: NotePolicy::default(),
            bounds_policy: BoundsPolicy::default(),
            image_budget: ImageBudget::default(),
            err_to_manager_threshold: DEFAULT_ERR_TO_MANAGER_THRESHOLD,
            engine: EngineKind::default(),
        }
    }
}

impl RunOptions {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts.max(1);
        self
    }

    pub fn with_smart_retry(mut self, enabled: bool) -> Self {
        self.enable_smart_retry = enabled;
        self
    }

    pub fn with_wait_after_action(mut self, wait: Duration) -> Self {
        self.wait_after_action = wait;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_note_policy(mut self, policy: NotePolicy) -> Self {
        self.note_policy = policy;
        self
    }

    pub fn with_bounds_policy(mut self, policy: BoundsPolicy) -> Self {
        self.bounds_policy = policy;
        self
    }

    pub fn with_image_budget(mut self, budget: ImageBudget) -> Self {
        self.image_budget = budget;
        self
    }

    pub fn with_err_to_manager_threshold(mut self, threshold: usize) -> Self {
        self.err_to_manager_threshold = threshold.max(1);
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Dispatch deadline; a wait gets its own duration on top.
    fn dispatch_timeout(&self, action: &Action) -> Duration {
        match action {
            Action::Wait { seconds } => self
                .device_timeout
                .saturating_add(Duration::try_from_secs_f64(*seconds).unwrap_or_default()),
            _ => self.device_timeout,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub task_id: String,
    pub status: RunStatus,
    pub reason: TerminalReason,
    pub total_steps: u32,
    /// Action descriptions in step order.
    pub history: Vec<String>,
    pub final_note: String,
    pub stats: RunStats,
    pub records: Vec<ActionRecord>,
    pub error: Option<RunError>,
    pub snapshot: PoolSnapshot,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// How an engine ended the run.
#[derive(Debug)]
pub(crate) struct Terminal {
    pub status: RunStatus,
    pub reason: TerminalReason,
    pub summary: String,
    pub error: Option<AgentError>,
}

impl Terminal {
    pub fn done(success: bool, summary: impl Into<String>) -> Self {
        Self {
            status: if success {
                RunStatus::Success
            } else {
                RunStatus::Failure
            },
            reason: if success {
                TerminalReason::Completed
            } else {
                TerminalReason::TaskFailed
            },
            summary: summary.into(),
            error: None,
        }
    }

    pub fn from_error(error: AgentError) -> Self {
        let (status, reason) = match &error {
            AgentError::Cancelled => (RunStatus::Aborted, TerminalReason::Cancelled),
            AgentError::StepBudgetExhausted(_)
            | AgentError::InfoPool(InfoPoolError::StepBudgetExceeded { .. }) => {
                (RunStatus::Failure, TerminalReason::BudgetExhausted)
            }
            AgentError::RetryBudgetExhausted { .. } => {
                (RunStatus::Aborted, TerminalReason::RetryBudgetExhausted)
            }
            AgentError::Device(DeviceError::Disconnected(_))
            | AgentError::Perception(PerceptionError::Capture(DeviceError::Disconnected(_))) => {
                (RunStatus::Aborted, TerminalReason::DeviceDisconnected)
            }
            AgentError::EmptyInstruction => {
                (RunStatus::Aborted, TerminalReason::InvalidInstruction)
            }
            AgentError::Busy => (RunStatus::Aborted, TerminalReason::Busy),
            _ => (RunStatus::Aborted, TerminalReason::Fatal),
        };
        Self {
            status,
            reason,
            summary: error.to_string(),
            error: Some(error),
        }
    }
}

/// Control flow after a step.
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    Finish(Terminal),
}

/// A decision after validation, ready to act on.
#[derive(Debug, Clone)]
pub(crate) struct Decided {
    pub action: Action,
    pub thinking: String,
    pub conclusion: String,
}

/// State and helpers of one run, shared by both engines.
pub(crate) struct RunContext<'a> {
    pub task_id: String,
    pub pool: InfoPool,
    pub options: &'a RunOptions,
    gateway: &'a dyn ModelGateway,
    device: &'a dyn DeviceAdapter,
    perception: PerceptionAdapter,
    artifacts: Option<&'a dyn ArtifactSink>,
    stats: StatsTracker,
    sink: EventSink,
    cancel: CancellationToken,
    open_step: Option<u32>,
    invalid_streak: u32,
    retry_frame: Option<Frame>,
}

impl<'a> RunContext<'a> {
    /// Cancellation requested or nobody is listening any more.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.sink.is_closed()
    }

    /// Checks made at the top of every step.
    pub fn check_boundary(&self) -> Option<Terminal> {
        if self.is_cancelled() {
            info!(task_id = %self.task_id, step = self.pool.step_count(), "Run cancelled");
            return Some(Terminal::from_error(AgentError::Cancelled));
        }
        if self.pool.is_budget_exhausted() {
            info!(task_id = %self.task_id, max_steps = self.pool.max_steps(), "Step budget exhausted");
            return Some(Terminal::from_error(AgentError::StepBudgetExhausted(
                self.pool.max_steps(),
            )));
        }
        None
    }

    pub fn emit(&self, kind: EventKind) {
        self.sink.emit(kind);
    }

    pub fn step_start(&mut self, step: u32) {
        debug!(task_id = %self.task_id, step, "Step start");
        self.open_step = Some(step);
        self.emit(EventKind::StepStart {
            step,
            max_steps: self.pool.max_steps(),
        });
    }

    pub fn step_end(&mut self, step: u32, status: StepStatus, error: Option<String>) {
        self.open_step = None;
        self.emit(EventKind::StepEnd {
            step,
            status,
            error,
        });
    }

    /// Close an open step and turn the error into a terminal state.
    pub fn abort(&mut self, error: AgentError) -> Terminal {
        warn!(task_id = %self.task_id, kind = ?error.kind(), "Run aborted: {}", error);
        if let Some(step) = self.open_step {
            self.step_end(step, StepStatus::Failed, Some(error.to_string()));
        }
        Terminal::from_error(error)
    }

    pub fn update_stats(&self, f: impl FnOnce(&mut RunStats)) {
        self.stats.update(f);
    }

    /// Frame for the step: the retained one on a smart retry, otherwise a fresh capture.
    pub async fn step_frame(&mut self, step: u32) -> Result<Frame, AgentError> {
        let (frame, reused) = match self.retry_frame.take() {
            Some(frame) => (frame, true),
            None => {
                let frame = self.capture().await?;
                self.pool.set_frame(frame.clone());
                (frame, false)
            }
        };
        self.emit(EventKind::Screenshot {
            step,
            width: frame.width,
            height: frame.height,
            source_width: frame.source_width,
            source_height: frame.source_height,
            reused,
        });
        Ok(frame)
    }

    /// Capture and normalize the screen, retrying transient failures.
    pub async fn capture(&self) -> Result<Frame, AgentError> {
        let limit = self.options.device_timeout;
        let perception = &self.perception;
        self.with_retry("capture", move |_| async move {
            timeout(limit, perception.capture())
                .await
                .map_err(|_| AgentError::DeviceTimeout(limit))?
                .map_err(AgentError::from)
        })
        .await
    }

    /// Run `op` until it succeeds, fails non-transiently, or the attempts run out.
    async fn with_retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let max = self.options.max_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max => {
                    let delay = self.options.backoff(attempt);
                    warn!(
                        task_id = %self.task_id,
                        attempt,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        what,
                        err
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                    }
                    self.update_stats(|s| s.retries_used += 1);
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(AgentError::RetryBudgetExhausted {
                        attempts: attempt,
                        last_error: err.to_string(),
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One model call with retries. Returns the full response text.
    pub async fn call_model(
        &self,
        step: u32,
        role: Option<RoleKind>,
        messages: &[ChatMessage],
    ) -> Result<String, AgentError> {
        let text = self
            .with_retry("model call", move |attempt| {
                self.model_attempt(step, role, messages, attempt)
            })
            .await?;
        let label = role.map(|r| r.as_str()).unwrap_or("agent");
        self.save_artifact(|sink| sink.save_response(&self.task_id, step, label, &text));
        Ok(text)
    }

    async fn model_attempt(
        &self,
        step: u32,
        role: Option<RoleKind>,
        messages: &[ChatMessage],
        attempt: u32,
    ) -> Result<String, AgentError> {
        self.emit(EventKind::ModelCallStart {
            step,
            role,
            model: self.gateway.model_name().to_string(),
            attempt,
        });
        let limit = self.options.model_timeout;
        timeout(limit, self.drain_completion(step, role, messages))
            .await
            .map_err(|_| AgentError::ModelTimeout(limit))?
    }

    /// Collect a completion. A stream is drained here; dropping this future on
    /// timeout drops the stream with it.
    async fn drain_completion(
        &self,
        step: u32,
        role: Option<RoleKind>,
        messages: &[ChatMessage],
    ) -> Result<String, AgentError> {
        let (text, chunks_received) = match self
            .gateway
            .complete(messages, self.options.streaming)
            .await?
        {
            Completion::Text(text) => (text, 0),
            Completion::Stream(mut chunks) => {
                let mut text = String::new();
                let mut count = 0;
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    count += 1;
                    text.push_str(&chunk);
                    self.emit(EventKind::ModelChunk { step, role, chunk });
                }
                (text, count)
            }
        };

        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse.into());
        }
        self.emit(EventKind::ModelComplete {
            step,
            role,
            response_length: text.chars().count(),
            chunks_received,
        });
        Ok(text)
    }

    /// Build a role's messages, call the model and parse the reply.
    pub async fn invoke<R: Role>(
        &self,
        step: u32,
        role: &R,
        frame: &Frame,
    ) -> Result<R::Output, AgentError> {
        let messages = role.build_messages(&self.pool, frame);
        let text = self.call_model(step, Some(role.kind()), &messages).await?;
        let output = role.parse(&self.pool, &text)?;
        Ok(output)
    }

    /// Validate a decision against the frame. Unusable decisions become
    /// [`Action::Invalid`]; only non-decision errors propagate.
    pub fn resolve_decision(
        &mut self,
        step: u32,
        decision: Result<Decision, AgentError>,
        frame: &Frame,
    ) -> Result<Decided, AgentError> {
        let validator = ActionValidator::new(self.options.bounds_policy).with_bounds(frame.bounds());
        let decided = match decision {
            Ok(decision) => {
                let action = validator
                    .validate_str(&decision.action)
                    .unwrap_or_else(|err| Action::invalid(err.to_string()));
                Decided {
                    action,
                    thinking: decision.thinking,
                    conclusion: decision.conclusion,
                }
            }
            Err(err) if err.kind() == ErrorKind::InvalidDecision => Decided {
                action: Action::invalid(err.to_string()),
                thinking: String::new(),
                conclusion: String::new(),
            },
            Err(err) => return Err(err),
        };

        info!(
            task_id = %self.task_id,
            step,
            action = %decided.action.describe(),
            "Action decided"
        );
        self.pool.set_decision(
            decided.action.clone(),
            decided.thinking.clone(),
            decided.conclusion.clone(),
        );
        self.emit(EventKind::ActionParsed {
            step,
            action: decided.action.clone(),
            thinking: decided.thinking.clone(),
            description: decided.conclusion.clone(),
        });
        Ok(decided)
    }

    /// Validity of a usable decision, given the invalid attempts before it.
    pub fn take_validity(&mut self) -> Validity {
        let validity = if self.invalid_streak > 0 {
            Validity::Retried
        } else {
            Validity::Valid
        };
        self.invalid_streak = 0;
        validity
    }

    /// Handle the decisions that never reach the device.
    ///
    /// `done` ends the run. `invalid` is recorded as its own step; the run is
    /// aborted once `max_retry_attempts` invalid decisions happen in a row.
    /// Returns `None` when the action must be executed.
    pub fn conclude_without_device(
        &mut self,
        step: u32,
        decided: &Decided,
        frame: &Frame,
    ) -> Result<Option<Flow>, AgentError> {
        match &decided.action {
            Action::Done { success, summary } => {
                let validity = self.take_validity();
                let outcome = if *success {
                    Outcome::Success
                } else {
                    Outcome::Failure
                };
                let record = ActionRecord::new(step, decided.action.clone(), validity)
                    .with_description(&decided.conclusion)
                    .with_outcome(outcome);
                self.complete_step(record)?;
                self.step_end(step, StepStatus::Finished, None);

                let summary = if summary.is_empty() {
                    decided.conclusion.clone()
                } else {
                    summary.clone()
                };
                Ok(Some(Flow::Finish(Terminal::done(*success, summary))))
            }
            Action::Invalid { reason } => {
                self.invalid_streak += 1;
                let record = ActionRecord::new(step, decided.action.clone(), Validity::Invalid)
                    .with_outcome(Outcome::NoOp)
                    .with_error(reason.clone());
                self.complete_step(record)?;
                self.update_stats(|s| s.invalid_actions += 1);
                self.step_end(step, StepStatus::Invalid, Some(reason.clone()));

                let max = self.options.max_retry_attempts.max(1);
                if self.invalid_streak >= max {
                    return Err(AgentError::RetryBudgetExhausted {
                        attempts: self.invalid_streak,
                        last_error: reason.clone(),
                    });
                }
                if self.options.enable_smart_retry {
                    debug!(task_id = %self.task_id, step, "Smart retry on the same screenshot");
                    self.retry_frame = Some(frame.clone());
                    self.update_stats(|s| s.retries_used += 1);
                }
                Ok(Some(Flow::Continue))
            }
            _ => Ok(None),
        }
    }

    /// Execute a device action, emitting the executing/completed pair.
    ///
    /// Actions the device rejects come back as a failed outcome.
    pub async fn execute(
        &self,
        step: u32,
        action: &Action,
        frame: &Frame,
    ) -> Result<ActionOutcome, AgentError> {
        self.save_artifact(|sink| {
            sink.save_screenshot(&self.task_id, step, "before", frame, Some(action))
        });
        self.emit(EventKind::ActionExecuting {
            step,
            action: action.clone(),
        });

        let handler = ActionHandler::for_frame(frame);
        let device = self.device;
        let limit = self.options.dispatch_timeout(action);
        let result = self
            .with_retry("dispatch", move |_| async move {
                timeout(limit, handler.execute(action, device))
                    .await
                    .map_err(|_| AgentError::DeviceTimeout(limit))?
                    .map_err(AgentError::from)
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(AgentError::Device(DeviceError::Rejected(message))) => {
                warn!(task_id = %self.task_id, step, "Device rejected action: {}", message);
                ActionOutcome::failure(message)
            }
            Err(err) => return Err(err),
        };

        self.emit(EventKind::ActionCompleted {
            step,
            success: outcome.success,
            message: outcome.message.clone(),
        });
        Ok(outcome)
    }

    /// Let the screen settle after an action.
    pub async fn settle(&self) {
        if !self.options.wait_after_action.is_zero() {
            sleep(self.options.wait_after_action).await;
        }
    }

    /// Append the record for `step` and advance the step counter.
    pub fn complete_step(&mut self, record: ActionRecord) -> Result<(), AgentError> {
        self.save_artifact(|sink| sink.save_action(&self.task_id, &record));
        self.pool.record_action(record)?;
        let total = self.pool.advance_step()?;
        self.update_stats(|s| s.total_steps = total);
        Ok(())
    }

    pub fn save_frame(&self, step: u32, label: &str, frame: &Frame) {
        self.save_artifact(|sink| sink.save_screenshot(&self.task_id, step, label, frame, None));
    }

    /// Artifact failures are logged and never affect the run.
    fn save_artifact<F>(&self, f: F)
    where
        F: FnOnce(&dyn ArtifactSink) -> Result<(), crate::artifacts::ArtifactError>,
    {
        if let Some(sink) = self.artifacts {
            if let Err(err) = f(sink) {
                warn!(task_id = %self.task_id, "Failed to save artifact: {}", err);
            }
        }
    }
}

/// Runs tasks against one device and one model.
#[derive(Clone)]
pub struct TaskRunner {
    gateway: Arc<dyn ModelGateway>,
    device: Arc<dyn DeviceAdapter>,
    options: RunOptions,
    gate: Option<ExecutionGate>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    latest_stats: Arc<Mutex<LatestStats>>,
}

/// Tracker of the most recently started run. Each run owns its own.
struct LatestStats {
    tracker: StatsTracker,
    claimed: bool,
}

impl TaskRunner {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        device: Arc<dyn DeviceAdapter>,
        options: RunOptions,
    ) -> Self {
        Self {
            gateway,
            device,
            options,
            gate: None,
            artifacts: None,
            latest_stats: Arc::new(Mutex::new(LatestStats {
                tracker: StatsTracker::new(),
                claimed: false,
            })),
        }
    }

    /// Hold a slot of `gate` from Init to Terminal.
    pub fn with_gate(mut self, gate: ExecutionGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_artifacts(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(sink);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn latest(&self) -> std::sync::MutexGuard<'_, LatestStats> {
        self.latest_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Statistics of the most recently started run.
    pub fn stats(&self) -> RunStats {
        self.latest().tracker.snapshot()
    }

    /// Follow the most recently started run, or the next one if none has
    /// started yet. Later runs get their own channel.
    pub fn subscribe_stats(&self) -> watch::Receiver<RunStats> {
        self.latest().tracker.subscribe()
    }

    /// The tracker for a new run. The first run adopts the initial tracker
    /// so that early subscribers see it.
    fn start_stats(&self) -> StatsTracker {
        let mut latest = self.latest();
        if latest.claimed {
            latest.tracker = StatsTracker::new();
        }
        latest.claimed = true;
        latest.tracker.clone()
    }

    /// Run a task to completion.
    pub async fn run(&self, instruction: &str, cancel: CancellationToken) -> RunResult {
        let task_id = Uuid::new_v4().to_string();
        self.execute(instruction, cancel, EventSink::disabled(task_id))
            .await
    }

    /// Run a task in the background and stream its events.
    ///
    /// Dropping the stream cancels the run at the next step boundary.
    pub fn run_stream(&self, instruction: &str, cancel: CancellationToken) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(Uuid::new_v4().to_string(), tx);
        let runner = self.clone();
        let instruction = instruction.to_string();
        tokio::spawn(async move {
            runner.execute(&instruction, cancel, sink).await;
        });
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    async fn execute(&self, instruction: &str, cancel: CancellationToken, sink: EventSink) -> RunResult {
        let task_id = sink.task_id().to_string();
        let stats = self.start_stats();
        let pool = InfoPool::new(instruction.trim(), self.options.max_steps);

        if instruction.trim().is_empty() {
            return self.finish(&sink, &pool, &stats, Terminal::from_error(AgentError::EmptyInstruction));
        }

        let _permit = match &self.gate {
            Some(gate) => match gate.acquire().await {
                Ok(permit) => Some(permit),
                Err(err) => return self.finish(&sink, &pool, &stats, Terminal::from_error(err)),
            },
            None => None,
        };

        info!(task_id = %task_id, engine = ?self.options.engine, "Starting task: {}", instruction.trim());
        sink.emit(EventKind::TaskInit {
            instruction: instruction.trim().to_string(),
            max_steps: self.options.max_steps,
            engine: self.options.engine,
        });

        let limit = self.options.device_timeout;
        let connected = match timeout(limit, self.device.connect()).await {
            Ok(result) => result.map_err(AgentError::from),
            Err(_) => Err(AgentError::DeviceTimeout(limit)),
        };
        let device_info = match connected {
            Ok(info) => info,
            Err(err) => return self.finish(&sink, &pool, &stats, Terminal::from_error(err)),
        };
        info!(task_id = %task_id, device = %device_info.device_id, "Device connected");
        sink.emit(EventKind::DeviceConnected {
            device: device_info,
        });

        let mut ctx = RunContext {
            task_id,
            pool,
            options: &self.options,
            gateway: self.gateway.as_ref(),
            device: self.device.as_ref(),
            perception: PerceptionAdapter::new(self.device.clone(), self.options.image_budget),
            artifacts: self.artifacts.as_deref(),
            stats: stats.clone(),
            sink: sink.clone(),
            cancel,
            open_step: None,
            invalid_streak: 0,
            retry_frame: None,
        };

        let terminal = match self.options.engine {
            EngineKind::MultiAgent => MultiAgentEngine::new(&self.options).run(&mut ctx).await,
            EngineKind::SingleAgent => SingleAgentEngine::default().run(&mut ctx).await,
        };

        self.device.disconnect().await;
        let pool = ctx.pool;
        self.finish(&sink, &pool, &stats, terminal)
    }

    /// Build the result and emit the closing event.
    fn finish(
        &self,
        sink: &EventSink,
        pool: &InfoPool,
        stats: &StatsTracker,
        terminal: Terminal,
    ) -> RunResult {
        let stats = stats.snapshot();
        let snapshot = pool.snapshot();
        let error = terminal.error.as_ref().map(|err| RunError {
            kind: err.kind(),
            message: err.to_string(),
        });
        let final_note = if terminal.summary.is_empty() {
            pool.notes().last().cloned().unwrap_or_default()
        } else {
            terminal.summary.clone()
        };

        match &error {
            None => sink.emit(EventKind::TaskCompleted {
                status: terminal.status,
                total_steps: pool.step_count(),
                summary: final_note.clone(),
                stats,
            }),
            Some(err) => sink.emit(EventKind::Error {
                kind: err.kind,
                status: terminal.status,
                reason: terminal.reason,
                message: err.message.clone(),
                snapshot: Box::new(snapshot.clone()),
            }),
        }

        info!(
            task_id = %sink.task_id(),
            status = ?terminal.status,
            reason = ?terminal.reason,
            steps = pool.step_count(),
            "Task finished"
        );

        let result = RunResult {
            task_id: sink.task_id().to_string(),
            status: terminal.status,
            reason: terminal.reason,
            total_steps: pool.step_count(),
            history: pool.history().iter().map(|r| r.description.clone()).collect(),
            final_note,
            stats,
            records: pool.history().to_vec(),
            error,
            snapshot,
        };
        if let Some(artifacts) = &self.artifacts {
            if let Err(err) = artifacts.save_result(&result) {
                warn!(task_id = %result.task_id, "Failed to save result: {}", err);
            }
        }
        result
    }
}
