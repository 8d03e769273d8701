//! Run-scoped state shared by the agent roles.
//!
//! One [`InfoPool`] exists per task run. It is owned by the control loop and
//! mutated only between model and device calls, so it needs no locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::Action;
use crate::perception::Frame;

/// Information pool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfoPoolError {
    #[error("Step budget of {max_steps} exhausted")]
    StepBudgetExceeded { max_steps: u32 },
    #[error("Action record for step {got} out of order, expected step {expected}")]
    OutOfOrder { expected: u32, got: u32 },
}

/// Reflector judgment of an executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    NoOp,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Whether the decision behind a record was usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Valid,
    Invalid,
    /// Valid decision reached after one or more invalid attempts.
    Retried,
}

/// One completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub step: u32,
    pub action: Action,
    pub description: String,
    pub validity: Validity,
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(step: u32, action: Action, validity: Validity) -> Self {
        Self {
            step,
            description: action.describe(),
            action,
            validity,
            outcome: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        if !description.trim().is_empty() {
            self.description = description;
        }
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_invalid(&self) -> bool {
        self.validity == Validity::Invalid
    }

    /// Failure and no-op both count against the current plan.
    pub fn counts_as_failure(&self) -> bool {
        self.is_invalid() || matches!(self.outcome, Some(Outcome::Failure | Outcome::NoOp))
    }
}

/// Ordered subgoals produced by the Manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
}

impl Plan {
    /// Parse a numbered or bulleted list; unnumbered text becomes one step per line.
    pub fn parse(text: &str) -> Self {
        let steps = text
            .lines()
            .map(|line| {
                let line = line.trim();
                let without_number = line
                    .split_once(|c: char| c == '.' || c == ')' || c == '、')
                    .filter(|(prefix, _)| {
                        !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit())
                    })
                    .map(|(_, rest)| rest)
                    .unwrap_or(line);
                without_number
                    .trim_start_matches(|c| matches!(c, '-' | '*' | '•'))
                    .trim()
                    .to_string()
            })
            .filter(|line| !line.is_empty())
            .collect();
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// A plan reading just "Finished" means the Manager considers the task done.
    pub fn is_finished(&self) -> bool {
        match self.steps.as_slice() {
            [only] => {
                let only = only.trim_end_matches('.').trim().to_lowercase();
                only == "finished" || only == "已完成"
            }
            _ => false,
        }
    }

    /// Numbered rendering for prompts.
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Serializable view of the pool without images, for logs and error reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub instruction: String,
    pub plan: Option<Plan>,
    pub completed_plan: String,
    pub step_count: u32,
    pub max_steps: u32,
    pub error_flag_plan: bool,
    pub error_description: Option<String>,
    pub notes: Vec<String>,
    pub action_history: Vec<ActionRecord>,
}

/// Mutable state of one task run.
#[derive(Debug, Clone)]
pub struct InfoPool {
    instruction: String,
    max_steps: u32,
    step_count: u32,
    plan: Option<Plan>,
    completed_plan: String,
    action_history: Vec<ActionRecord>,
    error_flag_plan: bool,
    error_description: Option<String>,
    notes: Vec<String>,
    last_frame: Option<Frame>,
    previous_frame: Option<Frame>,
    last_action: Option<Action>,
    last_thinking: String,
    last_conclusion: String,
}

impl InfoPool {
    pub fn new(instruction: impl Into<String>, max_steps: u32) -> Self {
        Self {
            instruction: instruction.into(),
            max_steps,
            step_count: 0,
            plan: None,
            completed_plan: String::new(),
            action_history: Vec::new(),
            error_flag_plan: false,
            error_description: None,
            notes: Vec::new(),
            last_frame: None,
            previous_frame: None,
            last_action: None,
            last_thinking: String::new(),
            last_conclusion: String::new(),
        }
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn is_budget_exhausted(&self) -> bool {
        self.step_count >= self.max_steps
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn completed_plan(&self) -> &str {
        &self.completed_plan
    }

    pub fn history(&self) -> &[ActionRecord] {
        &self.action_history
    }

    pub fn last_record(&self) -> Option<&ActionRecord> {
        self.action_history.last()
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> &[ActionRecord] {
        let start = self.action_history.len().saturating_sub(n);
        &self.action_history[start..]
    }

    /// True when the last `n` records all count as failures. Vacuously true for `n == 0`.
    pub fn recent_failures(&self, n: usize) -> bool {
        self.action_history.len() >= n && self.recent(n).iter().all(ActionRecord::counts_as_failure)
    }

    pub fn error_flag_plan(&self) -> bool {
        self.error_flag_plan
    }

    pub fn error_description(&self) -> Option<&str> {
        self.error_description.as_deref()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    pub fn previous_frame(&self) -> Option<&Frame> {
        self.previous_frame.as_ref()
    }

    /// The action decided in the current step, before it is recorded.
    pub fn last_action(&self) -> Option<&Action> {
        self.last_action.as_ref()
    }

    pub fn last_thinking(&self) -> &str {
        &self.last_thinking
    }

    pub fn last_conclusion(&self) -> &str {
        &self.last_conclusion
    }

    /// Append the record of the step about to complete.
    pub fn record_action(&mut self, record: ActionRecord) -> Result<(), InfoPoolError> {
        let expected = self.step_count + 1;
        if record.step != expected || self.action_history.len() != self.step_count as usize {
            return Err(InfoPoolError::OutOfOrder {
                expected,
                got: record.step,
            });
        }
        self.action_history.push(record);
        Ok(())
    }

    /// Mark the current step complete.
    pub fn advance_step(&mut self) -> Result<u32, InfoPoolError> {
        if self.step_count >= self.max_steps {
            return Err(InfoPoolError::StepBudgetExceeded {
                max_steps: self.max_steps,
            });
        }
        self.step_count += 1;
        Ok(self.step_count)
    }

    pub fn set_plan(&mut self, plan: Plan, completed: impl Into<String>) {
        self.plan = Some(plan);
        self.completed_plan = completed.into();
    }

    pub fn clear_plan(&mut self) {
        self.plan = None;
    }

    pub fn clear_error_flag(&mut self) {
        self.error_flag_plan = false;
        self.error_description = None;
    }

    pub fn raise_error_flag(&mut self, description: impl Into<String>) {
        self.error_flag_plan = true;
        self.error_description = Some(description.into());
    }

    /// Append a note unless an identical one exists. Returns whether it was added.
    pub fn append_note(&mut self, note: impl Into<String>) -> bool {
        let note = note.into();
        let note = note.trim();
        if note.is_empty() || self.notes.iter().any(|n| n == note) {
            return false;
        }
        self.notes.push(note.to_string());
        true
    }

    /// Replace the current screenshot, keeping the previous one for diffing.
    pub fn set_frame(&mut self, frame: Frame) {
        self.previous_frame = self.last_frame.replace(frame);
    }

    pub fn set_decision(
        &mut self,
        action: Action,
        thinking: impl Into<String>,
        conclusion: impl Into<String>,
    ) {
        self.last_action = Some(action);
        self.last_thinking = thinking.into();
        self.last_conclusion = conclusion.into();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            instruction: self.instruction.clone(),
            plan: self.plan.clone(),
            completed_plan: self.completed_plan.clone(),
            step_count: self.step_count,
            max_steps: self.max_steps,
            error_flag_plan: self.error_flag_plan,
            error_description: self.error_description.clone(),
            notes: self.notes.clone(),
            action_history: self.action_history.clone(),
        }
    }
}
