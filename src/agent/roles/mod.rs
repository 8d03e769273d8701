//! The four cooperating role agents.
//!
//! A role is a pure pair of functions: build the chat messages for a call from
//! the [`InfoPool`] and the current frame, and parse the model's reply into a
//! typed output. All state lives in the pool, so roles hold only their prompt
//! template and policy knobs.

mod executor;
mod manager;
mod notetaker;
mod reflector;

pub use executor::{Executor, EXECUTOR_HISTORY_LEN};
pub use manager::{Manager, ManagerOutput};
pub use notetaker::{NotePolicy, Notetaker, NotetakerOutput};
pub use reflector::{Reflector, ReflectorOutput, DEFAULT_ERR_TO_MANAGER_THRESHOLD};

use serde::{Deserialize, Serialize};

use crate::config::with_context_header;
use crate::model::{ChatMessage, ResponseParseError};
use crate::perception::Frame;

use super::info_pool::InfoPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Manager,
    Executor,
    Reflector,
    Notetaker,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Executor => "executor",
            Self::Reflector => "reflector",
            Self::Notetaker => "notetaker",
        }
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System prompt of a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    system: String,
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    /// System message for a screenshot of the given size.
    pub fn system_message(&self, frame: &Frame) -> ChatMessage {
        ChatMessage::system(with_context_header(&self.system, frame.width, frame.height))
    }
}

pub trait Role {
    type Output;

    fn kind(&self) -> RoleKind;

    fn build_messages(&self, pool: &InfoPool, frame: &Frame) -> Vec<ChatMessage>;

    fn parse(&self, pool: &InfoPool, response: &str) -> Result<Self::Output, ResponseParseError>;
}

/// Shared prompt fragments.
pub(crate) fn render_history(pool: &InfoPool, n: usize) -> String {
    let recent = pool.recent(n);
    if recent.is_empty() {
        return "No actions yet.".to_string();
    }
    recent
        .iter()
        .map(|record| {
            let outcome = match (record.is_invalid(), record.outcome) {
                (true, _) => "invalid".to_string(),
                (false, Some(outcome)) => format!("{:?}", outcome).to_lowercase(),
                (false, None) => "pending".to_string(),
            };
            match &record.error {
                Some(error) => format!(
                    "Step {}: {} | {} | {}",
                    record.step, record.description, outcome, error
                ),
                None => format!("Step {}: {} | {}", record.step, record.description, outcome),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn render_notes(pool: &InfoPool) -> String {
    if pool.notes().is_empty() {
        "None".to_string()
    } else {
        pool.notes()
            .iter()
            .map(|note| format!("- {}", note))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn render_plan(pool: &InfoPool) -> String {
    pool.plan()
        .filter(|plan| !plan.is_empty())
        .map(|plan| plan.render())
        .unwrap_or_else(|| "No plan yet.".to_string())
}
