//! Note-taking role and the policy deciding when it runs.

use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::agent::info_pool::{InfoPool, Outcome};
use crate::config::NOTETAKER_PROMPT;
use crate::model::response::{section, NOTES_HEADERS};
use crate::model::{ChatMessage, ResponseParseError};
use crate::perception::Frame;

use super::{render_history, render_notes, render_plan, PromptTemplate, Role, RoleKind};

/// When the Notetaker is invoked after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotePolicy {
    Never,
    #[default]
    OnSuccess,
    OnSuccessOrNoOp,
    EveryStep,
}

impl NotePolicy {
    /// Terminal and invalid actions never produce notes.
    pub fn allows(&self, outcome: Outcome, action: &Action) -> bool {
        if !action.needs_device() {
            return false;
        }
        match self {
            Self::Never => false,
            Self::OnSuccess => outcome == Outcome::Success,
            Self::OnSuccessOrNoOp => matches!(outcome, Outcome::Success | Outcome::NoOp),
            Self::EveryStep => true,
        }
    }
}

impl std::str::FromStr for NotePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "never" => Ok(Self::Never),
            "on_success" => Ok(Self::OnSuccess),
            "on_success_or_no_op" | "on_success_or_noop" => Ok(Self::OnSuccessOrNoOp),
            "every_step" => Ok(Self::EveryStep),
            other => Err(format!("unknown note policy `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotetakerOutput {
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Notetaker {
    template: PromptTemplate,
}

impl Default for Notetaker {
    fn default() -> Self {
        Self::new(PromptTemplate::new(NOTETAKER_PROMPT))
    }
}

impl Notetaker {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }
}

impl Role for Notetaker {
    type Output = NotetakerOutput;

    fn kind(&self) -> RoleKind {
        RoleKind::Notetaker
    }

    fn build_messages(&self, pool: &InfoPool, frame: &Frame) -> Vec<ChatMessage> {
        let body = format!(
            "### User Instruction ###\n{}\n\n### Overall Plan ###\n{}\n\n### Latest Action ###\n{}\n\n### Existing Important Notes ###\n{}\n\nHere is the current screenshot:",
            pool.instruction(),
            render_plan(pool),
            render_history(pool, 1),
            render_notes(pool),
        );
        vec![
            self.template.system_message(frame),
            ChatMessage::user(body).with_frame(frame),
        ]
    }

    fn parse(&self, _pool: &InfoPool, response: &str) -> Result<NotetakerOutput, ResponseParseError> {
        if response.trim().is_empty() {
            return Err(ResponseParseError::Empty);
        }
        let body =
            section(response, NOTES_HEADERS).ok_or(ResponseParseError::NoStructuredBlock("notes"))?;
        let notes = body
            .lines()
            .map(|line| line.trim().trim_start_matches(|c| matches!(c, '-' | '*' | '•')).trim())
            .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("none"))
            .map(str::to_string)
            .collect();
        Ok(NotetakerOutput { notes })
    }
}
