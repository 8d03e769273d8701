//! Reflection role: judges the last action from before/after screenshots.

use serde::{Deserialize, Serialize};

use crate::agent::info_pool::{InfoPool, Outcome};
use crate::config::REFLECTOR_PROMPT;
use crate::model::response::{section, ERROR_DESCRIPTION_HEADERS, OUTCOME_HEADERS, THOUGHT_HEADERS};
use crate::model::{ChatMessage, ResponseParseError};
use crate::perception::Frame;

use super::{render_plan, PromptTemplate, Role, RoleKind};

/// Consecutive failed outcomes before the plan is flagged for the Manager.
pub const DEFAULT_ERR_TO_MANAGER_THRESHOLD: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectorOutput {
    pub outcome: Outcome,
    pub error_flag_plan: bool,
    pub error_description: Option<String>,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct Reflector {
    template: PromptTemplate,
    err_to_manager_threshold: usize,
}

impl Default for Reflector {
    fn default() -> Self {
        Self::new(PromptTemplate::new(REFLECTOR_PROMPT))
    }
}

impl Reflector {
    pub fn new(template: PromptTemplate) -> Self {
        Self {
            template,
            err_to_manager_threshold: DEFAULT_ERR_TO_MANAGER_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.err_to_manager_threshold = threshold.max(1);
        self
    }

    /// Build the output for an outcome, deciding whether the plan is stale.
    ///
    /// The flag is raised when this outcome and the previous `threshold - 1`
    /// recorded steps all failed.
    pub fn judge(
        &self,
        pool: &InfoPool,
        outcome: Outcome,
        error_description: Option<String>,
        rationale: String,
    ) -> ReflectorOutput {
        let error_flag_plan = !outcome.is_success()
            && pool.recent_failures(self.err_to_manager_threshold.saturating_sub(1));
        ReflectorOutput {
            outcome,
            error_flag_plan,
            error_description,
            rationale,
        }
    }
}

fn outcome_from_letter(text: &str) -> Option<Outcome> {
    let first = text
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_alphabetic())
        .chars()
        .next()?;
    match first.to_ascii_uppercase() {
        'A' => Some(Outcome::Success),
        'B' => Some(Outcome::Failure),
        'C' => Some(Outcome::NoOp),
        _ => None,
    }
}

impl Role for Reflector {
    type Output = ReflectorOutput;

    fn kind(&self) -> RoleKind {
        RoleKind::Reflector
    }

    fn build_messages(&self, pool: &InfoPool, frame: &Frame) -> Vec<ChatMessage> {
        let action = pool
            .last_action()
            .map(|a| a.describe())
            .unwrap_or_else(|| "Unknown".to_string());
        let expectation = if pool.last_conclusion().is_empty() {
            "Not stated."
        } else {
            pool.last_conclusion()
        };
        let body = format!(
            "### User Instruction ###\n{}\n\n### Overall Plan ###\n{}\n\n### Latest Action ###\nAction: {}\nExpectation: {}\n",
            pool.instruction(),
            render_plan(pool),
            action,
            expectation,
        );

        let mut user = ChatMessage::user(body);
        if let Some(before) = pool.previous_frame() {
            user = user.with_labelled_frame("Screenshot before the action:", before);
        }
        user = user.with_labelled_frame("Screenshot after the action:", frame);

        vec![self.template.system_message(frame), user]
    }

    fn parse(&self, pool: &InfoPool, response: &str) -> Result<ReflectorOutput, ResponseParseError> {
        if response.trim().is_empty() {
            return Err(ResponseParseError::Empty);
        }
        let outcome = section(response, OUTCOME_HEADERS)
            .and_then(|text| outcome_from_letter(&text))
            .ok_or(ResponseParseError::NoStructuredBlock("outcome"))?;

        let error_description = section(response, ERROR_DESCRIPTION_HEADERS)
            .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("none"));
        let rationale = section(response, THOUGHT_HEADERS).unwrap_or_default();

        Ok(self.judge(pool, outcome, error_description, rationale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::agent::info_pool::{ActionRecord, Validity};
    use crate::testing::frame;

    #[test]
    fn test_parse_outcome_letters() {
        let pool = InfoPool::new("task", 5);
        let reflector = Reflector::default();

        let out = reflector
            .parse(&pool, "### Outcome ###\nA\n\n### Error Description ###\nNone")
            .unwrap();
        assert_eq!(out.outcome, Outcome::Success);
        assert!(out.error_description.is_none());
        assert!(!out.error_flag_plan);

        let out = reflector
            .parse(&pool, "### Outcome ###\nC: nothing changed\n### Error Description ###\nThe tap missed.")
            .unwrap();
        assert_eq!(out.outcome, Outcome::NoOp);
        assert_eq!(out.error_description.as_deref(), Some("The tap missed."));

        assert_eq!(
            reflector.parse(&pool, "looks fine"),
            Err(ResponseParseError::NoStructuredBlock("outcome"))
        );
    }

    #[test]
    fn test_flag_raised_after_consecutive_failures() {
        let reflector = Reflector::default();
        let mut pool = InfoPool::new("task", 5);

        // First failure alone does not reach the threshold of 2.
        let first = reflector.judge(&pool, Outcome::Failure, None, String::new());
        assert!(!first.error_flag_plan);

        pool.record_action(
            ActionRecord::new(1, Action::Click { x: 0, y: 0 }, Validity::Valid)
                .with_outcome(Outcome::Success),
        )
        .unwrap();
        pool.advance_step().unwrap();
        let after_success = reflector.judge(&pool, Outcome::Failure, None, String::new());
        assert!(!after_success.error_flag_plan);

        pool.record_action(
            ActionRecord::new(2, Action::Click { x: 0, y: 0 }, Validity::Valid)
                .with_outcome(Outcome::NoOp),
        )
        .unwrap();
        pool.advance_step().unwrap();
        assert!(reflector
            .judge(&pool, Outcome::Failure, None, String::new())
            .error_flag_plan);
        assert!(!reflector
            .judge(&pool, Outcome::Success, None, String::new())
            .error_flag_plan);
    }

    #[test]
    fn test_messages_carry_both_frames() {
        let mut pool = InfoPool::new("task", 5);
        pool.set_frame(frame());
        pool.set_frame(frame());
        pool.set_decision(Action::Click { x: 3, y: 4 }, "", "Open settings");

        let messages = Reflector::default().build_messages(&pool, &frame());
        assert_eq!(messages[1].image_count(), 2);
        let text = messages[1].text();
        assert!(text.contains("Click at (3, 4)"));
        assert!(text.contains("Open settings"));
    }
}
