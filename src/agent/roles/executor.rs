//! Acting role: picks the next concrete action.

use crate::agent::info_pool::InfoPool;
use crate::config::{ACTION_SPACE, EXECUTOR_PROMPT};
use crate::model::{parse_decision, ChatMessage, Decision, ResponseParseError};
use crate::perception::Frame;

use super::{render_history, render_notes, render_plan, PromptTemplate, Role, RoleKind};

/// Number of history entries shown to the Executor.
pub const EXECUTOR_HISTORY_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct Executor {
    template: PromptTemplate,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(PromptTemplate::new(format!(
            "{}\n\n{}",
            EXECUTOR_PROMPT, ACTION_SPACE
        )))
    }
}

impl Executor {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }
}

impl Role for Executor {
    type Output = Decision;

    fn kind(&self) -> RoleKind {
        RoleKind::Executor
    }

    fn build_messages(&self, pool: &InfoPool, frame: &Frame) -> Vec<ChatMessage> {
        let mut body = format!(
            "### User Instruction ###\n{}\n\n### Overall Plan ###\n{}\n\n### Progress Status ###\n{}\n\n### Important Notes ###\n{}\n\n### Latest Action History ###\n{}\n",
            pool.instruction(),
            render_plan(pool),
            if pool.completed_plan().is_empty() {
                "No progress yet."
            } else {
                pool.completed_plan()
            },
            render_notes(pool),
            render_history(pool, EXECUTOR_HISTORY_LEN),
        );

        if let Some(last) = pool.last_record().filter(|r| r.is_invalid()) {
            body.push_str(&format!(
                "\nYour previous output could not be used ({}). Reply again in the required format.\n",
                last.error.as_deref().unwrap_or(&last.description)
            ));
        }

        body.push_str("\nHere is the current screenshot:");

        vec![
            self.template.system_message(frame),
            ChatMessage::user(body).with_frame(frame),
        ]
    }

    fn parse(&self, _pool: &InfoPool, response: &str) -> Result<Decision, ResponseParseError> {
        parse_decision(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::agent::info_pool::{ActionRecord, Outcome, Validity};
    use crate::testing::frame;

    #[test]
    fn test_history_window_and_retry_hint() {
        let mut pool = InfoPool::new("task", 20);
        for step in 1..=6 {
            pool.record_action(
                ActionRecord::new(step, Action::Click { x: step as i32, y: 0 }, Validity::Valid)
                    .with_outcome(Outcome::Success),
            )
            .unwrap();
            pool.advance_step().unwrap();
        }
        pool.record_action(
            ActionRecord::new(7, Action::invalid("no block"), Validity::Invalid)
                .with_error("No structured action block found in model response"),
        )
        .unwrap();
        pool.advance_step().unwrap();

        let messages = Executor::default().build_messages(&pool, &frame());
        let user = messages[1].text();
        assert!(!user.contains("Step 2:"));
        assert!(user.contains("Step 3:"));
        assert!(user.contains("Step 7:"));
        assert!(user.contains("could not be used"));
    }

    #[test]
    fn test_parse_decision() {
        let pool = InfoPool::new("task", 5);
        let decision = Executor::default()
            .parse(
                &pool,
                "<thinking>tap it</thinking><tool_call>{\"action\":\"click\",\"coordinate\":[1,2]}</tool_call><conclusion>Tap</conclusion>",
            )
            .unwrap();
        assert_eq!(decision.thinking, "tap it");
        assert_eq!(decision.conclusion, "Tap");
    }
}
