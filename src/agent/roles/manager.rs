//! Planning role.

use serde::{Deserialize, Serialize};

use crate::agent::info_pool::{InfoPool, Plan};
use crate::config::MANAGER_PROMPT;
use crate::model::response::{section, COMPLETED_HEADERS, PLAN_HEADERS, THOUGHT_HEADERS};
use crate::model::{ChatMessage, ResponseParseError};
use crate::perception::Frame;

use super::{render_history, render_notes, render_plan, PromptTemplate, Role, RoleKind};

/// Number of history entries the Manager sees when re-planning.
const MANAGER_HISTORY_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerOutput {
    pub thought: String,
    pub completed: String,
    pub plan: Plan,
}

#[derive(Debug, Clone)]
pub struct Manager {
    template: PromptTemplate,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(PromptTemplate::new(MANAGER_PROMPT))
    }
}

impl Manager {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }
}

impl Role for Manager {
    type Output = ManagerOutput;

    fn kind(&self) -> RoleKind {
        RoleKind::Manager
    }

    fn build_messages(&self, pool: &InfoPool, frame: &Frame) -> Vec<ChatMessage> {
        let mut body = format!("### User Instruction ###\n{}\n", pool.instruction());

        if pool.plan().is_some() {
            body.push_str(&format!(
                "\n### Current Plan ###\n{}\n\n### Completed Subgoal ###\n{}\n",
                render_plan(pool),
                if pool.completed_plan().is_empty() {
                    "None"
                } else {
                    pool.completed_plan()
                }
            ));
            body.push_str(&format!(
                "\n### Recent Actions ###\n{}\n",
                render_history(pool, MANAGER_HISTORY_LEN)
            ));
        }

        if pool.error_flag_plan() {
            body.push_str(&format!(
                "\n### Potentially Stuck! ###\nThe recent actions did not make progress. {}\nRevise the plan.\n",
                pool.error_description().unwrap_or("No error description.")
            ));
        }

        body.push_str(&format!("\n### Important Notes ###\n{}\n", render_notes(pool)));
        body.push_str("\nHere is the current screenshot:");

        vec![
            self.template.system_message(frame),
            ChatMessage::user(body).with_frame(frame),
        ]
    }

    fn parse(&self, _pool: &InfoPool, response: &str) -> Result<ManagerOutput, ResponseParseError> {
        if response.trim().is_empty() {
            return Err(ResponseParseError::Empty);
        }
        let plan = section(response, PLAN_HEADERS)
            .map(|text| Plan::parse(&text))
            .filter(|plan| !plan.is_empty())
            .ok_or(ResponseParseError::NoStructuredBlock("plan"))?;

        Ok(ManagerOutput {
            thought: section(response, THOUGHT_HEADERS).unwrap_or_default(),
            completed: section(response, COMPLETED_HEADERS).unwrap_or_default(),
            plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frame;

    #[test]
    fn test_parse_plan() {
        let pool = InfoPool::new("turn on wifi", 10);
        let output = Manager::default()
            .parse(
                &pool,
                "### Thought ###\nNeed settings.\n\n### Completed Subgoal ###\nNone\n\n### Plan ###\n1. Open Settings\n2. Tap Wi-Fi\n",
            )
            .unwrap();
        assert_eq!(output.thought, "Need settings.");
        assert_eq!(output.plan.steps, vec!["Open Settings", "Tap Wi-Fi"]);
    }

    #[test]
    fn test_parse_without_plan_fails() {
        let pool = InfoPool::new("task", 10);
        assert_eq!(
            Manager::default().parse(&pool, "I think we should open settings."),
            Err(ResponseParseError::NoStructuredBlock("plan"))
        );
    }

    #[test]
    fn test_messages_mention_error_when_flagged() {
        let mut pool = InfoPool::new("send a message", 10);
        pool.set_plan(Plan::parse("1. open messages"), "");
        pool.raise_error_flag("tapped the wrong icon");

        let messages = Manager::default().build_messages(&pool, &frame());
        assert_eq!(messages.len(), 2);
        let user = messages[1].text();
        assert!(user.contains("send a message"));
        assert!(user.contains("Potentially Stuck"));
        assert!(user.contains("tapped the wrong icon"));
        assert_eq!(messages[1].image_count(), 1);
    }
}
