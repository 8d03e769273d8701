//! Single-agent engine: one prompt per step, no planning or reflection.
//!
//! The conversation is kept across steps so the model sees its own previous
//! turns, but only the newest user message keeps its screenshot.

use tracing::debug;

use crate::config::{ACTION_SPACE, SINGLE_AGENT_PROMPT};
use crate::model::{parse_decision, ChatMessage};
use crate::perception::Frame;

use super::error::AgentError;
use super::events::StepStatus;
use super::info_pool::{ActionRecord, Outcome};
use super::roles::{render_history, PromptTemplate};
use super::runner::{Flow, RunContext, Terminal};

/// Number of past exchanges kept in the conversation.
const CONTEXT_EXCHANGES: usize = 5;

pub struct SingleAgentEngine {
    template: PromptTemplate,
    context_exchanges: usize,
}

impl Default for SingleAgentEngine {
    fn default() -> Self {
        Self {
            template: PromptTemplate::new(format!("{}\n\n{}", SINGLE_AGENT_PROMPT, ACTION_SPACE)),
            context_exchanges: CONTEXT_EXCHANGES,
        }
    }
}

impl SingleAgentEngine {
    pub(crate) async fn run(&self, ctx: &mut RunContext<'_>) -> Terminal {
        let mut context = Vec::new();
        loop {
            if let Some(terminal) = ctx.check_boundary() {
                return terminal;
            }
            let step = ctx.pool.step_count() + 1;
            match self.step(ctx, step, &mut context).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finish(terminal)) => return terminal,
                Err(err) => return ctx.abort(err),
            }
        }
    }

    fn build_messages(
        &self,
        ctx: &RunContext<'_>,
        context: &[ChatMessage],
        frame: &Frame,
    ) -> (ChatMessage, Vec<ChatMessage>) {
        let user = ChatMessage::user(format!(
            "Task: {}\n\nRecent actions:\n{}\n\nCurrent screenshot:",
            ctx.pool.instruction(),
            render_history(&ctx.pool, self.context_exchanges),
        ))
        .with_frame(frame);

        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(self.template.system_message(frame));
        messages.extend_from_slice(context);
        messages.push(user.clone());
        (user, messages)
    }

    fn remember(&self, context: &mut Vec<ChatMessage>, mut user: ChatMessage, reply: String) {
        user.strip_images();
        context.push(user);
        context.push(ChatMessage::assistant(reply));
        let keep = self.context_exchanges * 2;
        if context.len() > keep {
            context.drain(..context.len() - keep);
        }
    }

    async fn step(
        &self,
        ctx: &mut RunContext<'_>,
        step: u32,
        context: &mut Vec<ChatMessage>,
    ) -> Result<Flow, AgentError> {
        ctx.step_start(step);
        let frame = ctx.step_frame(step).await?;

        let (user, messages) = self.build_messages(ctx, context, &frame);
        let text = ctx.call_model(step, None, &messages).await?;
        let decision = parse_decision(&text).map_err(AgentError::from);
        self.remember(context, user, text);

        let decided = ctx.resolve_decision(step, decision, &frame)?;
        if let Some(flow) = ctx.conclude_without_device(step, &decided, &frame)? {
            return Ok(flow);
        }

        let outcome = ctx.execute(step, &decided.action, &frame).await?;
        debug!(task_id = %ctx.task_id, step, success = outcome.success, "Action executed");

        let validity = ctx.take_validity();
        let mut record = ActionRecord::new(step, decided.action, validity)
            .with_description(decided.conclusion)
            .with_outcome(if outcome.success {
                Outcome::Success
            } else {
                Outcome::Failure
            });
        if let Some(message) = outcome.message.clone().filter(|_| !outcome.success) {
            record = record.with_error(message);
        }
        ctx.complete_step(record)?;
        ctx.update_stats(|s| {
            if outcome.success {
                s.successful_actions += 1;
            } else {
                s.failed_actions += 1;
            }
        });

        ctx.settle().await;
        ctx.step_end(
            step,
            if outcome.success {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            outcome.message.filter(|_| !outcome.success),
        );
        Ok(Flow::Continue)
    }
}
