//! Multi-agent control loop.
//!
//! Each step runs Manager (unless skipped), Executor, the device action,
//! Reflector and optionally Notetaker, strictly in that order.

use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::perception::Frame;

use super::error::{AgentError, ErrorKind};
use super::events::StepStatus;
use super::info_pool::{ActionRecord, InfoPool, Outcome};
use super::roles::{Executor, Manager, NotePolicy, Notetaker, Reflector, ReflectorOutput};
use super::runner::{Decided, Flow, RunContext, RunOptions, Terminal};

/// Whether the Manager can be skipped this step.
///
/// Skipped right after an invalid decision, so the retry goes straight back to
/// the Executor, and while a plan exists that nobody has flagged as stale.
pub fn should_skip_manager(pool: &InfoPool) -> bool {
    if pool.last_record().is_some_and(ActionRecord::is_invalid) {
        return true;
    }
    !pool.error_flag_plan() && pool.plan().is_some()
}

pub struct MultiAgentEngine {
    manager: Manager,
    executor: Executor,
    reflector: Reflector,
    notetaker: Notetaker,
    note_policy: NotePolicy,
}

impl MultiAgentEngine {
    pub fn new(options: &RunOptions) -> Self {
        Self {
            manager: Manager::default(),
            executor: Executor::default(),
            reflector: Reflector::default().with_threshold(options.err_to_manager_threshold),
            notetaker: Notetaker::default(),
            note_policy: options.note_policy,
        }
    }

    pub(crate) async fn run(&self, ctx: &mut RunContext<'_>) -> Terminal {
        loop {
            if let Some(terminal) = ctx.check_boundary() {
                return terminal;
            }
            let step = ctx.pool.step_count() + 1;
            match self.step(ctx, step).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finish(terminal)) => return terminal,
                Err(err) => return ctx.abort(err),
            }
        }
    }

    async fn step(&self, ctx: &mut RunContext<'_>, step: u32) -> Result<Flow, AgentError> {
        ctx.step_start(step);
        let frame = ctx.step_frame(step).await?;

        if should_skip_manager(&ctx.pool) {
            debug!(task_id = %ctx.task_id, step, "Skipping manager");
        } else if let Some(flow) = self.plan(ctx, step, &frame).await? {
            return Ok(flow);
        }

        let decision = ctx.invoke(step, &self.executor, &frame).await;
        let decided = ctx.resolve_decision(step, decision, &frame)?;
        if let Some(flow) = ctx.conclude_without_device(step, &decided, &frame)? {
            return Ok(flow);
        }

        let outcome = ctx.execute(step, &decided.action, &frame).await?;
        ctx.settle().await;

        let after = ctx.capture().await?;
        ctx.pool.set_frame(after.clone());
        ctx.save_frame(step, "after", &after);

        let reflection = if outcome.success {
            self.reflect(ctx, step, &after).await?
        } else {
            self.reflector.judge(
                &ctx.pool,
                Outcome::Failure,
                outcome.message.clone(),
                "The device reported the action as failed.".to_string(),
            )
        };
        info!(task_id = %ctx.task_id, step, outcome = ?reflection.outcome, "Reflection");

        if reflection.error_flag_plan {
            ctx.pool.raise_error_flag(
                reflection
                    .error_description
                    .clone()
                    .unwrap_or_else(|| "Recent actions did not make progress.".to_string()),
            );
        }

        let take_notes = self.note_policy.allows(reflection.outcome, &decided.action);
        let (status, error) = self.record(ctx, step, decided, reflection)?;
        if take_notes {
            self.take_notes(ctx, step, &after).await?;
        }
        ctx.step_end(step, status, error);
        Ok(Flow::Continue)
    }

    /// Run the Manager. A plan of just "Finished" ends the run.
    async fn plan(
        &self,
        ctx: &mut RunContext<'_>,
        step: u32,
        frame: &Frame,
    ) -> Result<Option<Flow>, AgentError> {
        match ctx.invoke(step, &self.manager, frame).await {
            Ok(output) => {
                let finished = output.plan.is_finished();
                let summary = Some(output.completed.trim())
                    .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("none"))
                    .unwrap_or("All subgoals completed")
                    .to_string();
                ctx.pool.set_plan(output.plan, output.completed);
                ctx.pool.clear_error_flag();
                if !finished {
                    return Ok(None);
                }
                info!(task_id = %ctx.task_id, step, "Manager reports the task finished");
                let decided = ctx.resolve_decision(
                    step,
                    Ok(crate::model::Decision {
                        thinking: output.thought,
                        action: Action::Done {
                            success: true,
                            summary,
                        }
                        .to_wire()
                        .to_string(),
                        conclusion: "All subgoals completed".to_string(),
                    }),
                    frame,
                )?;
                ctx.conclude_without_device(step, &decided, frame)
            }
            Err(err) if err.kind() == ErrorKind::InvalidDecision => {
                warn!(task_id = %ctx.task_id, step, "Manager output unusable, keeping plan: {}", err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Unusable reflector output counts as a no-op.
    async fn reflect(
        &self,
        ctx: &mut RunContext<'_>,
        step: u32,
        after: &Frame,
    ) -> Result<ReflectorOutput, AgentError> {
        match ctx.invoke(step, &self.reflector, after).await {
            Ok(output) => Ok(output),
            Err(err) if err.kind() == ErrorKind::InvalidDecision => {
                warn!(task_id = %ctx.task_id, step, "Reflector output unusable: {}", err);
                Ok(self
                    .reflector
                    .judge(&ctx.pool, Outcome::NoOp, None, err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn take_notes(
        &self,
        ctx: &mut RunContext<'_>,
        step: u32,
        frame: &Frame,
    ) -> Result<(), AgentError> {
        match ctx.invoke(step, &self.notetaker, frame).await {
            Ok(output) => {
                let added = output
                    .notes
                    .into_iter()
                    .filter(|note| ctx.pool.append_note(note.clone()))
                    .count();
                debug!(task_id = %ctx.task_id, step, added, "Notes updated");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::InvalidDecision => {
                warn!(task_id = %ctx.task_id, step, "Notetaker output unusable: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Append the step's record; the caller closes the step with the
    /// returned status.
    fn record(
        &self,
        ctx: &mut RunContext<'_>,
        step: u32,
        decided: Decided,
        reflection: ReflectorOutput,
    ) -> Result<(StepStatus, Option<String>), AgentError> {
        let validity = ctx.take_validity();
        let success = reflection.outcome.is_success();
        let mut record = ActionRecord::new(step, decided.action, validity)
            .with_description(decided.conclusion)
            .with_outcome(reflection.outcome);
        if let Some(error) = &reflection.error_description {
            record = record.with_error(error.clone());
        }
        let error = record.error.clone();

        ctx.complete_step(record)?;
        ctx.update_stats(|s| {
            if success {
                s.successful_actions += 1;
            } else {
                s.failed_actions += 1;
            }
        });
        let status = if success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        Ok((status, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::info_pool::{Plan, Validity};

    #[test]
    fn test_skip_manager_heuristic() {
        let mut pool = InfoPool::new("task", 10);
        assert!(!should_skip_manager(&pool), "no plan yet");

        pool.set_plan(Plan::parse("1. open app"), "");
        assert!(should_skip_manager(&pool), "fresh plan");

        pool.raise_error_flag("stuck");
        assert!(!should_skip_manager(&pool), "stale plan");

        pool.record_action(ActionRecord::new(1, Action::invalid("bad"), Validity::Invalid))
            .unwrap();
        pool.advance_step().unwrap();
        assert!(should_skip_manager(&pool), "retry after invalid decision");
    }
}
