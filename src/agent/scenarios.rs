//! End-to-end runs against the scripted model and the fake device.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::actions::Action;
use crate::device::DeviceError;
use crate::model::ModelError;
use crate::testing::{executor_reply, fast_options, plan_reply, reflection_reply, FakeDevice, ScriptedModel};

use super::*;

const EXECUTOR: Option<RoleKind> = Some(RoleKind::Executor);
const MANAGER: Option<RoleKind> = Some(RoleKind::Manager);
const REFLECTOR: Option<RoleKind> = Some(RoleKind::Reflector);
const NOTETAKER: Option<RoleKind> = Some(RoleKind::Notetaker);

const CLICK: &str = r#"{"action":"click","coordinate":[100,200]}"#;
const DONE: &str = r#"{"action":"done","status":"success","summary":"Settings opened"}"#;

fn runner(model: &Arc<ScriptedModel>, device: &Arc<FakeDevice>, options: RunOptions) -> TaskRunner {
    TaskRunner::new(model.clone(), device.clone(), options)
}

fn assert_history_matches_steps(result: &RunResult) {
    assert_eq!(result.records.len(), result.total_steps as usize);
    assert_eq!(result.history.len(), result.total_steps as usize);
    assert_eq!(result.snapshot.action_history.len(), result.snapshot.step_count as usize);
}

#[tokio::test]
async fn test_click_then_done_succeeds() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("tap the settings icon", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.reason, TerminalReason::Completed);
    assert_eq!(result.final_note, "Settings opened");
    assert_eq!(result.records[0].action, Action::Click { x: 100, y: 200 });
    assert_eq!(result.records[0].outcome, Some(Outcome::Success));
    assert!(result.records[1].action.is_done());
    assert_eq!(device.dispatch_count(), 1);
    assert_eq!(device.disconnect_count(), 1);
    assert_eq!(result.stats.successful_actions, 1);
    assert_eq!(result.stats.total_steps, 2);
    assert!(result.error.is_none());
    assert_history_matches_steps(&result);

    // Plan from step 1 is reused in step 2.
    assert_eq!(model.call_count(MANAGER), 1);
}

#[tokio::test]
async fn test_dispatch_scales_to_device_pixels() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());
    runner(&model, &device, fast_options())
        .run("tap", CancellationToken::new())
        .await;

    let Action::Click { x, y } = device.dispatched()[0].clone() else {
        panic!("expected a click");
    };
    assert!(x > 100 && y > 200, "scaled to ({}, {})", x, y);
}

#[tokio::test]
async fn test_malformed_decisions_exhaust_retry_budget() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, "{not json")
            .on(EXECUTOR, "I am not sure")
            .on(EXECUTOR, executor_reply(r#"{"action":"click"}"#))
            .on(EXECUTOR, executor_reply(CLICK)),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options().with_max_retry_attempts(3))
        .run("tap the settings icon", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.reason, TerminalReason::RetryBudgetExhausted);
    assert_eq!(result.records.len(), 3);
    assert!(result.records.iter().all(|r| r.validity == Validity::Invalid));
    assert_eq!(device.dispatch_count(), 0);
    // Smart retry reuses the first screenshot.
    assert_eq!(device.capture_count(), 1);
    assert_eq!(model.call_count(MANAGER), 1);
    assert_eq!(result.stats.invalid_actions, 3);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Fatal)
    );
    assert_history_matches_steps(&result);
}

#[tokio::test]
async fn test_invalid_decisions_recapture_without_smart_retry() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, "{not json")
            .on(EXECUTOR, "I am not sure")
            .on(EXECUTOR, executor_reply(r#"{"action":"click"}"#)),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(
        &model,
        &device,
        fast_options().with_max_retry_attempts(3).with_smart_retry(false),
    )
    .run("tap the settings icon", CancellationToken::new())
    .await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.reason, TerminalReason::RetryBudgetExhausted);
    assert_eq!(result.records.len(), 3);
    assert!(result.records.iter().all(|r| r.validity == Validity::Invalid));
    assert_eq!(device.capture_count(), 3);
    assert_eq!(device.dispatch_count(), 0);
    assert_eq!(result.stats.invalid_actions, 3);
    assert_eq!(result.stats.retries_used, 0);
    assert_history_matches_steps(&result);
}

#[tokio::test]
async fn test_valid_decision_after_invalid_is_marked_retried() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, "garbage")
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.records[0].validity, Validity::Invalid);
    assert_eq!(result.records[1].validity, Validity::Retried);
    assert_eq!(result.records[2].validity, Validity::Valid);
    assert_eq!(device.dispatch_count(), 1);
    assert_eq!(result.stats.retries_used, 1);
}

#[tokio::test]
async fn test_step_budget_boundary_fails_after_last_action() {
    let model = Arc::new(ScriptedModel::new().on(EXECUTOR, executor_reply(CLICK)));
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options().with_max_steps(1))
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.reason, TerminalReason::BudgetExhausted);
    assert_eq!(result.total_steps, 1);
    assert_eq!(device.dispatch_count(), 1);
    assert_history_matches_steps(&result);
}

#[tokio::test]
async fn test_cancel_before_second_step() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(CLICK)),
    );
    let device = Arc::new(FakeDevice::new());
    let cancel = CancellationToken::new();
    device.cancel_on_dispatch(cancel.clone());

    let events: Vec<Event> = runner(&model, &device, fast_options())
        .run_stream("tap", cancel)
        .collect()
        .await;

    assert!(!events.iter().any(|e| e.step() == Some(2)));
    let last = events.last().unwrap();
    match &last.kind {
        EventKind::Error { reason, status, .. } => {
            assert_eq!(*reason, TerminalReason::Cancelled);
            assert_eq!(*status, RunStatus::Aborted);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(model.call_count(EXECUTOR), 1);
}

#[tokio::test]
async fn test_event_order_within_step() {
    let model = Arc::new(
        ScriptedModel::new()
            .chunked(7)
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());

    let events: Vec<Event> = runner(&model, &device, fast_options().with_streaming(true))
        .run_stream("tap", CancellationToken::new())
        .collect()
        .await;

    assert_eq!(events[0].name(), "task_init");
    assert_eq!(events[1].name(), "device_connected");
    assert_eq!(events.last().map(Event::name), Some("task_completed"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.iter().any(|e| e.name() == "model_chunk"));

    let step1: Vec<&str> = events
        .iter()
        .filter(|e| e.step() == Some(1))
        .map(Event::name)
        .filter(|name| *name != "model_chunk")
        .collect();
    let pos = |name: &str| step1.iter().position(|n| *n == name).unwrap();
    assert_eq!(step1.first(), Some(&"step_start"));
    assert_eq!(step1.last(), Some(&"step_end"));
    assert!(pos("screenshot") < pos("model_call_start"));
    assert!(pos("model_call_start") < pos("model_complete"));
    assert!(pos("model_complete") < pos("action_parsed"));
    assert!(pos("action_parsed") < pos("action_executing"));
    assert!(pos("action_executing") < pos("action_completed"));

    // Every chunk belongs to a call that started and completes after it.
    let first_chunk = events.iter().position(|e| e.name() == "model_chunk").unwrap();
    let first_start = events.iter().position(|e| e.name() == "model_call_start").unwrap();
    assert!(first_start < first_chunk);
}

#[tokio::test]
async fn test_repeated_failures_flag_plan_and_replan() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE))
            .on(REFLECTOR, reflection_reply('B'))
            .on(REFLECTOR, reflection_reply('C'))
            .on(MANAGER, plan_reply("1. Open settings"))
            .on(MANAGER, plan_reply("1. Go home\n2. Open settings")),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("open settings", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(model.call_count(MANAGER), 2);
    assert!(!result.snapshot.error_flag_plan);
    assert_eq!(result.snapshot.plan.as_ref().map(|p| p.steps.len()), Some(2));
    assert_eq!(result.stats.failed_actions, 2);
    assert_eq!(model.call_count(NOTETAKER), 0);
}

#[tokio::test]
async fn test_manager_finished_plan_ends_run() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(REFLECTOR, reflection_reply('B'))
            .on(REFLECTOR, reflection_reply('B'))
            .on(EXECUTOR, executor_reply(CLICK))
            .on(MANAGER, plan_reply("1. Open settings"))
            .on(MANAGER, plan_reply("Finished")),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("open settings", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.final_note, "All subgoals completed");
    assert!(result.records[2].action.is_done());
    assert_eq!(model.call_count(EXECUTOR), 2);
}

#[tokio::test]
async fn test_notes_collected_on_success() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE))
            .on(NOTETAKER, "### Important Notes ###\n- Battery is at 80%"),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("check the battery", CancellationToken::new())
        .await;

    assert_eq!(result.snapshot.notes, vec!["Battery is at 80%"]);
    assert_eq!(model.call_count(NOTETAKER), 1);

    // The step is recorded before the notes are taken.
    let prompt = &model.prompts(NOTETAKER)[0];
    assert!(
        prompt.contains("### Latest Action ###\nStep 1: Next action. | success"),
        "{}",
        prompt
    );
}

#[tokio::test]
async fn test_transient_model_error_is_retried() {
    let model = Arc::new(
        ScriptedModel::new()
            .on_error(
                EXECUTOR,
                ModelError::ApiError {
                    status: 503,
                    message: "overloaded".to_string(),
                },
            )
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stats.retries_used, 1);
    assert_eq!(model.call_count(EXECUTOR), 2);
}

#[tokio::test]
async fn test_transient_errors_exhaust_retries() {
    let overloaded = || ModelError::ApiError {
        status: 500,
        message: "down".to_string(),
    };
    let model = Arc::new(
        ScriptedModel::new()
            .on_error(MANAGER, overloaded())
            .on_error(MANAGER, overloaded()),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options().with_max_retry_attempts(2))
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.reason, TerminalReason::RetryBudgetExhausted);
    assert_eq!(result.total_steps, 0);
    assert_eq!(model.call_count(EXECUTOR), 0);
}

#[tokio::test]
async fn test_fatal_model_error_aborts_without_retry() {
    let model = Arc::new(ScriptedModel::new().on_error(
        MANAGER,
        ModelError::ApiError {
            status: 401,
            message: "bad key".to_string(),
        },
    ));
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.reason, TerminalReason::Fatal);
    assert_eq!(model.calls().len(), 1);
}

#[tokio::test]
async fn test_device_disconnect_is_fatal() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(CLICK)),
    );
    let device = Arc::new(FakeDevice::new());
    device.fail_next_dispatch(DeviceError::Disconnected("device offline".to_string()));

    let events: Vec<Event> = runner(&model, &device, fast_options())
        .run_stream("tap", CancellationToken::new())
        .collect()
        .await;

    let names: Vec<&str> = events.iter().map(Event::name).collect();
    let n = names.len();
    assert_eq!(&names[n - 2..], &["step_end", "error"]);
    match &events[n - 1].kind {
        EventKind::Error { reason, kind, snapshot, .. } => {
            assert_eq!(*reason, TerminalReason::DeviceDisconnected);
            assert_eq!(*kind, ErrorKind::Fatal);
            assert_eq!(snapshot.step_count, 0);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(model.call_count(EXECUTOR), 1);
}

#[tokio::test]
async fn test_transient_capture_failure_is_retried() {
    let model = Arc::new(ScriptedModel::new().on(EXECUTOR, executor_reply(DONE)));
    let device = Arc::new(FakeDevice::new());
    device.fail_next_capture(DeviceError::Timeout("screencap".to_string()));

    let result = runner(&model, &device, fast_options())
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stats.retries_used, 1);
}

#[tokio::test]
async fn test_rejected_action_is_recorded_as_failure() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(r#"{"action":"open_app","text":"Nonexistent"}"#))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());
    device.fail_next_dispatch(DeviceError::Rejected("unknown app".to_string()));

    let result = runner(&model, &device, fast_options())
        .run("open the app", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.records[0].outcome, Some(Outcome::Failure));
    assert_eq!(result.records[0].error.as_deref(), Some("unknown app"));
    assert_eq!(result.stats.failed_actions, 1);
    // The device failure stands in for the reflector.
    assert_eq!(model.call_count(REFLECTOR), 0);
}

#[tokio::test]
async fn test_explicit_failure_done() {
    let model = Arc::new(ScriptedModel::new().on(
        EXECUTOR,
        executor_reply(r#"{"action":"terminate","status":"infeasible"}"#),
    ));
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("book a flight to the moon", CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Failure);
    assert_eq!(result.reason, TerminalReason::TaskFailed);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_empty_instruction_never_touches_device() {
    let model = Arc::new(ScriptedModel::new());
    let device = Arc::new(FakeDevice::new());

    let result = runner(&model, &device, fast_options())
        .run("   ", CancellationToken::new())
        .await;

    assert_eq!(result.reason, TerminalReason::InvalidInstruction);
    assert_eq!(device.connect_count(), 0);
    assert!(model.calls().is_empty());
}

#[tokio::test]
async fn test_busy_gate_fails_fast() {
    let model = Arc::new(ScriptedModel::new());
    let device = Arc::new(FakeDevice::new());
    let gate = ExecutionGate::exclusive();
    let _held = gate.acquire().await.unwrap();

    let result = runner(&model, &device, fast_options())
        .with_gate(gate)
        .run("tap", CancellationToken::new())
        .await;

    assert_eq!(result.reason, TerminalReason::Busy);
    assert_eq!(device.connect_count(), 0);
}

#[tokio::test]
async fn test_single_agent_engine() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(None, executor_reply(CLICK))
            .on(None, "no action here")
            .on(None, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());

    let result = runner(
        &model,
        &device,
        fast_options().with_engine(EngineKind::SingleAgent),
    )
    .run("tap the settings icon", CancellationToken::new())
    .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.records[1].validity, Validity::Invalid);
    assert_eq!(device.dispatch_count(), 1);
    assert!(model.calls().iter().all(Option::is_none));
    assert_history_matches_steps(&result);
}

#[tokio::test]
async fn test_stats_surface_follows_run() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(CLICK))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::new());
    let runner = runner(&model, &device, fast_options());
    let rx = runner.subscribe_stats();

    let result = runner.run("tap", CancellationToken::new()).await;

    assert_eq!(runner.stats(), result.stats);
    assert_eq!(*rx.borrow(), result.stats);
}

#[tokio::test]
async fn test_wait_longer_than_device_timeout() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(EXECUTOR, executor_reply(r#"{"action":"wait","time":0.6}"#))
            .on(EXECUTOR, executor_reply(DONE)),
    );
    let device = Arc::new(FakeDevice::with_size(280, 560));

    let result = runner(
        &model,
        &device,
        fast_options().with_device_timeout(Duration::from_millis(300)),
    )
    .run("wait for the page", CancellationToken::new())
    .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.records[0].action, Action::Wait { seconds: 0.6 });
    assert_eq!(result.records[0].outcome, Some(Outcome::Success));
    assert_eq!(result.stats.retries_used, 0);
    assert_eq!(device.dispatch_count(), 1);
}

#[tokio::test]
async fn test_overlapping_runs_are_isolated() {
    let model = Arc::new(ScriptedModel::new().fallback(EXECUTOR, executor_reply(CLICK)));
    let device = Arc::new(FakeDevice::new());
    let shared = runner(
        &model,
        &device,
        fast_options()
            .with_max_steps(2)
            .with_wait_after_action(Duration::from_millis(100)),
    );
    let (first, second) = (shared.clone(), shared.clone());

    let (a, b) = tokio::join!(
        first.run("open settings", CancellationToken::new()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            second.run("check the battery", CancellationToken::new()).await
        }
    );

    assert_ne!(a.task_id, b.task_id);
    assert_eq!(a.snapshot.instruction, "open settings");
    assert_eq!(b.snapshot.instruction, "check the battery");
    for result in [&a, &b] {
        assert_eq!(result.reason, TerminalReason::BudgetExhausted);
        assert_eq!(result.total_steps, 2);
        assert_eq!(result.stats.successful_actions, 2);
        assert_eq!(result.stats.total_steps, 2);
        assert_history_matches_steps(result);
    }
    assert_eq!(device.dispatch_count(), 4);
    // The runner reports the run started last.
    assert_eq!(shared.stats(), b.stats);
}
