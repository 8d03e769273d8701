//! Step-level progress events for streaming runs.
//!
//! Within a step, events are emitted in this order:
//! `StepStart`, `Screenshot`, then per model call `ModelCallStart`,
//! `ModelChunk`*, `ModelComplete`, then `ActionParsed`, `ActionExecuting`,
//! `ActionCompleted` and finally `StepEnd`. A stream is closed by exactly one
//! `TaskCompleted` or one `Error`.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::actions::Action;
use crate::device::DeviceInfo;

use super::error::ErrorKind;
use super::info_pool::PoolSnapshot;
use super::roles::RoleKind;
use super::runner::{EngineKind, RunStatus, TerminalReason};
use super::stats::RunStats;

/// Caller-facing stream of events, closed after the terminal event.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskCompleted { .. } | EventKind::Error { .. }
        )
    }

    pub fn step(&self) -> Option<u32> {
        match &self.kind {
            EventKind::StepStart { step, .. }
            | EventKind::Screenshot { step, .. }
            | EventKind::ModelCallStart { step, .. }
            | EventKind::ModelChunk { step, .. }
            | EventKind::ModelComplete { step, .. }
            | EventKind::ActionParsed { step, .. }
            | EventKind::ActionExecuting { step, .. }
            | EventKind::ActionCompleted { step, .. }
            | EventKind::StepEnd { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Snake-case name of the event type.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            EventKind::TaskInit { .. } => "task_init",
            EventKind::DeviceConnected { .. } => "device_connected",
            EventKind::StepStart { .. } => "step_start",
            EventKind::Screenshot { .. } => "screenshot",
            EventKind::ModelCallStart { .. } => "model_call_start",
            EventKind::ModelChunk { .. } => "model_chunk",
            EventKind::ModelComplete { .. } => "model_complete",
            EventKind::ActionParsed { .. } => "action_parsed",
            EventKind::ActionExecuting { .. } => "action_executing",
            EventKind::ActionCompleted { .. } => "action_completed",
            EventKind::StepEnd { .. } => "step_end",
            EventKind::TaskCompleted { .. } => "task_completed",
            EventKind::Error { .. } => "error",
        }
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Invalid,
    Failed,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    TaskInit {
        instruction: String,
        max_steps: u32,
        engine: EngineKind,
    },
    DeviceConnected {
        device: DeviceInfo,
    },
    StepStart {
        step: u32,
        max_steps: u32,
    },
    Screenshot {
        step: u32,
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
        /// The previous frame was reused for a smart retry.
        reused: bool,
    },
    ModelCallStart {
        step: u32,
        role: Option<RoleKind>,
        model: String,
        attempt: u32,
    },
    ModelChunk {
        step: u32,
        role: Option<RoleKind>,
        chunk: String,
    },
    ModelComplete {
        step: u32,
        role: Option<RoleKind>,
        response_length: usize,
        chunks_received: usize,
    },
    ActionParsed {
        step: u32,
        action: Action,
        thinking: String,
        description: String,
    },
    ActionExecuting {
        step: u32,
        action: Action,
    },
    ActionCompleted {
        step: u32,
        success: bool,
        message: Option<String>,
    },
    StepEnd {
        step: u32,
        status: StepStatus,
        error: Option<String>,
    },
    TaskCompleted {
        status: RunStatus,
        total_steps: u32,
        summary: String,
        stats: RunStats,
    },
    Error {
        kind: ErrorKind,
        status: RunStatus,
        reason: TerminalReason,
        message: String,
        snapshot: Box<PoolSnapshot>,
    },
}

/// Sending half of a run's event channel. A sink without a channel drops events,
/// which is how blocking runs use it.
#[derive(Debug, Clone)]
pub struct EventSink {
    task_id: String,
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn new(task_id: impl Into<String>, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            task_id: task_id.into(),
            tx: Some(tx),
        }
    }

    pub fn disabled(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            tx: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn emit(&self, kind: EventKind) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Event {
                task_id: self.task_id.clone(),
                timestamp: Utc::now(),
                kind,
            });
        }
    }

    /// The receiver was dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}
