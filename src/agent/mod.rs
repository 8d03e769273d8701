//! Agent module: the shared information pool, the role agents and the
//! control loops that drive a task from instruction to a terminal state.

mod error;
mod events;
mod gate;
mod info_pool;
mod legacy;
mod orchestrator;
pub mod roles;
mod runner;
#[cfg(test)]
mod scenarios;
mod stats;

pub use error::{AgentError, ErrorKind};
pub use events::{Event, EventKind, EventSink, EventStream, StepStatus};
pub use gate::{ExecutionGate, GateMode, GatePermit};
pub use info_pool::{
    ActionRecord, InfoPool, InfoPoolError, Outcome, Plan, PoolSnapshot, Validity,
};
pub use legacy::SingleAgentEngine;
pub use orchestrator::{should_skip_manager, MultiAgentEngine};
pub use roles::{NotePolicy, RoleKind};
pub use runner::{
    EngineKind, RunError, RunOptions, RunResult, RunStatus, TaskRunner, TerminalReason,
};
pub use stats::{RunStats, StatsTracker};
