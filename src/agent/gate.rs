//! Process-wide limit on concurrent device sessions.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::error::AgentError;

/// What to do when no slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    #[default]
    Wait,
    /// Fail with [`AgentError::Busy`].
    FailFast,
}

/// Semaphore shared by runners. Clone it to share the same slots.
#[derive(Debug, Clone)]
pub struct ExecutionGate {
    slots: Arc<Semaphore>,
    mode: GateMode,
}

/// Held from Init to Terminal; the slot is released on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ExecutionGate {
    pub fn new(slots: usize, mode: GateMode) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
            mode,
        }
    }

    /// One run at a time, failing fast like a single-task server lock.
    pub fn exclusive() -> Self {
        Self::new(1, GateMode::FailFast)
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn acquire(&self) -> Result<GatePermit, AgentError> {
        let permit = match self.mode {
            GateMode::Wait => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AgentError::Cancelled)?,
            GateMode::FailFast => match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Err(AgentError::Busy),
                Err(TryAcquireError::Closed) => return Err(AgentError::Cancelled),
            },
        };
        Ok(GatePermit { _permit: permit })
    }
}
