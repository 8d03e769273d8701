//! Agent errors and their classification.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::actions::ActionError;
use crate::device::DeviceError;
use crate::model::{ModelError, ResponseParseError};
use crate::perception::PerceptionError;

use super::info_pool::InfoPoolError;

/// How the loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retried within the retry budget, then aborts the run.
    Transient,
    /// Recorded as an invalid step; never aborts on its own.
    InvalidDecision,
    /// Ends the run immediately.
    Fatal,
}

/// Agent errors.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Instruction must not be empty")]
    EmptyInstruction,
    #[error("Another task is already running")]
    Busy,
    #[error("Run cancelled")]
    Cancelled,
    #[error("Step budget of {0} exhausted")]
    StepBudgetExhausted(u32),
    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },
    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),
    #[error("Device operation timed out after {0:?}")]
    DeviceTimeout(Duration),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Perception error: {0}")]
    Perception(#[from] PerceptionError),
    #[error("Invalid action: {0}")]
    Action(#[from] ActionError),
    #[error("Unusable model response: {0}")]
    Response(#[from] ResponseParseError),
    #[error("Information pool error: {0}")]
    InfoPool(#[from] InfoPoolError),
}

impl AgentError {
    /// Classify the error. This is the only place retry policy is decided from.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelTimeout(_) | Self::DeviceTimeout(_) => ErrorKind::Transient,
            Self::Model(err) => model_error_kind(err),
            Self::Device(err) => device_error_kind(err),
            Self::Perception(PerceptionError::Capture(err)) => device_error_kind(err),
            Self::Perception(_) => ErrorKind::Transient,
            Self::Action(_) | Self::Response(_) => ErrorKind::InvalidDecision,
            Self::EmptyInstruction
            | Self::Busy
            | Self::Cancelled
            | Self::StepBudgetExhausted(_)
            | Self::RetryBudgetExhausted { .. }
            | Self::InfoPool(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

fn model_error_kind(err: &ModelError) -> ErrorKind {
    match err {
        ModelError::RequestFailed(e) if e.is_builder() => ErrorKind::Fatal,
        ModelError::RequestFailed(_) => ErrorKind::Transient,
        ModelError::ApiError { status, .. } => {
            // status 0 marks an error event inside a stream
            if *status == 0 || *status == 408 || *status == 429 || *status >= 500 {
                ErrorKind::Transient
            } else {
                ErrorKind::Fatal
            }
        }
        ModelError::ParseError(_) | ModelError::EmptyResponse => ErrorKind::Transient,
    }
}

fn device_error_kind(err: &DeviceError) -> ErrorKind {
    match err {
        DeviceError::Disconnected(_) => ErrorKind::Fatal,
        DeviceError::Rejected(_) => ErrorKind::InvalidDecision,
        DeviceError::Timeout(_) | DeviceError::CaptureFailed(_) | DeviceError::CommandFailed(_) => {
            ErrorKind::Transient
        }
    }
}
