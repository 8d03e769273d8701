//! Action handler for executing validated actions on a device.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceAdapter, DeviceError};
use crate::perception::Frame;

use super::model::Action;

/// Result of an action execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub should_finish: bool,
    pub message: Option<String>,
}

impl ActionOutcome {
    /// Create a successful result.
    pub fn success() -> Self {
        Self {
            success: true,
            should_finish: false,
            message: None,
        }
    }

    /// Create a failure result.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_finish: false,
            message: Some(message.into()),
        }
    }

    /// Create a finish result.
    pub fn finish(success: bool, message: Option<String>) -> Self {
        Self {
            success,
            should_finish: true,
            message,
        }
    }
}

/// Maps screenshot-space actions onto the device.
///
/// The model sees a resized screenshot, so coordinates are multiplied by the
/// source/normalized ratio of the frame the decision was made on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionHandler {
    /// Scale factor for X coordinates (screenshot * scale = device pixel)
    scale_x: f64,
    /// Scale factor for Y coordinates (screenshot * scale = device pixel)
    scale_y: f64,
}

impl Default for ActionHandler {
    fn default() -> Self {
        Self::with_scale(1.0, 1.0)
    }
}

impl ActionHandler {
    /// Create a handler with explicit scale factors.
    pub fn with_scale(scale_x: f64, scale_y: f64) -> Self {
        Self { scale_x, scale_y }
    }

    /// Create a handler for actions decided on the given frame.
    pub fn for_frame(frame: &Frame) -> Self {
        let (scale_x, scale_y) = frame.scale();
        Self::with_scale(scale_x, scale_y)
    }

    /// Get the current coordinate scale factors.
    pub fn scale(&self) -> (f64, f64) {
        (self.scale_x, self.scale_y)
    }

    /// Execute an action. `Done` and `Invalid` are resolved locally.
    pub async fn execute(
        &self,
        action: &Action,
        device: &dyn DeviceAdapter,
    ) -> Result<ActionOutcome, DeviceError> {
        match action {
            Action::Done { success, summary } => Ok(ActionOutcome::finish(
                *success,
                (!summary.is_empty()).then(|| summary.clone()),
            )),
            Action::Invalid { reason } => Ok(ActionOutcome::failure(reason.clone())),
            _ => {
                let physical = action.scaled(self.scale_x, self.scale_y);
                debug!(action = ?physical, "Dispatching action to device");
                device.dispatch(&physical).await
            }
        }
    }
}
