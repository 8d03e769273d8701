//! Actions module: the action vocabulary, its validation and execution.

mod handler;
mod model;

pub use handler::{ActionHandler, ActionOutcome};
pub use model::{
    Action, ActionError, ActionValidator, BoundsPolicy, ScreenBounds, DEFAULT_SWIPE_DURATION_MS,
    DEFAULT_WAIT_SECONDS, MAX_WAIT_SECONDS, SYSTEM_BUTTONS,
};
