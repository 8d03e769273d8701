//! Configuration data: role prompts and the app package table.

mod apps;
mod prompts;

pub use apps::{normalize_app_name, resolve_package, APP_PACKAGES};
pub use prompts::{
    with_context_header, ACTION_SPACE, EXECUTOR_PROMPT, MANAGER_PROMPT, NOTETAKER_PROMPT,
    REFLECTOR_PROMPT, SINGLE_AGENT_PROMPT,
};
