//! Normalized action vocabulary and validation of raw model decisions.
//!
//! The model emits a JSON object such as `{"action":"click","coordinate":[100,200]}`,
//! optionally wrapped in a tool-call envelope. [`ActionValidator`] turns that into one
//! of the closed [`Action`] variants or an [`ActionError`] the caller maps to
//! [`Action::Invalid`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;

/// Default swipe duration in milliseconds.
pub const DEFAULT_SWIPE_DURATION_MS: u64 = 500;

/// Default wait in seconds when the model omits a duration.
pub const DEFAULT_WAIT_SECONDS: f64 = 2.0;

/// Longer waits are clamped to this many seconds.
pub const MAX_WAIT_SECONDS: f64 = 60.0;

/// System buttons the `system_button` kind accepts.
pub const SYSTEM_BUTTONS: [&str; 4] = ["back", "home", "menu", "enter"];

/// Action validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Malformed {kind} action: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("Unknown action kind: {0}")]
    UnknownKind(String),
    #[error(
        "Coordinate ({x}, {y}) is out of bounds. Valid range is [0, {width}) x [0, {height})"
    )]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
}

impl ActionError {
    fn malformed(kind: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// A validated device action. Coordinates live in screenshot pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i32,
        y: i32,
    },
    LongPress {
        x: i32,
        y: i32,
    },
    Swipe {
        from_x: i32,
        from_y: i32,
        to_x: i32,
        to_y: i32,
        duration_ms: u64,
    },
    Type {
        text: String,
    },
    Key {
        key_name: String,
    },
    Wait {
        seconds: f64,
    },
    OpenApp {
        name: String,
    },
    Done {
        success: bool,
        summary: String,
    },
    Invalid {
        reason: String,
    },
}

impl Action {
    /// Create an invalid action carrying the reason it was rejected.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Wire name of the action kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::LongPress { .. } => "long_press",
            Self::Swipe { .. } => "swipe",
            Self::Type { .. } => "type",
            Self::Key { .. } => "key",
            Self::Wait { .. } => "wait",
            Self::OpenApp { .. } => "open_app",
            Self::Done { .. } => "done",
            Self::Invalid { .. } => "invalid",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    /// Whether executing this action requires the device.
    pub fn needs_device(&self) -> bool {
        !matches!(self, Self::Done { .. } | Self::Invalid { .. })
    }

    /// Screen points touched by the action, in order.
    pub fn points(&self) -> Vec<(i32, i32)> {
        match self {
            Self::Click { x, y } | Self::LongPress { x, y } => vec![(*x, *y)],
            Self::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                ..
            } => vec![(*from_x, *from_y), (*to_x, *to_y)],
            _ => Vec::new(),
        }
    }

    /// Return a copy with coordinates multiplied by the given factors.
    pub fn scaled(&self, scale_x: f64, scale_y: f64) -> Self {
        let sx = |v: i32| (v as f64 * scale_x).round() as i32;
        let sy = |v: i32| (v as f64 * scale_y).round() as i32;
        match self {
            Self::Click { x, y } => Self::Click { x: sx(*x), y: sy(*y) },
            Self::LongPress { x, y } => Self::LongPress { x: sx(*x), y: sy(*y) },
            Self::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                duration_ms,
            } => Self::Swipe {
                from_x: sx(*from_x),
                from_y: sy(*from_y),
                to_x: sx(*to_x),
                to_y: sy(*to_y),
                duration_ms: *duration_ms,
            },
            other => other.clone(),
        }
    }

    /// One-line human readable summary, used for history and results.
    pub fn describe(&self) -> String {
        match self {
            Self::Click { x, y } => format!("Click at ({}, {})", x, y),
            Self::LongPress { x, y } => format!("Long press at ({}, {})", x, y),
            Self::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                ..
            } => format!(
                "Swipe from ({}, {}) to ({}, {})",
                from_x, from_y, to_x, to_y
            ),
            Self::Type { text } => format!("Type \"{}\"", text),
            Self::Key { key_name } => format!("Press {}", key_name),
            Self::Wait { seconds } => format!("Wait {:.1}s", seconds),
            Self::OpenApp { name } => format!("Open app {}", name),
            Self::Done { success: true, summary } if summary.is_empty() => {
                "Task completed".to_string()
            }
            Self::Done { success: true, summary } => format!("Task completed: {}", summary),
            Self::Done { success: false, summary } if summary.is_empty() => {
                "Task failed".to_string()
            }
            Self::Done { success: false, summary } => format!("Task failed: {}", summary),
            Self::Invalid { reason } => format!("Invalid action: {}", reason),
        }
    }

    /// Canonical wire representation, accepted back by [`ActionValidator`].
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Click { x, y } => json!({"action": "click", "coordinate": [x, y]}),
            Self::LongPress { x, y } => json!({"action": "long_press", "coordinate": [x, y]}),
            Self::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                duration_ms,
            } => json!({
                "action": "swipe",
                "coordinate": [from_x, from_y],
                "coordinate2": [to_x, to_y],
                "duration": duration_ms,
            }),
            Self::Type { text } => json!({"action": "type", "text": text}),
            Self::Key { key_name } => json!({"action": "key", "key": key_name}),
            Self::Wait { seconds } => json!({"action": "wait", "time": seconds}),
            Self::OpenApp { name } => json!({"action": "open_app", "text": name}),
            Self::Done { success, summary } => json!({
                "action": "done",
                "status": if *success { "success" } else { "failure" },
                "summary": summary,
            }),
            Self::Invalid { reason } => json!({"action": "invalid", "reason": reason}),
        }
    }
}

/// What to do with coordinates outside the screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    #[default]
    Reject,
    Clamp,
}

/// Pixel dimensions of the screenshot the model reasoned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenBounds {
    pub width: u32,
    pub height: u32,
}

impl ScreenBounds {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width as i64 && y < self.height as i64
    }
}

/// Parses raw model decisions into [`Action`] values.
///
/// Validation is pure: the same input and configuration always produce the
/// same result, and `validate(&action.to_wire())` returns `action` unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionValidator {
    bounds: Option<ScreenBounds>,
    policy: BoundsPolicy,
}

impl ActionValidator {
    pub fn new(policy: BoundsPolicy) -> Self {
        Self {
            bounds: None,
            policy,
        }
    }

    /// Check coordinates against the given screenshot bounds.
    pub fn with_bounds(mut self, bounds: ScreenBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn policy(&self) -> BoundsPolicy {
        self.policy
    }

    /// Validate a raw decision string, usually the action block of a model response.
    pub fn validate_str(&self, raw: &str) -> Result<Action, ActionError> {
        let trimmed = strip_code_fence(raw.trim());
        if trimmed.is_empty() {
            return Err(ActionError::malformed("decision", "empty action block"));
        }
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ActionError::malformed("decision", format!("invalid JSON: {}", e)))?;
        self.validate(&value)
    }

    /// Validate an already decoded JSON decision.
    pub fn validate(&self, raw: &Value) -> Result<Action, ActionError> {
        let obj = unwrap_envelope(raw)?;
        let kind = obj
            .get("action")
            .or_else(|| obj.get("action_type"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .ok_or_else(|| ActionError::malformed("decision", "missing `action` field"))?;

        let action = match kind.as_str() {
            "click" | "tap" => {
                let (x, y) = point(&obj, "coordinate", &kind)?;
                Action::Click { x, y }
            }
            "long_press" | "longpress" => {
                let (x, y) = point(&obj, "coordinate", &kind)?;
                Action::LongPress { x, y }
            }
            "swipe" => {
                let (from_x, from_y) = point(&obj, "coordinate", &kind)?;
                let (to_x, to_y) = point(&obj, "coordinate2", &kind)?;
                let duration_ms = match obj.get("duration") {
                    None | Some(Value::Null) => DEFAULT_SWIPE_DURATION_MS,
                    Some(v) => v.as_u64().ok_or_else(|| {
                        ActionError::malformed(&kind, "`duration` must be a non-negative integer")
                    })?,
                };
                Action::Swipe {
                    from_x,
                    from_y,
                    to_x,
                    to_y,
                    duration_ms,
                }
            }
            "type" | "input" => Action::Type {
                text: string_field(&obj, &["text"], &kind, true)?,
            },
            "key" => Action::Key {
                key_name: string_field(&obj, &["key", "text"], &kind, false)?.to_lowercase(),
            },
            "system_button" => {
                let button = string_field(&obj, &["button", "text"], &kind, false)?.to_lowercase();
                if !SYSTEM_BUTTONS.contains(&button.as_str()) {
                    return Err(ActionError::malformed(
                        &kind,
                        format!("unsupported button `{}`", button),
                    ));
                }
                Action::Key { key_name: button }
            }
            "wait" => {
                let seconds = match obj.get("time").or_else(|| obj.get("seconds")) {
                    None | Some(Value::Null) => DEFAULT_WAIT_SECONDS,
                    Some(v) => v.as_f64().ok_or_else(|| {
                        ActionError::malformed(&kind, "`time` must be a number")
                    })?,
                };
                if seconds.is_nan() || seconds < 0.0 {
                    return Err(ActionError::malformed(&kind, "`time` must be non-negative"));
                }
                if seconds > MAX_WAIT_SECONDS {
                    warn!(seconds, "Clamping wait to {}s", MAX_WAIT_SECONDS);
                }
                Action::Wait {
                    seconds: seconds.min(MAX_WAIT_SECONDS),
                }
            }
            "open_app" | "open" | "launch" => Action::OpenApp {
                name: string_field(&obj, &["text", "name", "app"], &kind, false)?,
            },
            "answer" => Action::Done {
                success: true,
                summary: string_field(&obj, &["text"], &kind, true)?,
            },
            "done" | "terminate" | "finish" => Action::Done {
                success: done_status(&obj, &kind)?,
                summary: ["summary", "text", "message", "answer"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_string(),
            },
            "invalid" => Action::Invalid {
                reason: string_field(&obj, &["reason"], &kind, true)?,
            },
            other => return Err(ActionError::UnknownKind(other.to_string())),
        };

        self.check_bounds(action)
    }

    fn check_bounds(&self, action: Action) -> Result<Action, ActionError> {
        let Some(bounds) = self.bounds else {
            return Ok(action);
        };
        let out_of_range = action
            .points()
            .into_iter()
            .find(|(x, y)| !bounds.contains(*x as i64, *y as i64));
        let Some((x, y)) = out_of_range else {
            return Ok(action);
        };

        match self.policy {
            BoundsPolicy::Reject => Err(ActionError::OutOfBounds {
                x: x as i64,
                y: y as i64,
                width: bounds.width,
                height: bounds.height,
            }),
            BoundsPolicy::Clamp => {
                let clamp = |x: i32, y: i32| {
                    (
                        x.clamp(0, bounds.width.saturating_sub(1) as i32),
                        y.clamp(0, bounds.height.saturating_sub(1) as i32),
                    )
                };
                let clamped = match action {
                    Action::Click { x, y } => {
                        let (x, y) = clamp(x, y);
                        Action::Click { x, y }
                    }
                    Action::LongPress { x, y } => {
                        let (x, y) = clamp(x, y);
                        Action::LongPress { x, y }
                    }
                    Action::Swipe {
                        from_x,
                        from_y,
                        to_x,
                        to_y,
                        duration_ms,
                    } => {
                        let (from_x, from_y) = clamp(from_x, from_y);
                        let (to_x, to_y) = clamp(to_x, to_y);
                        Action::Swipe {
                            from_x,
                            from_y,
                            to_x,
                            to_y,
                            duration_ms,
                        }
                    }
                    other => other,
                };
                warn!(
                    attempted_x = x,
                    attempted_y = y,
                    clamped = ?clamped.points(),
                    "Clamped out-of-bounds coordinate"
                );
                Ok(clamped)
            }
        }
    }
}

/// Unwrap `{"name": ..., "arguments": {...}}` tool-call envelopes.
fn unwrap_envelope(raw: &Value) -> Result<Map<String, Value>, ActionError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ActionError::malformed("decision", "expected a JSON object"))?;

    match obj.get("arguments") {
        Some(Value::Object(args)) => Ok(args.clone()),
        Some(Value::String(args)) => match serde_json::from_str::<Value>(args) {
            Ok(Value::Object(args)) => Ok(args),
            _ => Err(ActionError::malformed(
                "decision",
                "`arguments` is not a JSON object",
            )),
        },
        _ => Ok(obj.clone()),
    }
}

fn point(obj: &Map<String, Value>, key: &str, kind: &str) -> Result<(i32, i32), ActionError> {
    let arr = obj
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ActionError::malformed(kind, format!("missing `{}` array", key)))?;
    if arr.len() < 2 {
        return Err(ActionError::malformed(
            kind,
            format!("`{}` needs two numbers", key),
        ));
    }
    let coord = |v: &Value| -> Result<i32, ActionError> {
        let n = v.as_f64().ok_or_else(|| {
            ActionError::malformed(kind, format!("`{}` must contain numbers", key))
        })?;
        let n = n.round();
        if n < i32::MIN as f64 || n > i32::MAX as f64 {
            return Err(ActionError::malformed(
                kind,
                format!("`{}` value {} is out of range", key, n),
            ));
        }
        Ok(n as i32)
    };
    Ok((coord(&arr[0])?, coord(&arr[1])?))
}

fn string_field(
    obj: &Map<String, Value>,
    keys: &[&str],
    kind: &str,
    allow_empty: bool,
) -> Result<String, ActionError> {
    let value = keys
        .iter()
        .find_map(|key| obj.get(*key))
        .ok_or_else(|| ActionError::malformed(kind, format!("missing `{}`", keys[0])))?;
    let text = value
        .as_str()
        .ok_or_else(|| ActionError::malformed(kind, format!("`{}` must be a string", keys[0])))?;
    if !allow_empty && text.trim().is_empty() {
        return Err(ActionError::malformed(kind, format!("`{}` is empty", keys[0])));
    }
    Ok(text.to_string())
}

fn done_status(obj: &Map<String, Value>, kind: &str) -> Result<bool, ActionError> {
    if let Some(success) = obj.get("success") {
        return success
            .as_bool()
            .ok_or_else(|| ActionError::malformed(kind, "`success` must be a boolean"));
    }
    match obj.get("status").and_then(Value::as_str) {
        Some(status) => Ok(matches!(
            status.trim().to_lowercase().as_str(),
            "success" | "successful" | "complete" | "completed"
        )),
        None => Err(ActionError::malformed(kind, "missing `status` or `success`")),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
