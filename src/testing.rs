//! Test doubles: a recording device and a scripted model.

use async_trait::async_trait;
use futures::stream;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::actions::{Action, ActionOutcome};
use crate::agent::{RoleKind, RunOptions};
use crate::device::{DeviceAdapter, DeviceError, DeviceInfo, Screenshot};
use crate::model::{ChatMessage, Completion, ModelError, ModelGateway};
use crate::perception::{normalize, Frame, ImageBudget};

/// A small normalized frame.
pub fn frame() -> Frame {
    normalize(
        &DynamicImage::ImageRgb8(RgbImage::new(280, 560)),
        &ImageBudget::default(),
    )
    .expect("normalize test frame")
}

/// Options without real waiting.
pub fn fast_options() -> RunOptions {
    RunOptions::default()
        .with_wait_after_action(Duration::ZERO)
        .with_retry_delay(Duration::from_millis(1))
        .with_model_timeout(Duration::from_secs(5))
        .with_device_timeout(Duration::from_secs(5))
}

/// Executor reply in the tag format.
pub fn executor_reply(action_json: &str) -> String {
    format!(
        "<thinking>Looking at the screen.</thinking>\n<tool_call>\n{}\n</tool_call>\n<conclusion>Next action.</conclusion>",
        action_json
    )
}

pub fn plan_reply(plan: &str) -> String {
    format!(
        "### Thought ###\nWork through the task.\n\n### Completed Subgoal ###\nNone\n\n### Plan ###\n{}",
        plan
    )
}

pub fn reflection_reply(letter: char) -> String {
    format!(
        "### Outcome ###\n{}\n\n### Error Description ###\n{}",
        letter,
        if letter == 'A' { "None" } else { "The screen did not change as expected." }
    )
}

/// Device that records dispatched actions and can be told to fail.
pub struct FakeDevice {
    width: u32,
    height: u32,
    dispatched: Mutex<Vec<Action>>,
    dispatch_errors: Mutex<VecDeque<DeviceError>>,
    capture_errors: Mutex<VecDeque<DeviceError>>,
    cancel_on_dispatch: Mutex<Option<CancellationToken>>,
    captures: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::with_size(1080, 2400)
    }

    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            dispatched: Mutex::new(Vec::new()),
            dispatch_errors: Mutex::new(VecDeque::new()),
            capture_errors: Mutex::new(VecDeque::new()),
            cancel_on_dispatch: Mutex::new(None),
            captures: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn dispatched(&self) -> Vec<Action> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// The next dispatch fails with `error` instead of reaching the screen.
    pub fn fail_next_dispatch(&self, error: DeviceError) {
        self.dispatch_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_capture(&self, error: DeviceError) {
        self.capture_errors.lock().unwrap().push_back(error);
    }

    /// Cancel `token` during the next successful dispatch.
    pub fn cancel_on_dispatch(&self, token: CancellationToken) {
        *self.cancel_on_dispatch.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl DeviceAdapter for FakeDevice {
    async fn connect(&self) -> Result<DeviceInfo, DeviceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceInfo {
            device_id: "fake-device".to_string(),
            model: Some("Fake".to_string()),
            android_version: Some("14".to_string()),
            screen_width: Some(self.width),
            screen_height: Some(self.height),
        })
    }

    async fn capture(&self) -> Result<Screenshot, DeviceError> {
        if let Some(err) = self.capture_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        let shade = (n * 40 % 256) as u8;
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([shade, shade, shade]));
        Ok(Screenshot::new(DynamicImage::ImageRgb8(image)))
    }

    async fn dispatch(&self, action: &Action) -> Result<ActionOutcome, DeviceError> {
        if let Some(err) = self.dispatch_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.dispatched.lock().unwrap().push(action.clone());
        if let Action::Wait { seconds } = action {
            tokio::time::sleep(Duration::from_secs_f64(*seconds)).await;
        }
        if let Some(token) = self.cancel_on_dispatch.lock().unwrap().take() {
            token.cancel();
        }
        Ok(ActionOutcome::success())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

enum Reply {
    Text(String),
    Error(ModelError),
}

/// Model answering from per-role queues. The role is recognized from the
/// system prompt; `None` is the single-agent engine.
pub struct ScriptedModel {
    queues: Mutex<HashMap<Option<RoleKind>, VecDeque<Reply>>>,
    fallbacks: Mutex<HashMap<Option<RoleKind>, String>>,
    calls: Mutex<Vec<Option<RoleKind>>>,
    prompts: Mutex<Vec<(Option<RoleKind>, String)>>,
    chunk_size: Option<usize>,
}

impl ScriptedModel {
    /// Manager, Reflector and Notetaker have benign fallback replies; the
    /// Executor and the single agent must be scripted.
    pub fn new() -> Self {
        let fallbacks = HashMap::from([
            (Some(RoleKind::Manager), plan_reply("1. Complete the task")),
            (Some(RoleKind::Reflector), reflection_reply('A')),
            (
                Some(RoleKind::Notetaker),
                "### Important Notes ###\nNone".to_string(),
            ),
        ]);
        Self {
            queues: Mutex::new(HashMap::new()),
            fallbacks: Mutex::new(fallbacks),
            calls: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            chunk_size: None,
        }
    }

    /// Split streamed replies into chunks of `size` characters.
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    pub fn on(self, role: Option<RoleKind>, text: impl Into<String>) -> Self {
        self.push(role, Reply::Text(text.into()));
        self
    }

    pub fn on_error(self, role: Option<RoleKind>, error: ModelError) -> Self {
        self.push(role, Reply::Error(error));
        self
    }

    pub fn fallback(self, role: Option<RoleKind>, text: impl Into<String>) -> Self {
        self.fallbacks.lock().unwrap().insert(role, text.into());
        self
    }

    fn push(&self, role: Option<RoleKind>, reply: Reply) {
        self.queues
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<Option<RoleKind>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, role: Option<RoleKind>) -> usize {
        self.calls().iter().filter(|r| **r == role).count()
    }

    /// Text of the last message of every call made by `role`.
    pub fn prompts(&self, role: Option<RoleKind>) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn detect_role(messages: &[ChatMessage]) -> Option<RoleKind> {
        let system = messages.first().map(|m| m.text()).unwrap_or_default();
        if system.contains("planning agent") {
            Some(RoleKind::Manager)
        } else if system.contains("acting agent") {
            Some(RoleKind::Executor)
        } else if system.contains("reflection agent") {
            Some(RoleKind::Reflector)
        } else if system.contains("note-taking agent") {
            Some(RoleKind::Notetaker)
        } else {
            None
        }
    }
}

#[async_trait]
impl ModelGateway for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        streaming: bool,
    ) -> Result<Completion, ModelError> {
        let role = Self::detect_role(messages);
        self.calls.lock().unwrap().push(role);
        let prompt = messages.last().map(ChatMessage::text).unwrap_or_default();
        self.prompts.lock().unwrap().push((role, prompt));

        let queued = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(VecDeque::pop_front);
        let text = match queued {
            Some(Reply::Text(text)) => text,
            Some(Reply::Error(err)) => return Err(err),
            None => self
                .fallbacks
                .lock()
                .unwrap()
                .get(&role)
                .cloned()
                .ok_or_else(|| ModelError::ApiError {
                    status: 400,
                    message: format!("no scripted reply for {:?}", role),
                })?,
        };

        match (streaming, self.chunk_size) {
            (true, Some(size)) => {
                let chars: Vec<char> = text.chars().collect();
                let chunks: Vec<Result<String, ModelError>> = chars
                    .chunks(size)
                    .map(|c| Ok(c.iter().collect()))
                    .collect();
                Ok(Completion::Stream(Box::pin(stream::iter(chunks))))
            }
            _ => Ok(Completion::Text(text)),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
