//! Persistent settings for the CLI.
//!
//! Stored as JSON in the platform config directory via `directories::ProjectDirs`.
//! Missing fields fall back to defaults, and environment variables override
//! whatever was loaded.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::actions::BoundsPolicy;
use crate::agent::{EngineKind, NotePolicy, RunOptions};
use crate::model::ModelConfig;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot determine config directory")]
    NoConfigDir,
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    /// ADB serial or `host:port`; empty picks the first online device.
    pub device_id: String,
    pub max_steps: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub smart_retry: bool,
    pub wait_after_action_ms: u64,
    pub model_timeout_secs: u64,
    pub device_timeout_secs: u64,
    pub streaming: bool,
    pub engine: EngineKind,
    pub note_policy: NotePolicy,
    pub bounds_policy: BoundsPolicy,
    /// Artifact directory; empty disables artifacts.
    pub output_dir: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gui-owl-7b".to_string(),
            device_id: String::new(),
            max_steps: 50,
            max_retries: 3,
            retry_delay_ms: 1000,
            smart_retry: true,
            wait_after_action_ms: 2000,
            model_timeout_secs: 120,
            device_timeout_secs: 30,
            streaming: false,
            engine: EngineKind::MultiAgent,
            note_policy: NotePolicy::default(),
            bounds_policy: BoundsPolicy::default(),
            output_dir: String::new(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "moderras", "mobile-agent")
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

impl AppSettings {
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Default artifact location when none is configured.
    pub fn default_output_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().join("runs"))
    }

    /// Load from the config directory. A missing or unreadable file yields defaults.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), "Ignoring settings file: {}", err);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; unset or empty keys are left alone.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MODEL_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("MODEL_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("MODEL_NAME") {
            self.model_name = v;
        }
        if let Some(v) = get("ADB_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = get("AGENT_MAX_STEPS") {
            self.max_steps = parse("AGENT_MAX_STEPS", &v)?;
        }
        if let Some(v) = get("AGENT_MAX_RETRIES") {
            self.max_retries = parse("AGENT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("AGENT_SMART_RETRY") {
            self.smart_retry = parse_bool("AGENT_SMART_RETRY", &v)?;
        }
        if let Some(v) = get("AGENT_WAIT_AFTER_ACTION") {
            let seconds: f64 = parse("AGENT_WAIT_AFTER_ACTION", &v)?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(SettingsError::InvalidValue {
                    key: "AGENT_WAIT_AFTER_ACTION",
                    value: v,
                });
            }
            self.wait_after_action_ms = (seconds * 1000.0).round() as u64;
        }
        if let Some(v) = get("AGENT_ENGINE") {
            self.engine = parse("AGENT_ENGINE", &v)?;
        }
        if let Some(v) = get("AGENT_STREAM") {
            self.streaming = parse_bool("AGENT_STREAM", &v)?;
        }
        if let Some(v) = get("AGENT_OUTPUT_DIR") {
            self.output_dir = v;
        }
        Ok(())
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.base_url)
            .with_api_key(&self.api_key)
            .with_model_name(&self.model_name)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::default()
            .with_max_steps(self.max_steps)
            .with_max_retry_attempts(self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_smart_retry(self.smart_retry)
            .with_wait_after_action(Duration::from_millis(self.wait_after_action_ms))
            .with_model_timeout(Duration::from_secs(self.model_timeout_secs))
            .with_device_timeout(Duration::from_secs(self.device_timeout_secs))
            .with_streaming(self.streaming)
            .with_engine(self.engine)
            .with_note_policy(self.note_policy)
            .with_bounds_policy(self.bounds_policy)
    }

    pub fn device_id(&self) -> Option<String> {
        Some(self.device_id.trim().to_string()).filter(|id| !id.is_empty())
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        Some(self.output_dir.trim())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
    }
}
