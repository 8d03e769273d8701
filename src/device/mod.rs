//! Device collaborator contract consumed by the agent loop.
//!
//! One [`DeviceAdapter`] is one device session. The ADB implementation lives in
//! [`crate::adb`]; tests use scripted fakes.

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::{Action, ActionOutcome};

/// Device errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device disconnected: {0}")]
    Disconnected(String),
    #[error("Device operation timed out: {0}")]
    Timeout(String),
    #[error("Failed to capture screenshot: {0}")]
    CaptureFailed(String),
    #[error("Device command failed: {0}")]
    CommandFailed(String),
    #[error("Device rejected action: {0}")]
    Rejected(String),
}

/// Metadata reported by a connected device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
}

/// A raw screen capture at physical resolution.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: DynamicImage,
    /// Set when the device refused the capture (secure window) and a blank frame
    /// was substituted.
    pub is_sensitive: bool,
}

impl Screenshot {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            is_sensitive: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Capabilities the agent needs from a device session.
///
/// Actions passed to [`DeviceAdapter::dispatch`] are already scaled to physical
/// pixels. `Done` and `Invalid` never reach the device.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Open the session and report device metadata.
    async fn connect(&self) -> Result<DeviceInfo, DeviceError>;

    /// Capture the current screen.
    async fn capture(&self) -> Result<Screenshot, DeviceError>;

    /// Perform one action on the device.
    async fn dispatch(&self, action: &Action) -> Result<ActionOutcome, DeviceError>;

    /// Close the session. Never fails; problems are logged.
    async fn disconnect(&self);
}
