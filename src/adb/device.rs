//! [`DeviceAdapter`] over the `adb` command line.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionOutcome};
use crate::config::resolve_package;
use crate::device::{DeviceAdapter, DeviceError, DeviceInfo, Screenshot};

use super::connection::{parse_wm_size, AdbConnection};
use super::input::{
    enable_adb_keyboard, key_code, keyevent_args, launch_args, restore_keyboard, shell_owned,
    swipe_args, tap_args, type_text, LONG_PRESS_DURATION_MS,
};
use super::screenshot::{capture, FALLBACK_SIZE};

#[derive(Debug, Default)]
struct Session {
    device_id: Option<String>,
    screen: Option<(u32, u32)>,
    original_ime: Option<String>,
}

/// One ADB device session.
///
/// With an address containing `:` the device is reached over TCP/IP with
/// `adb connect` first. Without a device id the first online device is used.
pub struct AdbDevice {
    adb_path: String,
    address: Option<String>,
    session: Mutex<Session>,
}

impl AdbDevice {
    pub fn new(device_id: Option<String>) -> Self {
        let device_id = device_id.filter(|id| !id.trim().is_empty());
        Self {
            adb_path: "adb".to_string(),
            address: device_id.clone().filter(|id| id.contains(':')),
            session: Mutex::new(Session {
                device_id,
                ..Session::default()
            }),
        }
    }

    pub fn with_adb_path(mut self, path: impl Into<String>) -> Self {
        self.adb_path = path.into();
        self
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn conn(&self) -> AdbConnection {
        AdbConnection::new()
            .with_path(self.adb_path.clone())
            .with_device(self.session().device_id.clone())
    }

    async fn select_device(&self) -> Result<String, DeviceError> {
        let base = AdbConnection::new().with_path(self.adb_path.clone());
        if let Some(address) = &self.address {
            base.connect_remote(address).await?;
        }
        let devices = base.list_devices().await?;
        let wanted = self.session().device_id.clone();
        let device = match &wanted {
            Some(id) => devices.into_iter().find(|d| &d.device_id == id),
            None => devices.into_iter().find(|d| d.is_online()),
        };
        match device {
            Some(d) if d.is_online() => Ok(d.device_id),
            Some(d) => Err(DeviceError::Disconnected(format!(
                "device {} is {}",
                d.device_id, d.status
            ))),
            None => Err(DeviceError::Disconnected(match wanted {
                Some(id) => format!("device {} not found", id),
                None => "no devices attached".to_string(),
            })),
        }
    }

    async fn getprop(conn: &AdbConnection, name: &str) -> Option<String> {
        conn.shell(&["getprop", name])
            .await
            .ok()
            .filter(|value| !value.is_empty())
    }
}

#[async_trait]
impl DeviceAdapter for AdbDevice {
    async fn connect(&self) -> Result<DeviceInfo, DeviceError> {
        let device_id = self.select_device().await?;
        self.session().device_id = Some(device_id.clone());
        let conn = self.conn();

        let screen = conn.shell(&["wm", "size"]).await.ok().and_then(|s| parse_wm_size(&s));
        let model = Self::getprop(&conn, "ro.product.model").await;
        let android_version = Self::getprop(&conn, "ro.build.version.release").await;

        match enable_adb_keyboard(&conn).await {
            Ok(ime) => self.session().original_ime = Some(ime),
            Err(DeviceError::Disconnected(msg)) => return Err(DeviceError::Disconnected(msg)),
            Err(err) => warn!(device = %device_id, "ADB keyboard unavailable, text input may fail: {}", err),
        }
        self.session().screen = screen;

        info!(device = %device_id, ?model, ?screen, "ADB device ready");
        Ok(DeviceInfo {
            device_id,
            model,
            android_version,
            screen_width: screen.map(|(w, _)| w),
            screen_height: screen.map(|(_, h)| h),
        })
    }

    async fn capture(&self) -> Result<Screenshot, DeviceError> {
        let fallback = self.session().screen.unwrap_or(FALLBACK_SIZE);
        capture(&self.conn(), fallback).await
    }

    async fn dispatch(&self, action: &Action) -> Result<ActionOutcome, DeviceError> {
        let conn = self.conn();
        debug!(device = ?conn.device_id(), action = %action.describe(), "Dispatching");
        match action {
            Action::Click { x, y } => {
                shell_owned(&conn, tap_args(*x, *y)).await?;
            }
            Action::LongPress { x, y } => {
                shell_owned(&conn, swipe_args((*x, *y), (*x, *y), LONG_PRESS_DURATION_MS)).await?;
            }
            Action::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                duration_ms,
            } => {
                shell_owned(&conn, swipe_args((*from_x, *from_y), (*to_x, *to_y), *duration_ms))
                    .await?;
            }
            Action::Type { text } => type_text(&conn, text).await?,
            Action::Key { key_name } => {
                let code = key_code(key_name)
                    .ok_or_else(|| DeviceError::Rejected(format!("unsupported key `{}`", key_name)))?;
                shell_owned(&conn, keyevent_args(&code)).await?;
            }
            Action::Wait { seconds } => {
                let duration = Duration::try_from_secs_f64(*seconds).map_err(|_| {
                    DeviceError::Rejected(format!("invalid wait of {}s", seconds))
                })?;
                tokio::time::sleep(duration).await;
            }
            Action::OpenApp { name } => {
                let package = resolve_package(name)
                    .ok_or_else(|| DeviceError::Rejected(format!("unknown app `{}`", name)))?;
                let out = shell_owned(&conn, launch_args(&package)).await?;
                if out.contains("No activities found") {
                    return Err(DeviceError::Rejected(format!("{} is not installed", package)));
                }
            }
            Action::Done { .. } | Action::Invalid { .. } => {
                return Err(DeviceError::Rejected(format!(
                    "`{}` is not a device action",
                    action.kind_name()
                )));
            }
        }
        Ok(ActionOutcome::success())
    }

    async fn disconnect(&self) {
        let conn = self.conn();
        let ime = self.session().original_ime.take();
        if let Some(ime) = ime {
            if let Err(err) = restore_keyboard(&conn, &ime).await {
                warn!("Failed to restore keyboard {}: {}", ime, err);
            }
        }
        if let Some(address) = &self.address {
            AdbConnection::new()
                .with_path(self.adb_path.clone())
                .disconnect_remote(address)
                .await;
        }
    }
}
