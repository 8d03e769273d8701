//! Thin async wrapper around the `adb` command line.

use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::device::DeviceError;

/// How a listed device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Wifi,
    Remote,
}

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDevice {
    pub device_id: String,
    pub status: String,
    pub connection_type: ConnectionType,
    pub model: Option<String>,
}

impl ListedDevice {
    pub fn is_online(&self) -> bool {
        self.status == "device"
    }
}

/// Runs `adb` commands, optionally pinned to one device with `-s`.
#[derive(Debug, Clone)]
pub struct AdbConnection {
    adb_path: String,
    device_id: Option<String>,
}

impl Default for AdbConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbConnection {
    pub fn new() -> Self {
        Self {
            adb_path: "adb".to_string(),
            device_id: None,
        }
    }

    pub fn with_path(mut self, adb_path: impl Into<String>) -> Self {
        self.adb_path = adb_path.into();
        self
    }

    pub fn with_device(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Arguments placed before every command.
    pub(crate) fn prefix(&self) -> Vec<String> {
        match &self.device_id {
            Some(id) => vec!["-s".to_string(), id.clone()],
            None => Vec::new(),
        }
    }

    /// Run `adb <args>` against the pinned device and return the raw output.
    pub async fn run(&self, args: &[&str]) -> Result<Output, DeviceError> {
        debug!(device = ?self.device_id, ?args, "adb");
        let output = Command::new(&self.adb_path)
            .args(self.prefix())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DeviceError::CommandFailed(format!("failed to spawn adb: {}", e)))?;

        if let Some(err) = classify_failure(&output) {
            return Err(err);
        }
        Ok(output)
    }

    /// Run `adb shell <args>` and return trimmed stdout.
    pub async fn shell(&self, args: &[&str]) -> Result<String, DeviceError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        let output = self.run(&full).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `adb connect host[:port]`; the port defaults to 5555.
    pub async fn connect_remote(&self, address: &str) -> Result<(), DeviceError> {
        let address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:5555", address)
        };
        let output = Command::new(&self.adb_path)
            .args(["connect", &address])
            .output()
            .await
            .map_err(|e| DeviceError::CommandFailed(format!("failed to spawn adb: {}", e)))?;

        let combined = combined_output(&output).to_lowercase();
        if combined.contains("connected") && !combined.contains("unable") {
            Ok(())
        } else {
            Err(DeviceError::Disconnected(format!(
                "cannot connect to {}: {}",
                address,
                combined.trim()
            )))
        }
    }

    pub async fn disconnect_remote(&self, address: &str) {
        if let Err(e) = Command::new(&self.adb_path)
            .args(["disconnect", address])
            .output()
            .await
        {
            warn!("adb disconnect {} failed: {}", address, e);
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<ListedDevice>, DeviceError> {
        let output = Command::new(&self.adb_path)
            .args(["devices", "-l"])
            .output()
            .await
            .map_err(|e| DeviceError::CommandFailed(format!("failed to spawn adb: {}", e)))?;
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn combined_output(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// Map a failed command onto a device error. Lost devices are reported as
/// [`DeviceError::Disconnected`].
pub(crate) fn classify_failure(output: &Output) -> Option<DeviceError> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lower = stderr.to_lowercase();
    if lower.contains("device offline")
        || lower.contains("not found")
        || lower.contains("no devices/emulators")
        || lower.contains("device unauthorized")
    {
        return Some(DeviceError::Disconnected(stderr.trim().to_string()));
    }
    if !output.status.success() {
        return Some(DeviceError::CommandFailed(format!(
            "adb exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    None
}

/// Parse `adb devices -l`, skipping the header line.
pub(crate) fn parse_devices(stdout: &str) -> Vec<ListedDevice> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device_id = parts.next()?.to_string();
            let status = parts.next()?.to_string();
            let rest: Vec<&str> = parts.collect();

            let connection_type = if device_id.contains(':') {
                ConnectionType::Remote
            } else if rest.iter().any(|p| p.starts_with("usb:")) {
                ConnectionType::Usb
            } else {
                ConnectionType::Wifi
            };
            let model = rest
                .iter()
                .find_map(|p| p.strip_prefix("model:"))
                .map(str::to_string);

            Some(ListedDevice {
                device_id,
                status,
                connection_type,
                model,
            })
        })
        .collect()
}

/// Parse `wm size`, preferring an override size when one is set.
pub(crate) fn parse_wm_size(stdout: &str) -> Option<(u32, u32)> {
    let pick = |prefix: &str| {
        stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix(prefix))
            .and_then(|size| {
                let (w, h) = size.trim().split_once('x')?;
                Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
            })
    };
    pick("Override size:").or_else(|| pick("Physical size:"))
}
