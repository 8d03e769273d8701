//! Input injection: argument builders for `adb shell input` and the ADB
//! keyboard broadcasts used for text entry.

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::debug;

use crate::device::DeviceError;

use super::connection::AdbConnection;

/// IME id of the ADB keyboard app.
pub const ADB_KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// Long presses are swipes that stay in place for this long.
pub const LONG_PRESS_DURATION_MS: u64 = 1000;

/// Android keycode for a named key. Numeric codes and `KEYCODE_*` names pass through.
pub fn key_code(name: &str) -> Option<String> {
    let name = name.trim();
    let code = match name.to_lowercase().as_str() {
        "back" => "4",
        "home" => "3",
        "menu" => "82",
        "enter" => "66",
        "delete" | "backspace" => "67",
        "power" => "26",
        "volume_up" => "24",
        "volume_down" => "25",
        _ if name.starts_with("KEYCODE_") => return Some(name.to_string()),
        _ if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) => {
            return Some(name.to_string())
        }
        _ => return None,
    };
    Some(code.to_string())
}

pub fn tap_args(x: i32, y: i32) -> Vec<String> {
    vec!["input".into(), "tap".into(), x.to_string(), y.to_string()]
}

pub fn swipe_args(from: (i32, i32), to: (i32, i32), duration_ms: u64) -> Vec<String> {
    vec![
        "input".into(),
        "swipe".into(),
        from.0.to_string(),
        from.1.to_string(),
        to.0.to_string(),
        to.1.to_string(),
        duration_ms.to_string(),
    ]
}

pub fn keyevent_args(code: &str) -> Vec<String> {
    vec!["input".into(), "keyevent".into(), code.to_string()]
}

/// Text goes through the ADB keyboard as base64 so any script survives the shell.
pub fn text_broadcast_args(text: &str) -> Vec<String> {
    vec![
        "am".into(),
        "broadcast".into(),
        "-a".into(),
        "ADB_INPUT_B64".into(),
        "--es".into(),
        "msg".into(),
        STANDARD.encode(text.as_bytes()),
    ]
}

pub fn launch_args(package: &str) -> Vec<String> {
    vec![
        "monkey".into(),
        "-p".into(),
        package.to_string(),
        "-c".into(),
        "android.intent.category.LAUNCHER".into(),
        "1".into(),
    ]
}

pub(crate) async fn shell_owned(conn: &AdbConnection, args: Vec<String>) -> Result<String, DeviceError> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    conn.shell(&args).await
}

/// Switch to the ADB keyboard. Returns the IME that was active before.
pub async fn enable_adb_keyboard(conn: &AdbConnection) -> Result<String, DeviceError> {
    let current = conn
        .shell(&["settings", "get", "secure", "default_input_method"])
        .await?;
    if !current.contains(ADB_KEYBOARD_IME) {
        debug!(previous = %current, "Switching to ADB keyboard");
        conn.shell(&["ime", "set", ADB_KEYBOARD_IME]).await?;
    }
    Ok(current)
}

pub async fn restore_keyboard(conn: &AdbConnection, ime: &str) -> Result<(), DeviceError> {
    if ime.is_empty() || ime.contains(ADB_KEYBOARD_IME) || ime == "null" {
        return Ok(());
    }
    conn.shell(&["ime", "set", ime]).await.map(|_| ())
}

/// Clear the focused field, then type `text`.
pub async fn type_text(conn: &AdbConnection, text: &str) -> Result<(), DeviceError> {
    conn.shell(&["am", "broadcast", "-a", "ADB_CLEAR_TEXT"]).await?;
    shell_owned(conn, text_broadcast_args(text)).await?;
    Ok(())
}
