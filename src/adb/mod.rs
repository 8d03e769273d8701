//! ADB transport: the `adb` CLI wrapper, input injection, screen capture and
//! the [`AdbDevice`] adapter built from them.

mod connection;
mod device;
pub mod input;
mod screenshot;

pub use connection::{AdbConnection, ConnectionType, ListedDevice};
pub use device::AdbDevice;
pub use screenshot::FALLBACK_SIZE;
