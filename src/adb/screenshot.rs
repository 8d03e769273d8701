//! Screen capture through `adb exec-out screencap -p`.

use image::{DynamicImage, RgbImage};
use tracing::warn;

use crate::device::{DeviceError, Screenshot};

use super::connection::AdbConnection;

const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Size of the blank frame when the screen size is unknown.
pub const FALLBACK_SIZE: (u32, u32) = (1080, 2400);

pub async fn capture(conn: &AdbConnection, fallback_size: (u32, u32)) -> Result<Screenshot, DeviceError> {
    let output = conn.run(&["exec-out", "screencap", "-p"]).await?;
    decode_screencap(&output.stdout, &String::from_utf8_lossy(&output.stderr), fallback_size)
}

/// Turn raw screencap output into a screenshot.
///
/// A refused capture (secure window) yields a black frame marked sensitive so
/// the run can go on; garbage output is a capture failure.
pub(crate) fn decode_screencap(
    stdout: &[u8],
    stderr: &str,
    fallback_size: (u32, u32),
) -> Result<Screenshot, DeviceError> {
    if stderr.contains("Status: -1") || stderr.to_lowercase().contains("secure") {
        warn!("Screen capture refused, substituting a blank frame: {}", stderr.trim());
        return Ok(blank(fallback_size));
    }
    if stdout.len() < PNG_MAGIC.len() || &stdout[..PNG_MAGIC.len()] != PNG_MAGIC {
        return Err(DeviceError::CaptureFailed(format!(
            "screencap returned {} bytes without a PNG header",
            stdout.len()
        )));
    }
    let image = image::load_from_memory(stdout)
        .map_err(|e| DeviceError::CaptureFailed(format!("cannot decode screencap: {}", e)))?;
    Ok(Screenshot::new(image))
}

fn blank((width, height): (u32, u32)) -> Screenshot {
    Screenshot {
        image: DynamicImage::ImageRgb8(RgbImage::new(width, height)),
        is_sensitive: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_decodes_png() {
        let shot = decode_screencap(&png(20, 40), "", FALLBACK_SIZE).unwrap();
        assert_eq!((shot.width(), shot.height()), (20, 40));
        assert!(!shot.is_sensitive);
    }

    #[test]
    fn test_secure_screen_falls_back_to_blank() {
        let shot = decode_screencap(&[], "Status: -1\n", (100, 200)).unwrap();
        assert!(shot.is_sensitive);
        assert_eq!((shot.width(), shot.height()), (100, 200));
    }

    #[test]
    fn test_rejects_non_png() {
        let err = decode_screencap(b"not an image at all", "", FALLBACK_SIZE).unwrap_err();
        assert!(matches!(err, DeviceError::CaptureFailed(_)));
    }
}
