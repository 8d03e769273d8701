//! Per-step artifacts: screenshots, raw model responses, action records and
//! the final result, keyed by task id and step index.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::actions::Action;
use crate::agent::{ActionRecord, RunResult};
use crate::perception::Frame;

const MARKER_SIZE: u32 = 24;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Failed to serialize artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receiver of run artifacts. Failures are logged by the caller and never
/// affect the run.
pub trait ArtifactSink: Send + Sync {
    /// Save a screenshot, marking the points `action` touches.
    fn save_screenshot(
        &self,
        task_id: &str,
        step: u32,
        label: &str,
        frame: &Frame,
        action: Option<&Action>,
    ) -> Result<(), ArtifactError>;

    fn save_response(&self, task_id: &str, step: u32, role: &str, text: &str)
        -> Result<(), ArtifactError>;

    fn save_action(&self, task_id: &str, record: &ActionRecord) -> Result<(), ArtifactError>;

    fn save_result(&self, result: &RunResult) -> Result<(), ArtifactError>;
}

/// Writes artifacts under `<root>/<task_id>/`.
#[derive(Debug, Clone)]
pub struct DirArtifactSink {
    root: PathBuf,
}

impl DirArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    fn ensure_task_dir(&self, task_id: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl ArtifactSink for DirArtifactSink {
    fn save_screenshot(
        &self,
        task_id: &str,
        step: u32,
        label: &str,
        frame: &Frame,
        action: Option<&Action>,
    ) -> Result<(), ArtifactError> {
        let dir = self.ensure_task_dir(task_id)?;
        let mut img = frame.image.to_rgb8();
        if let Some(action) = action {
            mark_action(&mut img, action);
        }
        img.save(dir.join(format!("step_{:03}_{}.png", step, label)))?;
        Ok(())
    }

    fn save_response(
        &self,
        task_id: &str,
        step: u32,
        role: &str,
        text: &str,
    ) -> Result<(), ArtifactError> {
        let dir = self.ensure_task_dir(task_id)?;
        fs::write(dir.join(format!("step_{:03}_{}.txt", step, role)), text)?;
        Ok(())
    }

    fn save_action(&self, task_id: &str, record: &ActionRecord) -> Result<(), ArtifactError> {
        let dir = self.ensure_task_dir(task_id)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("actions.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    fn save_result(&self, result: &RunResult) -> Result<(), ArtifactError> {
        let dir = self.ensure_task_dir(&result.task_id)?;
        fs::write(dir.join("result.json"), serde_json::to_string_pretty(result)?)?;
        Ok(())
    }
}

/// Red box with a yellow crosshair on each point; swipes get a connecting line.
fn mark_action(img: &mut RgbImage, action: &Action) {
    let points = action.points();
    if let [(x0, y0), (x1, y1)] = points.as_slice() {
        draw_line_segment_mut(
            img,
            (*x0 as f32, *y0 as f32),
            (*x1 as f32, *y1 as f32),
            Rgb([255u8, 255u8, 0u8]),
        );
    }
    for (x, y) in points {
        let half = MARKER_SIZE as i32 / 2;
        draw_hollow_rect_mut(
            img,
            Rect::at(x - half, y - half).of_size(MARKER_SIZE, MARKER_SIZE),
            Rgb([255u8, 50u8, 50u8]),
        );
        draw_filled_rect_mut(
            img,
            Rect::at(x - 1, y - half).of_size(2, MARKER_SIZE),
            Rgb([255u8, 255u8, 0u8]),
        );
        draw_filled_rect_mut(
            img,
            Rect::at(x - half, y - 1).of_size(MARKER_SIZE, 2),
            Rgb([255u8, 255u8, 0u8]),
        );
    }
}
