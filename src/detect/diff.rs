use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use super::Detector;
use crate::frame::Frame;

/// Tuning for the frame-difference detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffDetectorConfig {
    /// Mean absolute luma change (0-255) that counts as motion.
    pub motion_threshold: f32,
    /// Per-pixel luma change that marks a pixel as changed.
    pub pixel_delta: u8,
    /// Changed bounding box area (fraction of frame) at which size confidence saturates.
    pub person_area: f32,
    /// Height/width ratio at which shape confidence saturates.
    pub person_aspect: f32,
}

impl Default for DiffDetectorConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 1.0,
            pixel_delta: 25,
            person_area: 0.05,
            person_aspect: 2.0,
        }
    }
}

/// CPU detector built on frame differencing.
///
/// Motion compares each frame with the previous frame of the same camera.
/// Human presence scores the changed region: tall, reasonably large regions
/// score high, frame-wide changes (lighting, camera shake) score low.
#[derive(Default)]
pub struct DiffDetector {
    config: DiffDetectorConfig,
    cameras: Mutex<HashMap<String, Arc<Mutex<CameraState>>>>,
}

#[derive(Default)]
struct CameraState {
    last_hash: Option<[u8; 32]>,
    last_luma: Option<Vec<u8>>,
    /// Analysis of the most recent frame, keyed by sequence number and capture
    /// instant. Sequence numbers start over when a stream is restarted.
    last: Option<(FrameKey, Analysis)>,
}

type FrameKey = (u64, Instant);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Analysis {
    mean_delta: f32,
    /// Changed bounding box as (min_x, min_y, max_x, max_y), inclusive.
    bbox: Option<(u32, u32, u32, u32)>,
}

impl DiffDetector {
    pub fn new(config: DiffDetectorConfig) -> Self {
        Self {
            config,
            cameras: Mutex::new(HashMap::new()),
        }
    }

    fn camera_state(&self, camera: &str) -> Arc<Mutex<CameraState>> {
        let mut cameras = self
            .cameras
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cameras.entry(camera.to_string()).or_default().clone()
    }

    fn analyze(&self, frame: &Frame) -> Result<Analysis> {
        if !frame.is_rgb() {
            return Err(anyhow!(
                "frame {} of camera '{}' is not {}x{} RGB8",
                frame.seq(),
                frame.camera(),
                frame.width(),
                frame.height()
            ));
        }
        let state = self.camera_state(frame.camera());
        let mut state = lock(&state);
        let key = (frame.seq(), frame.captured_at());
        if let Some((last_key, analysis)) = state.last {
            if last_key == key {
                return Ok(analysis);
            }
        }

        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let unchanged = state.last_hash == Some(current_hash);
        state.last_hash = Some(current_hash);

        let analysis = if unchanged {
            Analysis::default()
        } else {
            let luma = to_luma(frame.pixels());
            let analysis = match &state.last_luma {
                Some(prev) if prev.len() == luma.len() => {
                    compare(prev, &luma, frame.width(), self.config.pixel_delta)
                }
                // First frame, or the resolution changed: nothing to compare with.
                _ => Analysis::default(),
            };
            state.last_luma = Some(luma);
            analysis
        };
        state.last = Some((key, analysis));
        Ok(analysis)
    }

    fn human_confidence(&self, analysis: &Analysis, width: u32, height: u32) -> f32 {
        let Some((x0, y0, x1, y1)) = analysis.bbox else {
            return 0.0;
        };
        let box_w = (x1 - x0 + 1) as f32;
        let box_h = (y1 - y0 + 1) as f32;
        let frame_area = (width as f32) * (height as f32);
        if frame_area == 0.0 {
            return 0.0;
        }

        let aspect = box_h / box_w;
        let shape = ((aspect - 1.0) / (self.config.person_aspect - 1.0).max(f32::EPSILON))
            .clamp(0.0, 1.0);
        let size = ((box_w * box_h) / frame_area / self.config.person_area).clamp(0.0, 1.0);
        shape * size
    }
}

impl Detector for DiffDetector {
    fn name(&self) -> &'static str {
        "diff"
    }

    fn detect_motion(&self, frame: &Frame) -> Result<bool> {
        let analysis = self.analyze(frame)?;
        Ok(analysis.mean_delta >= self.config.motion_threshold)
    }

    fn detect_human(&self, frame: &Frame, confidence_threshold: f32) -> Result<bool> {
        let analysis = self.analyze(frame)?;
        let confidence = self.human_confidence(&analysis, frame.width(), frame.height());
        log::debug!(
            "diff detector: camera '{}' frame {} human confidence {:.2}",
            frame.camera(),
            frame.seq(),
            confidence
        );
        Ok(confidence >= confidence_threshold)
    }
}

fn lock(state: &Mutex<CameraState>) -> MutexGuard<'_, CameraState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8)
        .collect()
}

fn compare(prev: &[u8], curr: &[u8], width: u32, pixel_delta: u8) -> Analysis {
    let width = width.max(1) as usize;
    let mut total: u64 = 0;
    let mut bbox: Option<(u32, u32, u32, u32)> = None;
    for (i, (&a, &b)) in prev.iter().zip(curr).enumerate() {
        let delta = a.abs_diff(b);
        total += delta as u64;
        if delta >= pixel_delta {
            let (x, y) = ((i % width) as u32, (i / width) as u32);
            bbox = Some(match bbox {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    Analysis {
        mean_delta: total as f32 / curr.len().max(1) as f32,
        bbox,
    }
}
