mod diff;

use anyhow::Result;

use crate::frame::Frame;

pub use diff::{DiffDetector, DiffDetectorConfig};

/// Detector capability, shared by every detection worker.
///
/// Implementations take `&self` and must be safe to call concurrently for
/// different cameras. They must treat the frame as read-only, must not keep
/// pixel data beyond per-camera reference state, and must not log it.
pub trait Detector: Send + Sync {
    /// Detector identifier for logs.
    fn name(&self) -> &'static str;

    /// Cheap first stage. Called for every frame the dispatcher samples.
    fn detect_motion(&self, frame: &Frame) -> Result<bool>;

    /// Expensive second stage. Only called after `detect_motion` returned true.
    fn detect_human(&self, frame: &Frame, confidence_threshold: f32) -> Result<bool>;

    /// Optional warm-up hook, run once before workers start.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
