//! Synthetic frame source for `stub://` links.
//!
//! Renders a static gradient background. Every `intruder_every` frames a tall
//! bright block walks across the scene for `intruder_frames` frames, so a
//! difference detector sees both motion and a person-sized changed area.
//!
//! Link parameters (query string): `fps` (default 10), `intruder_every`
//! (default 50, 0 disables), `intruder_frames` (default 12).

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::FrameSource;
use crate::config::{CameraConfig, MAX_DIMENSION};
use crate::frame::{rgb_len, CapturedImage};

pub const STUB_SCHEME: &str = "stub://";

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_FPS: u32 = 10;
const DEFAULT_INTRUDER_EVERY: u64 = 50;
const DEFAULT_INTRUDER_FRAMES: u64 = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub intruder_every: u64,
    pub intruder_frames: u64,
}

impl SyntheticConfig {
    pub fn parse(link: &str, width: Option<u32>, height: Option<u32>) -> Result<Self> {
        let parsed = url::Url::parse(link).with_context(|| format!("invalid stub link {link}"))?;
        if parsed.scheme() != "stub" {
            return Err(anyhow!("not a stub link: {link}"));
        }
        let width = width.unwrap_or(DEFAULT_WIDTH).max(1);
        let height = height.unwrap_or(DEFAULT_HEIGHT).max(1);
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(anyhow!(
                "stub frame {width}x{height} exceeds {MAX_DIMENSION}x{MAX_DIMENSION}"
            ));
        }
        let mut cfg = Self {
            name: parsed.host_str().unwrap_or("stub").to_string(),
            width,
            height,
            fps: DEFAULT_FPS,
            intruder_every: DEFAULT_INTRUDER_EVERY,
            intruder_frames: DEFAULT_INTRUDER_FRAMES,
        };
        for (key, value) in parsed.query_pairs() {
            let bad = || anyhow!("stub link parameter {key}={value} is not a number");
            match key.as_ref() {
                "fps" => cfg.fps = value.parse().map_err(|_| bad())?,
                "intruder_every" => cfg.intruder_every = value.parse().map_err(|_| bad())?,
                "intruder_frames" => cfg.intruder_frames = value.parse().map_err(|_| bad())?,
                other => log::debug!("stub link {link}: ignoring parameter {other}"),
            }
        }
        Ok(cfg)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    opened: bool,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            opened: false,
            next_due: None,
        }
    }

    pub fn from_camera(camera: &CameraConfig, link: &str) -> Result<Self> {
        Ok(Self::new(SyntheticConfig::parse(
            link,
            camera.width,
            camera.height,
        )?))
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.fps > 0).then(|| Duration::from_secs(1) / self.config.fps)
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval() else {
            return;
        };
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + interval);
    }

    /// Column of the intruder's left edge, if one is in the scene this frame.
    fn intruder_x(&self) -> Option<u32> {
        let every = self.config.intruder_every;
        if every == 0 {
            return None;
        }
        let phase = self.frame_count % every;
        if phase >= self.config.intruder_frames.min(every) {
            return None;
        }
        let travel = self.config.width.saturating_sub(self.intruder_width()).max(1) as u64;
        let step = travel / self.config.intruder_frames.max(1);
        Some((phase * step.max(1)).min(travel) as u32)
    }

    fn intruder_width(&self) -> u32 {
        (self.config.width / 8).max(1)
    }

    fn render(&self) -> Result<Vec<u8>> {
        let len = rgb_len(self.config.width, self.config.height).ok_or_else(|| {
            anyhow!(
                "stub frame {}x{} is too large",
                self.config.width,
                self.config.height
            )
        })?;
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![0u8; len];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let (x, y) = (i % w, i / w);
            px[0] = (x * 255 / w) as u8 / 2;
            px[1] = (y * 255 / h) as u8 / 2;
            px[2] = 64;
        }

        if let Some(left) = self.intruder_x() {
            // Roughly person-shaped: tall and narrow, lower two thirds of the frame.
            let left = left as usize;
            let right = (left + self.intruder_width() as usize).min(w);
            for row in pixels.chunks_exact_mut(w * 3).skip(h / 3) {
                row[left * 3..right * 3].fill(240);
            }
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!(
            "SyntheticSource: opened stub://{} ({}x{} @ {} fps)",
            self.config.name,
            self.config.width,
            self.config.height,
            self.config.fps
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CapturedImage> {
        if !self.opened {
            return Err(anyhow!("stub://{} is not open", self.config.name));
        }
        self.pace();
        let pixels = self.render()?;
        self.frame_count += 1;
        Ok(CapturedImage::new(
            self.config.width,
            self.config.height,
            pixels,
        ))
    }

    fn close(&mut self) {
        self.opened = false;
    }
}
