//! GStreamer-backed frame source for network and local capture links.
//!
//! Pipeline shape: `<src> ! decodebin ! videoconvert ! [videoscale] ! RGB appsink`.
//! The appsink keeps one buffer and drops the rest, so a slow reader always
//! sees the most recent decoded frame.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::FrameSource;
use crate::config::{CameraConfig, CameraLink};
use crate::frame::CapturedImage;

/// Upper bound on one `read_frame` pull. A stall past this is a lost stream.
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GstreamerSource {
    camera: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(camera: &CameraConfig, link: &CameraLink) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = pipeline_description(link, camera.width, camera.height)?;
        let pipeline = gstreamer::parse::launch(&description)
            .with_context(|| format!("build pipeline for camera '{}'", camera.name))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            camera: camera.name.clone(),
            pipeline,
            appsink,
            frame_count: 0,
            connected_at: None,
            last_error: None,
        })
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("stream reached end".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameSource for GstreamerSource {
    fn open(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start pipeline for camera '{}'", self.camera))?;
        self.connected_at = Some(Instant::now());
        log::info!("GstreamerSource: camera '{}' playing", self.camera);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CapturedImage> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow!("camera '{}' stalled", self.camera))?;

        let image = sample_to_image(&sample)?;
        self.frame_count += 1;
        Ok(image)
    }

    fn close(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!(
                "GstreamerSource: camera '{}' did not stop cleanly: {}",
                self.camera,
                err
            );
        }
        if let Some(connected_at) = self.connected_at.take() {
            log::debug!(
                "GstreamerSource: camera '{}' closed after {} frames in {:?}",
                self.camera,
                self.frame_count,
                connected_at.elapsed()
            );
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// Double-quoted property value for a gst-launch description.
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn pipeline_description(link: &CameraLink, width: Option<u32>, height: Option<u32>) -> Result<String> {
    let src = match link {
        CameraLink::Index(index) => format!("v4l2src device=/dev/video{index}"),
        CameraLink::Uri(uri) => {
            let parsed = url::Url::parse(uri).with_context(|| format!("invalid camera link {uri}"))?;
            match parsed.scheme() {
                "rtsp" | "rtsps" => format!("rtspsrc location={} latency=0", quoted(uri)),
                "http" | "https" => format!("souphttpsrc location={} is-live=true", quoted(uri)),
                other => return Err(anyhow!("unsupported camera link scheme {other}")),
            }
        }
    };
    let scale = match (width, height) {
        (Some(w), Some(h)) => format!(" ! videoscale ! video/x-raw,width={w},height={h}"),
        _ => String::new(),
    };
    Ok(format!(
        "{src} ! decodebin ! videoconvert{scale} ! video/x-raw,format=RGB ! \
         appsink name=appsink sync=false max-buffers=1 drop=true"
    ))
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<CapturedImage> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(CapturedImage::new(width, height, data.to_vec()));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("buffer row is out of bounds")?,
        );
    }
    Ok(CapturedImage::new(width, height, pixels))
}
