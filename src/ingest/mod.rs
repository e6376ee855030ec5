//! Frame sources.
//!
//! - `stub://<name>` links: synthetic scene, always available (tests, demos)
//! - `rtsp://`, `http(s)://` and device-index links: GStreamer decode
//!   (feature: rtsp-gstreamer)
//!
//! A source is owned by exactly one acquisition loop. The loop asks the
//! `SourceFactory` for a fresh source on every (re)connection attempt and
//! drops the old one, so a source never has to support reopening.
//!
//! Sources MUST NOT log pixel content.

#[cfg(feature = "rtsp-gstreamer")]
pub mod gstreamer;
pub mod synthetic;

use std::time::Duration;

use anyhow::Result;

use crate::config::{CameraConfig, CameraLink, Connection};
use crate::error::WatchError;
use crate::frame::CapturedImage;
use crate::timeout::run_with_timeout;

#[cfg(feature = "rtsp-gstreamer")]
pub use self::gstreamer::GstreamerSource;
pub use synthetic::SyntheticSource;

/// One camera's decoder/transport.
pub trait FrameSource: Send {
    /// Connect and start decoding. Called once per source instance.
    fn open(&mut self) -> Result<()>;

    /// Block until the next frame is decoded. An error means the stream is lost.
    fn read_frame(&mut self) -> Result<CapturedImage>;

    /// Release transport resources. Must be safe to call more than once.
    fn close(&mut self);
}

/// Builds a fresh `FrameSource` for a camera.
pub trait SourceFactory: Send + Sync {
    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSource>>;
}

/// Dispatches on the camera link.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSource>> {
        let link = match &camera.connection {
            Connection::Link(link) => link,
            Connection::Dvr(_) => {
                return Err(WatchError::Config(format!(
                    "camera '{}' is DVR-backed and has not been resolved to a stream link",
                    camera.name
                ))
                .into())
            }
        };
        if let CameraLink::Uri(uri) = link {
            if uri.starts_with(synthetic::STUB_SCHEME) {
                return Ok(Box::new(SyntheticSource::from_camera(camera, uri)?));
            }
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Box::new(GstreamerSource::new(camera, link)?))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(WatchError::Config(format!(
                "link {} requires the rtsp-gstreamer feature",
                camera.link_display()
            ))
            .into())
        }
    }
}

/// Open `source` on a helper thread, bounded by `timeout`.
///
/// On success the opened source is handed back. On timeout the helper keeps
/// the source and drops it when the blocked open finally returns.
pub fn open_with_timeout(
    camera: &str,
    mut source: Box<dyn FrameSource>,
    timeout: Duration,
) -> Result<Box<dyn FrameSource>, WatchError> {
    let what = format!("open {camera}");
    let outcome = run_with_timeout(&what, timeout, move || match source.open() {
        Ok(()) => Ok(source),
        Err(err) => {
            source.close();
            Err(err)
        }
    });
    match outcome {
        Ok(Ok(source)) => Ok(source),
        Ok(Err(err)) => Err(WatchError::ConnectFailed {
            camera: camera.to_string(),
            reason: format!("{err:#}"),
        }),
        Err(err) => Err(WatchError::ConnectFailed {
            camera: camera.to_string(),
            reason: err.to_string(),
        }),
    }
}
