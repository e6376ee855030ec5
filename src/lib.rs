//! Watchpost
//!
//! Multi-camera intrusion detection: one acquisition thread per camera feeds
//! a latest-wins frame bus, a worker pool runs a two-stage motion/human gate
//! over every bus, and confirmed detections pass a per-camera cooldown before
//! fan-out to notification channels.
//!
//! # Architecture
//!
//! ```text
//! FrameSource --> StreamHandle/FrameBus --> DetectionDispatcher --> AlertThrottle
//!                                                                        |
//!                          Channels <-- NotificationDispatcher <---------+
//! ```
//!
//! DVR-backed cameras are resolved to a concrete stream link first by the
//! `ProtocolDetector`, which probes a fixed chain of handler kinds.
//!
//! # Module Structure
//!
//! - `config`: daemon configuration and the camera list
//! - `frame`: frames and the bounded per-camera `FrameBus`
//! - `ingest`: frame sources (synthetic, GStreamer)
//! - `stream`: per-camera acquisition loops and their state machine
//! - `detect`: detector capability and the CPU `DiffDetector`
//! - `dispatch`: detection worker pool
//! - `throttle`: per-camera alert cooldown
//! - `notify`: notification queue and channels
//! - `dvr`: DVR protocol detection
//! - `mosaic`: grid view of every camera
//! - `pipeline`: start/stop of the whole chain

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod dvr;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod mosaic;
pub mod notify;
pub mod pipeline;
pub mod stream;
pub mod throttle;
mod timeout;

pub use config::{CameraConfig, CameraLink, ChannelSettings, Connection, WatchpostConfig};
pub use detect::{Detector, DiffDetector, DiffDetectorConfig};
pub use dispatch::{
    DetectionDispatcher, DetectionEvent, DetectionKind, DetectionStats, DetectionTask,
    WorkerContext,
};
pub use dvr::{DefaultHandlerFactory, DvrConfig, DvrHandler, HandlerFactory, HandlerKind, ProtocolDetector};
pub use error::WatchError;
pub use frame::{CapturedImage, Frame, FrameBus, FRAME_BUS_CAPACITY};
pub use ingest::{DefaultSourceFactory, FrameSource, SourceFactory, SyntheticSource};
pub use mosaic::{save_mosaic, Mosaic};
pub use notify::{
    build_channels, Channel, LogChannel, NotificationDispatcher, NotificationStats,
    NotificationTask, TelegramChannel, WebhookChannel,
};
pub use pipeline::{Pipeline, PipelineStats};
pub use stream::{StreamHandle, StreamManager, StreamState, StreamStats};
pub use throttle::AlertThrottle;
