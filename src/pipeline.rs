//! End-to-end wiring: cameras -> streams -> detection -> throttle -> notifications.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{validate_cameras, CameraConfig, Connection, WatchpostConfig};
use crate::detect::Detector;
use crate::dispatch::{DetectionDispatcher, DetectionStats, WorkerContext};
use crate::dvr::{HandlerFactory, ProtocolDetector};
use crate::error::WatchError;
use crate::ingest::SourceFactory;
use crate::notify::{Channel, NotificationDispatcher, NotificationStats};
use crate::stream::{StreamHandle, StreamManager, StreamState, StreamStats};
use crate::throttle::AlertThrottle;

/// Point-in-time view of every counter in the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineStats {
    pub uptime: Duration,
    pub streams: Vec<StreamStats>,
    pub detection: DetectionStats,
    pub notifications: NotificationStats,
}

impl PipelineStats {
    pub fn frames_captured(&self) -> u64 {
        self.streams.iter().map(|s| s.frames_captured).sum()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.streams.iter().map(|s| s.frames_dropped).sum()
    }

    pub fn streams_in(&self, state: StreamState) -> usize {
        self.streams.iter().filter(|s| s.state == state).count()
    }

    pub fn health_line(&self) -> String {
        format!(
            "health: up {}s, streams {}/{} streaming ({} failed), frames {} captured {} dropped, \
             tasks {} processed, motion {}, human {}, alerts {} sent {} throttled, \
             notifications {} delivered {} failed",
            self.uptime.as_secs(),
            self.streams_in(StreamState::Streaming),
            self.streams.len(),
            self.streams_in(StreamState::Failed),
            self.frames_captured(),
            self.frames_dropped(),
            self.detection.tasks_processed,
            self.detection.motion_events,
            self.detection.human_events,
            self.detection.alerts_sent,
            self.detection.alerts_throttled,
            self.notifications.delivered,
            self.notifications.failed,
        )
    }
}

pub struct Pipeline {
    /// Cameras as configured, before DVR resolution.
    cameras: Vec<CameraConfig>,
    protocol: ProtocolDetector,
    streams: StreamManager,
    detection: Option<DetectionDispatcher>,
    notifications: Option<NotificationDispatcher>,
    throttle: Arc<AlertThrottle>,
    started_at: Instant,
    stopped: bool,
}

impl Pipeline {
    /// Resolve DVR cameras, then start notifications, streams and detection in that order.
    ///
    /// A camera whose DVR protocol cannot be detected is registered as `Failed`;
    /// the rest of the pipeline still starts.
    pub fn start(
        config: &WatchpostConfig,
        cameras: Vec<CameraConfig>,
        source_factory: Arc<dyn SourceFactory>,
        detector: Arc<dyn Detector>,
        channels: Vec<Box<dyn Channel>>,
        handler_factory: Arc<dyn HandlerFactory>,
    ) -> Result<Self, WatchError> {
        validate_cameras(&cameras).map_err(|e| WatchError::Config(format!("{e:#}")))?;
        detector.warm_up().map_err(|e| {
            WatchError::Config(format!("detector '{}' failed to warm up: {e:#}", detector.name()))
        })?;

        let notifications = NotificationDispatcher::start(channels)?;
        let throttle = Arc::new(AlertThrottle::new(config.alerts.cooldown));
        let protocol = ProtocolDetector::new(handler_factory);
        let streams = StreamManager::new(source_factory, config.stream.clone());

        let mut pipeline = Self {
            cameras,
            protocol,
            streams,
            detection: None,
            notifications: None,
            throttle: throttle.clone(),
            started_at: Instant::now(),
            stopped: false,
        };

        for camera in pipeline.cameras.clone() {
            match pipeline.resolve(&camera) {
                Ok(resolved) => {
                    pipeline.streams.start(resolved)?;
                }
                Err(err) => {
                    pipeline.streams.start_unavailable(camera, &err);
                }
            }
        }

        let context = WorkerContext {
            detector,
            throttle,
            notifier: notifications.sender(),
            confidence_threshold: config.detection.confidence_threshold,
            alert_on_motion: config.detection.alert_on_motion,
        };
        pipeline.notifications = Some(notifications);
        pipeline.detection = Some(DetectionDispatcher::start(
            &config.detection,
            pipeline.streams.handles(),
            context,
        )?);

        log::info!(
            "pipeline started: {} cameras, {} detection workers",
            pipeline.cameras.len(),
            pipeline.detection.as_ref().map_or(0, |d| d.worker_count())
        );
        Ok(pipeline)
    }

    pub fn handles(&self) -> Vec<StreamHandle> {
        self.streams.handles()
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn throttle(&self) -> &AlertThrottle {
        &self.throttle
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.notifications
            .as_ref()
            .map(|n| n.channel_names().to_vec())
            .unwrap_or_default()
    }

    /// Re-launch a stream that is `Failed` or `Stopped`. DVR cameras are re-probed first.
    pub fn restart(&self, name: &str) -> Result<StreamHandle, WatchError> {
        let camera = self
            .cameras
            .iter()
            .find(|camera| camera.name == name)
            .ok_or_else(|| WatchError::Config(format!("no camera named '{name}'")))?;
        let resolved = self.resolve(camera)?;
        self.streams.restart_with(name, Some(resolved))
    }

    /// Restart every camera whose stream is `Failed`. Returns how many were restarted.
    pub fn restart_failed(&self) -> usize {
        let failed: Vec<String> = self
            .streams
            .handles()
            .iter()
            .filter(|handle| handle.state() == StreamState::Failed)
            .map(|handle| handle.name().to_string())
            .collect();
        let mut restarted = 0;
        for name in failed {
            match self.restart(&name) {
                Ok(_) => {
                    log::info!("stream '{name}': restarted after failure");
                    restarted += 1;
                }
                Err(err) => log::warn!("stream '{name}': restart failed: {err}"),
            }
        }
        restarted
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            uptime: self.started_at.elapsed(),
            streams: self.streams.handles().iter().map(StreamHandle::stats).collect(),
            detection: self
                .detection
                .as_ref()
                .map(DetectionDispatcher::stats)
                .unwrap_or_default(),
            notifications: self
                .notifications
                .as_ref()
                .map(NotificationDispatcher::stats)
                .unwrap_or_default(),
        }
    }

    /// Stop streams, join the detection pool, then drain pending notifications.
    pub fn stop(mut self) -> PipelineStats {
        let (detection, notifications) = self.shutdown();
        let mut stats = self.stats();
        stats.detection = detection.unwrap_or(stats.detection);
        stats.notifications = notifications.unwrap_or(stats.notifications);
        stats
    }

    /// DVR cameras become plain link cameras once a handler is selected.
    fn resolve(&self, camera: &CameraConfig) -> Result<CameraConfig, WatchError> {
        let Connection::Dvr(dvr) = &camera.connection else {
            return Ok(camera.clone());
        };
        let handler = self.protocol.resolve(&camera.name, dvr)?;
        Ok(CameraConfig {
            connection: Connection::Link(handler.stream_link()),
            settle: handler.fetch_delay(),
            ..camera.clone()
        })
    }

    fn shutdown(&mut self) -> (Option<DetectionStats>, Option<NotificationStats>) {
        if self.stopped {
            return (None, None);
        }
        self.stopped = true;
        let stopped = self.streams.stop_all();
        let total = self.streams.handles().len();
        if stopped < total {
            log::warn!("{} of {} streams did not stop in time", total - stopped, total);
        }
        let detection = self.detection.take().map(|detection| {
            let stats = detection.stop();
            log::info!(
                "detection stopped: {} tasks processed, {} alerts sent",
                stats.tasks_processed,
                stats.alerts_sent
            );
            stats
        });
        let notifications = self.notifications.take().map(|notifications| {
            let stats = notifications.stop();
            log::info!(
                "notifications drained: {} delivered, {} failed",
                stats.delivered,
                stats.failed
            );
            stats
        });
        (detection, notifications)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
