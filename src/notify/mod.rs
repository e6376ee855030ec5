//! Alert delivery.
//!
//! `NotificationDispatcher` owns one worker thread and one FIFO queue. Every
//! task is handed to every channel, one task at a time, in submission order.
//! A channel that errors or panics is logged and skipped for that task only.
//!
//! Shutdown closes the intake gate and enqueues a sentinel under the same
//! lock, so the sentinel is always the last message: everything accepted
//! before `stop` is delivered, nothing is accepted after it.

mod log_channel;
#[cfg(feature = "channel-mqtt")]
mod mqtt;
mod telegram;
mod webhook;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, Sender};
use image::codecs::jpeg::JpegEncoder;

use crate::config::{CameraConfig, ChannelSettings};
use crate::dispatch::{DetectionEvent, DetectionKind};
use crate::error::{panic_message, WatchError};
use crate::frame::Frame;

pub use log_channel::LogChannel;
#[cfg(feature = "channel-mqtt")]
pub use mqtt::MqttChannel;
pub use telegram::TelegramChannel;
pub use webhook::WebhookChannel;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const SNAPSHOT_CONTENT_TYPE: &str = "image/jpeg";
const SNAPSHOT_QUALITY: u8 = 85;

// ----------------------------------------------------------------------------
// NotificationTask
// ----------------------------------------------------------------------------

/// One alert, destined for every configured channel.
#[derive(Clone, Debug)]
pub struct NotificationTask {
    alert_id: u64,
    timestamp: DateTime<Local>,
    kind: DetectionKind,
    camera: Arc<CameraConfig>,
    frame: Frame,
}

impl NotificationTask {
    pub fn new(
        timestamp: DateTime<Local>,
        kind: DetectionKind,
        camera: Arc<CameraConfig>,
        frame: Frame,
    ) -> Self {
        Self {
            alert_id: rand::random(),
            timestamp,
            kind,
            camera,
            frame,
        }
    }

    pub fn from_event(event: &DetectionEvent) -> Self {
        Self::new(
            event.timestamp,
            event.kind,
            event.camera.clone(),
            event.frame.clone(),
        )
    }

    /// Random identifier so downstream consumers can de-duplicate.
    pub fn alert_id(&self) -> u64 {
        self.alert_id
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn timestamp_text(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn kind(&self) -> DetectionKind {
        self.kind
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// Snapshot of the frame that triggered the alert.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn title(&self) -> &'static str {
        match self.kind {
            DetectionKind::Human => "Trespassing Alert",
            DetectionKind::Motion => "Motion Alert",
        }
    }

    pub fn body(&self) -> String {
        let what = match self.kind {
            DetectionKind::Human => "A human trespassing event",
            DetectionKind::Motion => "A motion event",
        };
        format!(
            "{what} was detected at {}.\n\nCamera Info:\nName: {}\nDescription: {}\nLink: {}",
            self.timestamp_text(),
            self.camera.name,
            self.camera.description,
            self.camera.link_display()
        )
    }

    /// Flat JSON rendering shared by the structured channels.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "alert_id": format!("{:016x}", self.alert_id),
            "title": self.title(),
            "body": self.body(),
            "kind": self.kind.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
            "camera": {
                "name": self.camera.name,
                "description": self.camera.description,
                "link": self.camera.link_display(),
            },
            "frame": {
                "seq": self.frame.seq(),
                "width": self.frame.width(),
                "height": self.frame.height(),
            },
        })
    }

    /// The alert frame as JPEG.
    pub fn snapshot_jpeg(&self) -> Result<Vec<u8>> {
        let image = self.frame.to_rgb_image().ok_or_else(|| {
            anyhow!(
                "frame {} of {} is not packed RGB",
                self.frame.seq(),
                self.frame.camera()
            )
        })?;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, SNAPSHOT_QUALITY).encode_image(&image)?;
        Ok(jpeg)
    }

    /// `to_json` plus the base64 JPEG snapshot under `snapshot`.
    /// `snapshot` is null when the frame cannot be encoded.
    pub fn to_json_with_snapshot(&self) -> serde_json::Value {
        let mut payload = self.to_json();
        payload["snapshot"] = match self.snapshot_jpeg() {
            Ok(jpeg) => serde_json::json!({
                "content_type": SNAPSHOT_CONTENT_TYPE,
                "data": BASE64.encode(jpeg),
            }),
            Err(err) => {
                log::warn!("alert {:016x}: no snapshot: {:#}", self.alert_id, err);
                serde_json::Value::Null
            }
        };
        payload
    }
}

// ----------------------------------------------------------------------------
// Channel capability
// ----------------------------------------------------------------------------

/// A notification sink. Called only from the dispatcher thread.
///
/// Credentials are supplied when the channel is constructed; `init` checks
/// them (and may connect) before the first send.
pub trait Channel: Send {
    fn name(&self) -> &str;

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Best-effort delivery. An error is logged by the dispatcher and not retried.
    fn send(&mut self, task: &NotificationTask) -> Result<()>;

    fn close(&mut self) {}
}

/// Build the channels named in configuration. Channels that cannot be built
/// in this binary are logged and left out.
pub fn build_channels(settings: &[ChannelSettings]) -> Vec<Box<dyn Channel>> {
    let mut channels: Vec<Box<dyn Channel>> = Vec::with_capacity(settings.len());
    for setting in settings {
        match setting {
            ChannelSettings::Log => channels.push(Box::new(LogChannel::new())),
            ChannelSettings::Webhook { url, timeout_ms } => channels.push(Box::new(
                WebhookChannel::new(url.clone(), ChannelSettings::webhook_timeout(*timeout_ms)),
            )),
            ChannelSettings::Telegram { token, chat_id } => channels.push(Box::new(
                TelegramChannel::new(token.clone(), chat_id.clone()),
            )),
            #[cfg(feature = "channel-mqtt")]
            ChannelSettings::Mqtt {
                broker,
                port,
                topic,
                client_id,
            } => channels.push(Box::new(MqttChannel::new(
                broker.clone(),
                ChannelSettings::mqtt_port(*port),
                ChannelSettings::mqtt_topic(topic.as_deref()).to_string(),
                client_id.clone(),
            ))),
            #[cfg(not(feature = "channel-mqtt"))]
            ChannelSettings::Mqtt { broker, .. } => {
                log::error!(
                    "mqtt channel for {broker} requires the channel-mqtt feature; skipping"
                );
            }
        }
    }
    channels
}

// ----------------------------------------------------------------------------
// NotificationDispatcher
// ----------------------------------------------------------------------------

enum Message {
    Task(Box<NotificationTask>),
    Shutdown,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of dispatcher counters. `delivered`/`failed` count channel sends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotificationStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub completed: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Cloneable producer side of the notification queue.
#[derive(Clone)]
pub struct NotificationSender {
    tx: Sender<Message>,
    accepting: Arc<RwLock<bool>>,
    counters: Arc<Counters>,
}

impl NotificationSender {
    /// Queue a task. Fails once shutdown has begun.
    pub fn enqueue(&self, task: NotificationTask) -> Result<(), WatchError> {
        let accepting = self
            .accepting
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*accepting {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(WatchError::Shutdown("notification dispatcher"));
        }
        self.tx
            .send(Message::Task(Box::new(task)))
            .map_err(|_| WatchError::Shutdown("notification dispatcher"))?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct NotificationDispatcher {
    sender: NotificationSender,
    worker: Option<JoinHandle<()>>,
    channel_names: Vec<String>,
}

impl NotificationDispatcher {
    /// Initialise `channels` and start the delivery thread.
    ///
    /// A channel whose `init` fails is logged and excluded; the rest still run.
    pub fn start(channels: Vec<Box<dyn Channel>>) -> Result<Self, WatchError> {
        let mut ready: Vec<Box<dyn Channel>> = Vec::with_capacity(channels.len());
        for mut channel in channels {
            match channel.init() {
                Ok(()) => {
                    log::info!("notification channel '{}' ready", channel.name());
                    ready.push(channel);
                }
                Err(err) => {
                    log::error!(
                        "notification channel '{}' disabled: {:#}",
                        channel.name(),
                        err
                    );
                }
            }
        }
        if ready.is_empty() {
            log::warn!("no notification channels are active; alerts will only be counted");
        }
        let channel_names = ready.iter().map(|c| c.name().to_string()).collect();

        let (tx, rx) = channel::unbounded();
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();
        let worker = std::thread::Builder::new()
            .name("notify".to_string())
            .spawn(move || run_worker(rx, ready, &worker_counters))?;

        Ok(Self {
            sender: NotificationSender {
                tx,
                accepting: Arc::new(RwLock::new(true)),
                counters,
            },
            worker: Some(worker),
            channel_names,
        })
    }

    pub fn sender(&self) -> NotificationSender {
        self.sender.clone()
    }

    pub fn enqueue(&self, task: NotificationTask) -> Result<(), WatchError> {
        self.sender.enqueue(task)
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn stats(&self) -> NotificationStats {
        let c = &self.sender.counters;
        NotificationStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting, drain everything already queued, then join the worker.
    pub fn stop(mut self) -> NotificationStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        {
            let mut accepting = self
                .sender
                .accepting
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *accepting {
                *accepting = false;
                // Sent under the write lock: no task can land behind the sentinel.
                let _ = self.sender.tx.send(Message::Shutdown);
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("notification worker panicked");
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(rx: Receiver<Message>, mut channels: Vec<Box<dyn Channel>>, counters: &Counters) {
    for message in rx.iter() {
        match message {
            Message::Task(task) => {
                deliver(&mut channels, &task, counters);
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Message::Shutdown => break,
        }
    }
    for channel in &mut channels {
        channel.close();
    }
    log::info!("notification dispatcher drained and stopped");
}

fn deliver(channels: &mut [Box<dyn Channel>], task: &NotificationTask, counters: &Counters) {
    for channel in channels.iter_mut() {
        let outcome = catch_unwind(AssertUnwindSafe(|| channel.send(task)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        match failure {
            None => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "alert {:016x} delivered via '{}'",
                    task.alert_id(),
                    channel.name()
                );
            }
            Some(reason) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                let err = WatchError::ChannelSendFailed {
                    channel: channel.name().to_string(),
                    reason,
                };
                log::warn!("alert {:016x}: {}", task.alert_id(), err);
            }
        }
    }
}
