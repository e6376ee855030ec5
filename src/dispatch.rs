//! Detection worker pool.
//!
//! One poller thread visits every stream's `FrameBus` in round robin and
//! forwards frames as `DetectionTask`s into a bounded queue. A fixed pool of
//! workers pulls tasks and runs the two-stage gate: `detect_motion` first,
//! `detect_human` only on motion. Confirmed detections go through the
//! `AlertThrottle` and, if let through, to the notification queue.
//!
//! When the task queue is full the poller drops the frame it holds; the bus
//! already keeps only the newest frames, so detection stays current.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::config::{CameraConfig, DetectionSettings};
use crate::detect::Detector;
use crate::error::{panic_message, WatchError};
use crate::frame::Frame;
use crate::notify::{NotificationSender, NotificationTask};
use crate::stream::StreamHandle;
use crate::throttle::AlertThrottle;

/// How long an idle worker waits before checking the queue again.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// A frame paired with the camera it came from.
#[derive(Clone, Debug)]
pub struct DetectionTask {
    pub frame: Frame,
    pub camera: Arc<CameraConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectionKind {
    Motion,
    Human,
}

impl DetectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionKind::Motion => "motion",
            DetectionKind::Human => "human",
        }
    }
}

/// Positive detection on one frame. Lives only between a worker and the throttle.
#[derive(Clone, Debug)]
pub struct DetectionEvent {
    pub camera: Arc<CameraConfig>,
    pub timestamp: DateTime<Local>,
    pub kind: DetectionKind,
    pub frame: Frame,
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    tasks_queued: AtomicU64,
    tasks_dropped: AtomicU64,
    tasks_processed: AtomicU64,
    detector_errors: AtomicU64,
    motion_events: AtomicU64,
    human_events: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_throttled: AtomicU64,
    alerts_rejected: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionStats {
    pub tasks_queued: u64,
    /// Frames dropped because the task queue was full.
    pub tasks_dropped: u64,
    pub tasks_processed: u64,
    pub detector_errors: u64,
    pub motion_events: u64,
    pub human_events: u64,
    pub alerts_sent: u64,
    pub alerts_throttled: u64,
    /// Alerts the notification queue refused (shutdown in progress).
    pub alerts_rejected: u64,
}

impl Counters {
    fn snapshot(&self) -> DetectionStats {
        DetectionStats {
            tasks_queued: self.tasks_queued.load(Ordering::Relaxed),
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            detector_errors: self.detector_errors.load(Ordering::Relaxed),
            motion_events: self.motion_events.load(Ordering::Relaxed),
            human_events: self.human_events.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_throttled: self.alerts_throttled.load(Ordering::Relaxed),
            alerts_rejected: self.alerts_rejected.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Worker logic
// ----------------------------------------------------------------------------

/// Everything a worker needs besides the task itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub detector: Arc<dyn Detector>,
    pub throttle: Arc<AlertThrottle>,
    pub notifier: NotificationSender,
    pub confidence_threshold: f32,
    pub alert_on_motion: bool,
}

/// Outcome of running the gate on one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Quiet,
    MotionOnly,
    Human,
    DetectorFailed,
}

impl WorkerContext {
    /// Run the two-stage gate on one task and route any resulting alert.
    fn process(&self, task: DetectionTask, counters: &Counters) -> TaskOutcome {
        let outcome = self.classify(&task);
        counters.tasks_processed.fetch_add(1, Ordering::Relaxed);
        let kind = match outcome {
            Ok(None) => return TaskOutcome::Quiet,
            Ok(Some(kind)) => kind,
            Err(err) => {
                counters.detector_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("{err}; frame {} dropped", task.frame.seq());
                return TaskOutcome::DetectorFailed;
            }
        };

        let name = task.camera.name.as_str();
        match kind {
            DetectionKind::Motion => {
                counters.motion_events.fetch_add(1, Ordering::Relaxed);
                log::info!("motion on camera '{name}' (frame {})", task.frame.seq());
                if !self.alert_on_motion {
                    return TaskOutcome::MotionOnly;
                }
            }
            DetectionKind::Human => {
                counters.motion_events.fetch_add(1, Ordering::Relaxed);
                counters.human_events.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "human detected on camera '{name}' (frame {})",
                    task.frame.seq()
                );
            }
        }

        let event = DetectionEvent {
            camera: task.camera,
            timestamp: Local::now(),
            kind,
            frame: task.frame,
        };
        self.route_alert(&event, counters);
        match kind {
            DetectionKind::Motion => TaskOutcome::MotionOnly,
            DetectionKind::Human => TaskOutcome::Human,
        }
    }

    /// `Ok(None)` no motion, `Ok(Some(Motion))` motion only, `Ok(Some(Human))` confirmed.
    fn classify(&self, task: &DetectionTask) -> Result<Option<DetectionKind>, WatchError> {
        let camera = task.camera.name.as_str();
        let frame = &task.frame;

        if !self.guarded(camera, || self.detector.detect_motion(frame))? {
            return Ok(None);
        }
        if self.guarded(camera, || {
            self.detector
                .detect_human(frame, self.confidence_threshold)
        })? {
            Ok(Some(DetectionKind::Human))
        } else {
            Ok(Some(DetectionKind::Motion))
        }
    }

    /// Run one detector call, turning both errors and panics into `WatchError::Detector`.
    fn guarded<F>(&self, camera: &str, call: F) -> Result<bool, WatchError>
    where
        F: FnOnce() -> anyhow::Result<bool>,
    {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(WatchError::Detector {
                camera: camera.to_string(),
                reason: format!("{err:#}"),
            }),
            Err(payload) => Err(WatchError::Detector {
                camera: camera.to_string(),
                reason: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }

    fn route_alert(&self, event: &DetectionEvent, counters: &Counters) {
        let name = event.camera.name.as_str();
        if !self.throttle.try_acquire(name, Instant::now()) {
            counters.alerts_throttled.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "alert for camera '{name}' suppressed (cooldown {:?})",
                self.throttle.cooldown()
            );
            return;
        }
        match self.notifier.enqueue(NotificationTask::from_event(event)) {
            Ok(()) => {
                counters.alerts_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                counters.alerts_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("alert for camera '{name}' not queued: {err}");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// DetectionDispatcher
// ----------------------------------------------------------------------------

pub struct DetectionDispatcher {
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl DetectionDispatcher {
    /// Start the poller and `settings.workers` detection workers over `streams`.
    pub fn start(
        settings: &DetectionSettings,
        streams: Vec<StreamHandle>,
        context: WorkerContext,
    ) -> Result<Self, WatchError> {
        let workers = settings.workers.max(1);
        let (tx, rx) = channel::bounded::<DetectionTask>(settings.task_queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let mut dispatcher = Self {
            stop: stop.clone(),
            poller: None,
            workers: Vec::with_capacity(workers),
            counters: counters.clone(),
        };

        for index in 0..workers {
            let rx = rx.clone();
            let context = context.clone();
            let counters = counters.clone();
            let worker = std::thread::Builder::new()
                .name(format!("detect-{index}"))
                .spawn(move || run_worker(&rx, &context, &counters));
            match worker {
                Ok(worker) => dispatcher.workers.push(worker),
                Err(err) => {
                    // Tear down what already started before reporting.
                    drop(tx);
                    dispatcher.join_all();
                    return Err(WatchError::Io(err));
                }
            }
        }
        drop(rx);

        let interval = settings.poll_interval;
        let poll_counters = counters.clone();
        let poller = std::thread::Builder::new()
            .name("detect-poll".to_string())
            .spawn(move || run_poller(&streams, tx, interval, &stop, &poll_counters));
        match poller {
            Ok(poller) => dispatcher.poller = Some(poller),
            Err(err) => {
                dispatcher.join_all();
                return Err(WatchError::Io(err));
            }
        }

        log::info!(
            "detection dispatcher started: {} workers, poll every {:?}, queue {}",
            workers,
            settings.poll_interval,
            settings.task_queue_capacity
        );
        Ok(dispatcher)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> DetectionStats {
        self.counters.snapshot()
    }

    /// Stop polling, let workers finish queued tasks, and join every thread.
    pub fn stop(mut self) -> DetectionStats {
        self.join_all();
        self.stats()
    }

    fn join_all(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                log::error!("detection poller panicked");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("detection worker panicked");
            }
        }
    }
}

impl Drop for DetectionDispatcher {
    fn drop(&mut self) {
        self.join_all();
    }
}

fn run_poller(
    streams: &[StreamHandle],
    tx: Sender<DetectionTask>,
    interval: Duration,
    stop: &AtomicBool,
    counters: &Counters,
) {
    let buses: Vec<_> = streams.iter().map(|s| (s.clone(), s.bus())).collect();
    while !stop.load(Ordering::SeqCst) {
        for (stream, bus) in &buses {
            let Some(frame) = bus.try_pop() else {
                continue;
            };
            let task = DetectionTask {
                frame,
                camera: stream.camera(),
            };
            match tx.try_send(task) {
                Ok(()) => {
                    counters.tasks_queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(task)) => {
                    counters.tasks_dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!(
                        "task queue full; frame {} of '{}' dropped",
                        task.frame.seq(),
                        task.camera.name
                    );
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        std::thread::sleep(interval);
    }
    // Dropping `tx` here lets workers drain the queue and exit.
}

fn run_worker(rx: &Receiver<DetectionTask>, context: &WorkerContext, counters: &Counters) {
    loop {
        match rx.recv_timeout(WORKER_IDLE_WAIT) {
            Ok(task) => {
                context.process(task, counters);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
