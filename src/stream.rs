//! Per-camera acquisition loops.
//!
//! Each camera gets one dedicated thread that owns its `FrameSource`
//! exclusively. The thread opens the source (bounded retries, bounded open
//! time), reads frames into the camera's `FrameBus` and preview slot, and on a
//! read failure drops the source and goes back to the retry procedure.
//!
//! State machine:
//!
//! ```text
//! Connecting --open ok--> Streaming --read err--> Reconnecting --open ok--> Streaming
//!     |                                               |
//!     +--retries exhausted--> Failed <----------------+
//! any live state --stop--> Stopped
//! ```
//!
//! `Failed` is terminal until `StreamManager::restart`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{CameraConfig, StreamSettings};
use crate::error::{panic_message, WatchError};
use crate::frame::{Frame, FrameBus};
use crate::ingest::{open_with_timeout, FrameSource, SourceFactory};

/// Granularity of cancellable sleeps inside the acquisition loop.
const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    Connecting,
    Streaming,
    Reconnecting,
    Failed,
    /// Stopped on request. Not part of the failure path.
    Stopped,
}

impl StreamState {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            StreamState::Connecting | StreamState::Streaming | StreamState::Reconnecting
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Connecting => "connecting",
            StreamState::Streaming => "streaming",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Failed => "failed",
            StreamState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Open attempts per connect cycle, with a fixed delay in between.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
}

impl From<&StreamSettings> for RetryPolicy {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            retry_delay: settings.retry_delay,
            open_timeout: settings.open_timeout,
        }
    }
}

/// Snapshot of one stream's counters.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamStats {
    pub camera: String,
    pub state: StreamState,
    pub frames_captured: u64,
    /// Frames evicted from the detection bus before a worker took them.
    pub frames_dropped: u64,
    pub reconnects: u64,
    pub open_failures: u64,
    pub last_error: Option<String>,
}

// ----------------------------------------------------------------------------
// StreamHandle
// ----------------------------------------------------------------------------

struct StateCell {
    state: StreamState,
    /// Set by the loop thread on its way out.
    exited: bool,
}

struct StreamInner {
    name: String,
    camera: RwLock<Arc<CameraConfig>>,
    bus: Arc<FrameBus>,
    preview: FrameBus,
    cell: Mutex<StateCell>,
    changed: Condvar,
    cancel: AtomicBool,
    reconnects: AtomicU64,
    open_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Runtime state of one camera stream. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

impl StreamHandle {
    fn new(camera: CameraConfig, state: StreamState) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                name: camera.name.clone(),
                camera: RwLock::new(Arc::new(camera)),
                bus: Arc::new(FrameBus::new()),
                preview: FrameBus::with_capacity(1),
                cell: Mutex::new(StateCell {
                    state,
                    exited: state != StreamState::Connecting,
                }),
                changed: Condvar::new(),
                cancel: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                open_failures: AtomicU64::new(0),
                last_error: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Camera the current acquisition loop was started with.
    pub fn camera(&self) -> Arc<CameraConfig> {
        self.inner
            .camera
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn state(&self) -> StreamState {
        self.cell().state
    }

    /// Detection bus for this camera.
    pub fn bus(&self) -> Arc<FrameBus> {
        self.inner.bus.clone()
    }

    /// Most recent frame for live preview, if one arrived since the last call.
    pub fn take_preview(&self) -> Option<Frame> {
        self.inner.preview.try_pop()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn stats(&self) -> StreamStats {
        let bus = self.inner.bus.metrics();
        StreamStats {
            camera: self.inner.name.clone(),
            state: self.state(),
            frames_captured: bus.pushed,
            frames_dropped: bus.evicted,
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            open_failures: self.inner.open_failures.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }

    /// Block until `pred(state)` holds or `timeout` passes. Returns the last state seen.
    pub fn wait_for_state<F>(&self, timeout: Duration, pred: F) -> StreamState
    where
        F: Fn(StreamState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell();
        while !pred(cell.state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cell = self
                .inner
                .changed
                .wait_timeout(cell, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        cell.state
    }

    fn cell(&self) -> MutexGuard<'_, StateCell> {
        lock(&self.inner.cell)
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: StreamState) {
        let mut cell = self.cell();
        let prev = cell.state;
        cell.state = next;
        drop(cell);
        self.inner.changed.notify_all();
        if prev == next {
            return;
        }
        let name = self.name();
        match next {
            StreamState::Failed => log::error!("stream '{name}': {prev} -> {next}"),
            StreamState::Reconnecting => log::warn!("stream '{name}': {prev} -> {next}"),
            _ => log::info!("stream '{name}': {prev} -> {next}"),
        }
    }

    fn mark_exited(&self) {
        self.cell().exited = true;
        self.inner.changed.notify_all();
    }

    fn record_error(&self, err: &WatchError) {
        *lock(&self.inner.last_error) = Some(err.to_string());
    }

    /// Wait for the loop thread to leave, then reap it. False if it overran `timeout`.
    fn join_within(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell();
        while !cell.exited {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cell = self
                .inner
                .changed
                .wait_timeout(cell, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        let exited = cell.exited;
        drop(cell);

        let worker = lock(&self.inner.worker).take();
        match (exited, worker) {
            (true, Some(worker)) => {
                if worker.join().is_err() {
                    log::error!("stream '{}': acquisition thread panicked", self.name());
                }
                true
            }
            (true, None) => true,
            (false, Some(_detached)) => {
                log::warn!(
                    "stream '{}': did not stop within {:?}; detaching acquisition thread",
                    self.name(),
                    timeout
                );
                false
            }
            (false, None) => false,
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("camera", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// StreamManager
// ----------------------------------------------------------------------------

/// Starts, stops and restarts acquisition loops, one per camera.
pub struct StreamManager {
    factory: Arc<dyn SourceFactory>,
    settings: StreamSettings,
    streams: Mutex<Vec<StreamHandle>>,
}

impl StreamManager {
    pub fn new(factory: Arc<dyn SourceFactory>, settings: StreamSettings) -> Self {
        Self {
            factory,
            settings,
            streams: Mutex::new(Vec::new()),
        }
    }

    /// Launch the acquisition loop for `camera`. The handle starts in `Connecting`.
    pub fn start(&self, camera: CameraConfig) -> Result<StreamHandle, WatchError> {
        let handle = StreamHandle::new(camera, StreamState::Connecting);
        self.launch(&handle)?;
        lock(&self.streams).push(handle.clone());
        Ok(handle)
    }

    /// Register a camera that could not be resolved. The handle is `Failed` from the start.
    pub fn start_unavailable(&self, camera: CameraConfig, reason: &WatchError) -> StreamHandle {
        let handle = StreamHandle::new(camera, StreamState::Failed);
        handle.record_error(reason);
        log::error!("stream '{}': unavailable: {}", handle.name(), reason);
        lock(&self.streams).push(handle.clone());
        handle
    }

    /// Signal the loop and wait (bounded) for it to release its source.
    ///
    /// Returns false if the loop was still blocked inside the source when the
    /// stop timeout elapsed; the thread is then detached.
    pub fn stop(&self, handle: &StreamHandle) -> bool {
        handle.inner.cancel.store(true, Ordering::SeqCst);
        handle.inner.changed.notify_all();
        handle.join_within(self.settings.stop_timeout)
    }

    /// Stop every managed stream, signalling all of them before waiting on any.
    pub fn stop_all(&self) -> usize {
        let handles = self.handles();
        for handle in &handles {
            handle.inner.cancel.store(true, Ordering::SeqCst);
        }
        let deadline = Instant::now() + self.settings.stop_timeout;
        handles
            .iter()
            .filter(|handle| {
                let left = deadline.saturating_duration_since(Instant::now());
                handle.join_within(left)
            })
            .count()
    }

    pub fn is_running(&self, handle: &StreamHandle) -> bool {
        let cell = handle.cell();
        !cell.exited && cell.state.is_live()
    }

    pub fn handles(&self) -> Vec<StreamHandle> {
        lock(&self.streams).clone()
    }

    pub fn get(&self, name: &str) -> Option<StreamHandle> {
        lock(&self.streams)
            .iter()
            .find(|handle| handle.name() == name)
            .cloned()
    }

    /// Re-launch a stream that is `Failed` or `Stopped`, with its current camera.
    pub fn restart(&self, name: &str) -> Result<StreamHandle, WatchError> {
        self.restart_with(name, None)
    }

    /// Re-launch a finished stream, optionally swapping the camera it connects with.
    ///
    /// The handle, its bus and its counters are kept, so consumers holding the
    /// handle keep working.
    pub fn restart_with(
        &self,
        name: &str,
        camera: Option<CameraConfig>,
    ) -> Result<StreamHandle, WatchError> {
        let handle = self
            .get(name)
            .ok_or_else(|| WatchError::Config(format!("no stream named '{name}'")))?;
        if self.is_running(&handle) {
            return Err(WatchError::Config(format!(
                "stream '{name}' is still running"
            )));
        }
        if !handle.join_within(self.settings.stop_timeout) {
            return Err(WatchError::Config(format!(
                "stream '{name}' has not released its previous source"
            )));
        }
        if let Some(camera) = camera {
            *handle
                .inner
                .camera
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(camera);
        }
        log::info!("stream '{name}': restart requested");
        self.launch(&handle)?;
        Ok(handle)
    }

    fn launch(&self, handle: &StreamHandle) -> Result<(), WatchError> {
        handle.inner.cancel.store(false, Ordering::SeqCst);
        {
            let mut cell = handle.cell();
            cell.exited = false;
            cell.state = StreamState::Connecting;
        }
        let thread_handle = handle.clone();
        let factory = self.factory.clone();
        let policy = RetryPolicy::from(&self.settings);
        let worker = std::thread::Builder::new()
            .name(format!("stream:{}", handle.name()))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    acquisition_loop(&thread_handle, factory.as_ref(), &policy)
                }));
                if let Err(payload) = outcome {
                    let err = WatchError::ReadFailed {
                        camera: thread_handle.name().to_string(),
                        reason: format!("source panicked: {}", panic_message(payload.as_ref())),
                    };
                    thread_handle.record_error(&err);
                    log::error!("stream '{}': {}", thread_handle.name(), err);
                    thread_handle.set_state(StreamState::Failed);
                }
                thread_handle.mark_exited();
            });
        match worker {
            Ok(worker) => {
                *lock(&handle.inner.worker) = Some(worker);
                Ok(())
            }
            Err(err) => {
                handle.set_state(StreamState::Failed);
                handle.mark_exited();
                Err(WatchError::Io(err))
            }
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        for handle in lock(&self.streams).iter() {
            handle.inner.cancel.store(true, Ordering::SeqCst);
        }
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

fn acquisition_loop(handle: &StreamHandle, factory: &dyn SourceFactory, policy: &RetryPolicy) {
    let mut seq: u64 = 0;
    loop {
        let Some(mut source) = connect(handle, factory, policy) else {
            if handle.is_cancelled() {
                handle.set_state(StreamState::Stopped);
            } else {
                handle.set_state(StreamState::Failed);
            }
            return;
        };
        handle.set_state(StreamState::Streaming);

        let lost = read_until_lost(handle, source.as_mut(), &mut seq);
        source.close();
        drop(source);

        match lost {
            None => {
                handle.set_state(StreamState::Stopped);
                return;
            }
            Some(err) => {
                log::warn!("stream '{}': {}", handle.name(), err);
                handle.record_error(&err);
                handle.inner.reconnects.fetch_add(1, Ordering::Relaxed);
                handle.set_state(StreamState::Reconnecting);
            }
        }
    }
}

/// Read frames until the source fails (`Some(err)`) or a stop is requested (`None`).
fn read_until_lost(
    handle: &StreamHandle,
    source: &mut dyn FrameSource,
    seq: &mut u64,
) -> Option<WatchError> {
    let camera: Arc<str> = Arc::from(handle.name());
    let settle_until = Instant::now() + handle.camera().settle;
    loop {
        if handle.is_cancelled() {
            return None;
        }
        match source.read_frame() {
            Ok(_) if Instant::now() < settle_until => {}
            Ok(image) => {
                *seq += 1;
                let frame = Frame::new(camera.clone(), *seq, image);
                handle.inner.preview.push(frame.clone());
                if let Some(evicted) = handle.inner.bus.push(frame) {
                    log::trace!(
                        "stream '{}': frame {} evicted before detection",
                        handle.name(),
                        evicted.seq()
                    );
                }
            }
            Err(err) => {
                return Some(WatchError::ReadFailed {
                    camera: handle.name().to_string(),
                    reason: format!("{err:#}"),
                })
            }
        }
    }
}

/// One connect cycle: up to `max_retries` open attempts. `None` when exhausted or cancelled.
fn connect(
    handle: &StreamHandle,
    factory: &dyn SourceFactory,
    policy: &RetryPolicy,
) -> Option<Box<dyn FrameSource>> {
    let camera = handle.camera();
    for attempt in 1..=policy.max_retries {
        if handle.is_cancelled() {
            return None;
        }
        let opened = factory
            .create(&camera)
            .map_err(|err| match err.downcast::<WatchError>() {
                Ok(err) => err,
                Err(err) => WatchError::ConnectFailed {
                    camera: camera.name.clone(),
                    reason: format!("{err:#}"),
                },
            })
            .and_then(|source| open_with_timeout(&camera.name, source, policy.open_timeout));
        match opened {
            Ok(source) => {
                if attempt > 1 {
                    log::info!(
                        "stream '{}': opened on attempt {attempt}/{}",
                        camera.name,
                        policy.max_retries
                    );
                }
                return Some(source);
            }
            Err(err) => {
                handle.inner.open_failures.fetch_add(1, Ordering::Relaxed);
                handle.record_error(&err);
                if !err.is_retryable() {
                    log::error!("stream '{}': not retrying: {}", camera.name, err);
                    return None;
                }
                log::warn!(
                    "stream '{}': open attempt {attempt}/{} failed: {}",
                    camera.name,
                    policy.max_retries,
                    err
                );
            }
        }
        if attempt < policy.max_retries && !sleep_unless_cancelled(handle, policy.retry_delay) {
            return None;
        }
    }
    log::error!(
        "stream '{}': giving up after {} open attempts",
        camera.name,
        policy.max_retries
    );
    None
}

/// Sleep for `delay` in short slices. False if a stop was requested meanwhile.
fn sleep_unless_cancelled(handle: &StreamHandle, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if handle.is_cancelled() {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        std::thread::sleep(left.min(CANCEL_POLL));
    }
}
