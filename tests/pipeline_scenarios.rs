use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use watchpost::config::{AlertSettings, DetectionSettings, StreamSettings};
use watchpost::dvr::{DvrConfig, DvrHandler, HandlerFactory, HandlerKind};
use watchpost::{
    CameraConfig, CameraLink, CapturedImage, Channel, Detector, Frame, FrameSource,
    NotificationTask, Pipeline, SourceFactory, StreamState, WatchpostConfig,
};

// ----------------------------------------------------------------------------
// Scripted fakes
// ----------------------------------------------------------------------------

/// Cameras named in `dead` never open; every other camera streams forever.
struct ScriptedSources {
    dead: Vec<&'static str>,
}

struct ScriptedSource {
    fail_open: bool,
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            Err(anyhow!("connection refused"))
        } else {
            Ok(())
        }
    }

    fn read_frame(&mut self) -> Result<CapturedImage> {
        std::thread::sleep(Duration::from_millis(5));
        Ok(CapturedImage::new(4, 4, vec![128; 4 * 4 * 3]))
    }

    fn close(&mut self) {}
}

impl SourceFactory for ScriptedSources {
    fn create(&self, camera: &CameraConfig) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(ScriptedSource {
            fail_open: self.dead.contains(&camera.name.as_str()),
        }))
    }
}

/// Sees motion and a human on every frame; errors for cameras in `broken`.
struct AlwaysHuman {
    broken: Vec<&'static str>,
}

impl Detector for AlwaysHuman {
    fn name(&self) -> &'static str {
        "always-human"
    }

    fn detect_motion(&self, frame: &Frame) -> Result<bool> {
        if self.broken.contains(&frame.camera()) {
            return Err(anyhow!("model crashed"));
        }
        Ok(true)
    }

    fn detect_human(&self, _frame: &Frame, _confidence_threshold: f32) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Clone, Default)]
struct Recorder {
    alerts: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn cameras(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }

    fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.alerts.lock().unwrap().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

struct RecordingChannel {
    recorder: Recorder,
    delay: Duration,
}

impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&mut self, task: &NotificationTask) -> Result<()> {
        std::thread::sleep(self.delay);
        self.recorder
            .alerts
            .lock()
            .unwrap()
            .push(task.camera().name.clone());
        Ok(())
    }
}

/// Web-only DVR factory; the probe succeeds once `online` is set.
struct SwitchableDvr {
    online: Arc<AtomicBool>,
    probes: Arc<AtomicU64>,
}

struct SwitchableHandler {
    online: bool,
}

impl DvrHandler for SwitchableHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Web
    }

    fn test_connection(&self) -> Result<()> {
        if self.online {
            Ok(())
        } else {
            Err(anyhow!("no route to host"))
        }
    }

    fn stream_link(&self) -> CameraLink {
        CameraLink::Uri("stub://yard".to_string())
    }
}

impl HandlerFactory for SwitchableDvr {
    fn build(&self, _kind: HandlerKind, _config: &DvrConfig) -> Result<Arc<dyn DvrHandler>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SwitchableHandler {
            online: self.online.load(Ordering::SeqCst),
        }))
    }
}

fn offline_dvr() -> (Arc<SwitchableDvr>, Arc<AtomicBool>) {
    let online = Arc::new(AtomicBool::new(false));
    (
        Arc::new(SwitchableDvr {
            online: online.clone(),
            probes: Arc::new(AtomicU64::new(0)),
        }),
        online,
    )
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn test_config(cooldown: Duration) -> WatchpostConfig {
    WatchpostConfig {
        cameras_path: PathBuf::from("unused.json"),
        stream: StreamSettings {
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            open_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(2),
        },
        detection: DetectionSettings {
            workers: 2,
            poll_interval: Duration::from_millis(2),
            confidence_threshold: 0.5,
            alert_on_motion: false,
            task_queue_capacity: 8,
        },
        alerts: AlertSettings { cooldown },
        channels: Vec::new(),
    }
}

fn stub_camera(name: &str) -> CameraConfig {
    CameraConfig::with_link(name, CameraLink::Uri(format!("stub://{}", name.to_lowercase())))
}

fn recording(recorder: &Recorder, delay: Duration) -> Vec<Box<dyn Channel>> {
    vec![Box::new(RecordingChannel {
        recorder: recorder.clone(),
        delay,
    })]
}

fn state_of(pipeline: &Pipeline, name: &str) -> StreamState {
    pipeline
        .streams()
        .get(name)
        .map(|handle| handle.state())
        .unwrap_or(StreamState::Stopped)
}

fn wait_state(pipeline: &Pipeline, name: &str, want: StreamState) -> StreamState {
    match pipeline.streams().get(name) {
        Some(handle) => handle.wait_for_state(Duration::from_secs(3), |s| s == want),
        None => StreamState::Stopped,
    }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn dead_camera_fails_while_others_alert_once_per_cooldown() -> Result<()> {
    let recorder = Recorder::default();
    let (dvr, _) = offline_dvr();
    let pipeline = Pipeline::start(
        &test_config(Duration::from_secs(60)),
        vec![stub_camera("Gate"), stub_camera("Porch"), stub_camera("Yard")],
        Arc::new(ScriptedSources { dead: vec!["Gate"] }),
        Arc::new(AlwaysHuman { broken: vec![] }),
        recording(&recorder, Duration::ZERO),
        dvr,
    )?;

    assert_eq!(wait_state(&pipeline, "Gate", StreamState::Failed), StreamState::Failed);
    assert_eq!(wait_state(&pipeline, "Porch", StreamState::Streaming), StreamState::Streaming);
    assert_eq!(wait_state(&pipeline, "Yard", StreamState::Streaming), StreamState::Streaming);

    assert!(recorder.wait_for(2, Duration::from_secs(3)));
    // Plenty of further positive frames arrive inside the cooldown.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(state_of(&pipeline, "Gate"), StreamState::Failed);

    let stats = pipeline.stop();
    let mut alerted = recorder.cameras();
    alerted.sort();
    assert_eq!(alerted, vec!["Porch".to_string(), "Yard".to_string()]);
    assert_eq!(stats.detection.alerts_sent, 2);
    assert!(stats.detection.alerts_throttled > 0);
    assert_eq!(stats.notifications.delivered, 2);
    assert_eq!(stats.streams_in(StreamState::Failed), 1);
    Ok(())
}

#[test]
fn detector_errors_are_contained_per_frame() -> Result<()> {
    let recorder = Recorder::default();
    let (dvr, _) = offline_dvr();
    let pipeline = Pipeline::start(
        &test_config(Duration::from_secs(60)),
        vec![stub_camera("Gate"), stub_camera("Porch")],
        Arc::new(ScriptedSources { dead: vec![] }),
        Arc::new(AlwaysHuman {
            broken: vec!["Gate"],
        }),
        recording(&recorder, Duration::ZERO),
        dvr,
    )?;

    assert!(recorder.wait_for(1, Duration::from_secs(3)));
    std::thread::sleep(Duration::from_millis(100));
    let stats = pipeline.stop();
    assert_eq!(recorder.cameras(), vec!["Porch".to_string()]);
    assert!(stats.detection.detector_errors > 0);
    assert_eq!(stats.streams_in(StreamState::Failed), 0);
    Ok(())
}

#[test]
fn undetectable_dvr_is_failed_and_recovers_on_restart() -> Result<()> {
    let recorder = Recorder::default();
    let (dvr, online) = offline_dvr();
    let yard = CameraConfig::with_dvr(
        "Yard",
        DvrConfig {
            ip: Some("192.168.1.100".to_string()),
            port: Some(8080),
            ..DvrConfig::default()
        },
    );
    let pipeline = Pipeline::start(
        &test_config(Duration::from_secs(60)),
        vec![stub_camera("Porch"), yard],
        Arc::new(ScriptedSources { dead: vec![] }),
        Arc::new(AlwaysHuman { broken: vec![] }),
        recording(&recorder, Duration::ZERO),
        dvr.clone(),
    )?;

    assert_eq!(state_of(&pipeline, "Yard"), StreamState::Failed);
    let error = pipeline
        .streams()
        .get("Yard")
        .and_then(|handle| handle.last_error())
        .unwrap_or_default();
    assert!(error.contains("Yard"), "error names the camera: {error}");
    assert_eq!(wait_state(&pipeline, "Porch", StreamState::Streaming), StreamState::Streaming);

    // Still offline: restart re-probes and fails again.
    assert!(pipeline.restart("Yard").is_err());
    assert_eq!(dvr.probes.load(Ordering::SeqCst), 2);

    online.store(true, Ordering::SeqCst);
    let handle = pipeline.restart("Yard")?;
    assert_eq!(
        handle.wait_for_state(Duration::from_secs(3), |s| s == StreamState::Streaming),
        StreamState::Streaming
    );
    assert!(recorder.wait_for(2, Duration::from_secs(3)));

    pipeline.stop();
    Ok(())
}

#[test]
fn restart_failed_brings_back_only_failed_cameras() -> Result<()> {
    let recorder = Recorder::default();
    let (dvr, online) = offline_dvr();
    let yard = CameraConfig::with_dvr(
        "Yard",
        DvrConfig {
            ip: Some("192.168.1.100".to_string()),
            port: Some(8080),
            ..DvrConfig::default()
        },
    );
    let pipeline = Pipeline::start(
        &test_config(Duration::from_secs(60)),
        vec![stub_camera("Porch"), yard],
        Arc::new(ScriptedSources { dead: vec![] }),
        Arc::new(AlwaysHuman { broken: vec![] }),
        recording(&recorder, Duration::ZERO),
        dvr,
    )?;
    assert_eq!(state_of(&pipeline, "Yard"), StreamState::Failed);
    assert_eq!(wait_state(&pipeline, "Porch", StreamState::Streaming), StreamState::Streaming);

    assert_eq!(pipeline.restart_failed(), 0);
    assert_eq!(state_of(&pipeline, "Yard"), StreamState::Failed);

    online.store(true, Ordering::SeqCst);
    assert_eq!(pipeline.restart_failed(), 1);
    assert_eq!(wait_state(&pipeline, "Yard", StreamState::Streaming), StreamState::Streaming);
    assert_eq!(state_of(&pipeline, "Porch"), StreamState::Streaming);
    assert_eq!(pipeline.restart_failed(), 0);

    pipeline.stop();
    Ok(())
}

#[test]
fn stop_drains_every_accepted_notification() -> Result<()> {
    let recorder = Recorder::default();
    let (dvr, _) = offline_dvr();
    let cameras: Vec<CameraConfig> = ["A", "B", "C", "D"].into_iter().map(stub_camera).collect();
    let pipeline = Pipeline::start(
        &test_config(Duration::from_secs(60)),
        cameras,
        Arc::new(ScriptedSources { dead: vec![] }),
        Arc::new(AlwaysHuman { broken: vec![] }),
        recording(&recorder, Duration::from_millis(100)),
        dvr,
    )?;

    // Wait until alerts are queued but the slow channel has not caught up.
    let deadline = Instant::now() + Duration::from_secs(3);
    while pipeline.stats().notifications.enqueued < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = pipeline.stop();
    assert_eq!(stats.notifications.enqueued, 4);
    assert_eq!(stats.notifications.completed, stats.notifications.enqueued);
    assert_eq!(recorder.cameras().len(), 4);
    Ok(())
}
