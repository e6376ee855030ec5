use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::dvr::DvrConfig;

const DEFAULT_CAMERAS_PATH: &str = "cameras.json";
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_TASK_QUEUE_CAPACITY: usize = 64;
const DEFAULT_COOLDOWN_SECS: u64 = 180;
const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TOPIC: &str = "watchpost/alerts";
const MAX_CAMERA_NAME_LEN: usize = 64;
/// Largest accepted width or height hint, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

// ----------------------------------------------------------------------------
// Daemon configuration file
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WatchpostConfigFile {
    cameras_path: Option<PathBuf>,
    stream: Option<StreamConfigFile>,
    detection: Option<DetectionConfigFile>,
    alerts: Option<AlertConfigFile>,
    channels: Option<Vec<ChannelSettings>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    open_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    confidence_threshold: Option<f32>,
    alert_on_motion: Option<bool>,
    task_queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AlertConfigFile {
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WatchpostConfig {
    pub cameras_path: PathBuf,
    pub stream: StreamSettings,
    pub detection: DetectionSettings,
    pub alerts: AlertSettings,
    pub channels: Vec<ChannelSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Open attempts per connect cycle before the stream is marked failed.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub confidence_threshold: f32,
    /// Alert on motion alone instead of waiting for human confirmation.
    pub alert_on_motion: bool,
    pub task_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertSettings {
    pub cooldown: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            open_timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            confidence_threshold: DEFAULT_CONFIDENCE,
            alert_on_motion: false,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        }
    }
}

/// One cores-minus-one pool, never empty.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Notification channel configuration, `kind` selects the implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelSettings {
    Log,
    Webhook {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Telegram {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        chat_id: Option<String>,
    },
    Mqtt {
        broker: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        topic: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
}

impl ChannelSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelSettings::Log => "log",
            ChannelSettings::Webhook { .. } => "webhook",
            ChannelSettings::Telegram { .. } => "telegram",
            ChannelSettings::Mqtt { .. } => "mqtt",
        }
    }

    pub fn webhook_timeout(timeout_ms: Option<u64>) -> Duration {
        Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS))
    }

    pub fn mqtt_port(port: Option<u16>) -> u16 {
        port.unwrap_or(DEFAULT_MQTT_PORT)
    }

    pub fn mqtt_topic(topic: Option<&str>) -> &str {
        topic.unwrap_or(DEFAULT_MQTT_TOPIC)
    }
}

impl WatchpostConfig {
    /// Load from the file named by `WATCHPOST_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => WatchpostConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchpostConfigFile) -> Self {
        let stream_defaults = StreamSettings::default();
        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            max_retries: stream.max_retries.unwrap_or(stream_defaults.max_retries),
            retry_delay: stream
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.retry_delay),
            open_timeout: stream
                .open_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.open_timeout),
            stop_timeout: stream
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(stream_defaults.stop_timeout),
        };

        let detection_defaults = DetectionSettings::default();
        let detection = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            workers: detection.workers.unwrap_or(detection_defaults.workers),
            poll_interval: detection
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(detection_defaults.poll_interval),
            confidence_threshold: detection
                .confidence_threshold
                .unwrap_or(detection_defaults.confidence_threshold),
            alert_on_motion: detection.alert_on_motion.unwrap_or(false),
            task_queue_capacity: detection
                .task_queue_capacity
                .unwrap_or(detection_defaults.task_queue_capacity),
        };

        let alerts = AlertSettings {
            cooldown: Duration::from_secs(
                file.alerts
                    .and_then(|alerts| alerts.cooldown_secs)
                    .unwrap_or(DEFAULT_COOLDOWN_SECS),
            ),
        };

        Self {
            cameras_path: file
                .cameras_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CAMERAS_PATH)),
            stream,
            detection,
            alerts,
            channels: file.channels.unwrap_or_else(|| vec![ChannelSettings::Log]),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("WATCHPOST_CAMERAS") {
            if !path.trim().is_empty() {
                self.cameras_path = PathBuf::from(path);
            }
        }
        if let Some(secs) = env_parse::<u64>("WATCHPOST_COOLDOWN_SECS")? {
            self.alerts.cooldown = Duration::from_secs(secs);
        }
        if let Some(workers) = env_parse::<usize>("WATCHPOST_WORKERS")? {
            self.detection.workers = workers;
        }
        if let Some(confidence) = env_parse::<f32>("WATCHPOST_CONFIDENCE")? {
            self.detection.confidence_threshold = confidence;
        }
        if let Some(flag) = env_parse::<bool>("WATCHPOST_ALERT_ON_MOTION")? {
            self.detection.alert_on_motion = flag;
        }
        if let Some(retries) = env_parse::<u32>("WATCHPOST_MAX_RETRIES")? {
            self.stream.max_retries = retries;
        }

        let env_token = non_blank_env("TELEGRAM_TOKEN");
        let env_chat = non_blank_env("TELEGRAM_CHAT_ID");
        for channel in &mut self.channels {
            if let ChannelSettings::Telegram { token, chat_id } = channel {
                if token.is_none() {
                    *token = env_token.clone();
                }
                if chat_id.is_none() {
                    *chat_id = env_chat.clone();
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.alerts.cooldown.is_zero() {
            return Err(anyhow!("alert cooldown must be greater than zero"));
        }
        let confidence = self.detection.confidence_threshold;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(anyhow!(
                "confidence threshold must be in (0, 1], got {confidence}"
            ));
        }
        if self.detection.workers == 0 {
            return Err(anyhow!("detection workers must be at least 1"));
        }
        if self.detection.task_queue_capacity == 0 {
            return Err(anyhow!("detection task queue capacity must be at least 1"));
        }
        if self.stream.max_retries == 0 {
            return Err(anyhow!("stream max_retries must be at least 1"));
        }
        for channel in &self.channels {
            if let ChannelSettings::Webhook { url, .. } = channel {
                url::Url::parse(url).with_context(|| format!("invalid webhook url {url}"))?;
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<WatchpostConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match non_blank_env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{key} has an invalid value: {raw}")),
    }
}

// ----------------------------------------------------------------------------
// Camera list
// ----------------------------------------------------------------------------

/// How a camera is reached: a URI, a local device index, or a DVR record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraLink {
    Index(u32),
    Uri(String),
}

impl fmt::Display for CameraLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraLink::Index(index) => write!(f, "{index}"),
            CameraLink::Uri(uri) => f.write_str(uri),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Link(CameraLink),
    /// Resolved to a link by protocol detection before the stream starts.
    Dvr(DvrConfig),
}

/// One camera. Immutable once its stream has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub name: String,
    pub connection: Connection,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub description: String,
    /// Frames read within this window after each open are discarded.
    pub settle: Duration,
}

impl CameraConfig {
    pub fn with_link(name: impl Into<String>, link: CameraLink) -> Self {
        Self {
            name: name.into(),
            connection: Connection::Link(link),
            width: None,
            height: None,
            description: String::new(),
            settle: Duration::ZERO,
        }
    }

    pub fn with_dvr(name: impl Into<String>, dvr: DvrConfig) -> Self {
        Self {
            name: name.into(),
            connection: Connection::Dvr(dvr),
            width: None,
            height: None,
            description: String::new(),
            settle: Duration::ZERO,
        }
    }

    pub fn link(&self) -> Option<&CameraLink> {
        match &self.connection {
            Connection::Link(link) => Some(link),
            Connection::Dvr(_) => None,
        }
    }

    /// Human-readable connection summary. Never includes DVR credentials.
    pub fn link_display(&self) -> String {
        match &self.connection {
            Connection::Link(link) => redact_userinfo(&link.to_string()),
            Connection::Dvr(dvr) => match (&dvr.ip, dvr.port) {
                (Some(ip), Some(port)) => format!("dvr://{ip}:{port}"),
                (Some(ip), None) => format!("dvr://{ip}"),
                _ => "dvr".to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum RawLink {
    Index(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct CameraRecord {
    name: String,
    #[serde(default)]
    link: Option<RawLink>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    dvr: Option<DvrConfig>,
}

impl CameraRecord {
    fn into_config(self) -> Result<CameraConfig> {
        let connection = match (self.dvr, self.link) {
            (Some(dvr), _) => Connection::Dvr(dvr),
            (None, Some(RawLink::Index(index))) => Connection::Link(CameraLink::Index(index)),
            (None, Some(RawLink::Text(text))) => Connection::Link(parse_link(&text)?),
            (None, None) => {
                return Err(anyhow!("camera '{}' has neither a link nor a dvr record", self.name))
            }
        };
        Ok(CameraConfig {
            name: self.name,
            connection,
            width: self.width,
            height: self.height,
            description: self.desc.unwrap_or_default(),
            settle: Duration::ZERO,
        })
    }
}

/// A digit-only link is a local device index.
pub fn parse_link(raw: &str) -> Result<CameraLink> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("camera link is empty"));
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let index = trimmed
            .parse::<u32>()
            .with_context(|| format!("device index out of range: {trimmed}"))?;
        return Ok(CameraLink::Index(index));
    }
    Ok(CameraLink::Uri(trimmed.to_string()))
}

/// Read and validate the ordered camera list.
pub fn load_cameras(path: &Path) -> Result<Vec<CameraConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read camera list {}", path.display()))?;
    parse_cameras(&raw).with_context(|| format!("invalid camera list {}", path.display()))
}

pub fn parse_cameras(raw: &str) -> Result<Vec<CameraConfig>> {
    let records: Vec<CameraRecord> = serde_json::from_str(raw)?;
    let cameras = records
        .into_iter()
        .map(CameraRecord::into_config)
        .collect::<Result<Vec<_>>>()?;
    validate_cameras(&cameras)?;
    Ok(cameras)
}

pub fn validate_cameras(cameras: &[CameraConfig]) -> Result<()> {
    if cameras.is_empty() {
        return Err(anyhow!("camera list is empty"));
    }
    let mut seen = HashSet::new();
    for camera in cameras {
        validate_camera_name(&camera.name)?;
        if !seen.insert(camera.name.as_str()) {
            return Err(anyhow!("duplicate camera name '{}'", camera.name));
        }
        if let (Some(0), _) | (_, Some(0)) = (camera.width, camera.height) {
            return Err(anyhow!("camera '{}' has a zero resolution hint", camera.name));
        }
        if camera.width.unwrap_or(0) > MAX_DIMENSION || camera.height.unwrap_or(0) > MAX_DIMENSION
        {
            return Err(anyhow!(
                "camera '{}' resolution hint exceeds {MAX_DIMENSION}x{MAX_DIMENSION}",
                camera.name
            ));
        }
    }
    Ok(())
}

pub fn validate_camera_name(name: &str) -> Result<()> {
    static CAMERA_NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = CAMERA_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.\-]*$").unwrap());
    if name.is_empty() {
        return Err(anyhow!("camera name must not be empty"));
    }
    if name.chars().count() > MAX_CAMERA_NAME_LEN {
        return Err(anyhow!(
            "camera name '{name}' is longer than {MAX_CAMERA_NAME_LEN} characters"
        ));
    }
    if !re.is_match(name) {
        return Err(anyhow!(
            "camera name '{name}' may only contain letters, digits, space, '_', '.', '-'"
        ));
    }
    Ok(())
}

fn redact_userinfo(link: &str) -> String {
    match url::Url::parse(link) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        _ => link.to_string(),
    }
}
