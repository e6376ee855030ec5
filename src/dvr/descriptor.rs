use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on one handler probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default delay before frames are fetched after a DVR connection opens.
pub const DEFAULT_FETCH_DELAY: Duration = Duration::from_secs(5);

/// DVR protocol handler kinds, in detection priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HandlerKind {
    Rtsp,
    Onvif,
    Proprietary,
    Web,
    Analog,
}

impl HandlerKind {
    /// Fixed detection order. Declaration order is the only tie-break.
    pub const PRIORITY: [HandlerKind; 5] = [
        HandlerKind::Rtsp,
        HandlerKind::Onvif,
        HandlerKind::Proprietary,
        HandlerKind::Web,
        HandlerKind::Analog,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HandlerKind::Rtsp => "RTSP",
            HandlerKind::Onvif => "ONVIF",
            HandlerKind::Proprietary => "Proprietary",
            HandlerKind::Web => "Web",
            HandlerKind::Analog => "Analog",
        }
    }

    pub fn descriptor(self) -> &'static DvrCapabilityDescriptor {
        match self {
            HandlerKind::Rtsp => &CAPABILITIES[0],
            HandlerKind::Onvif => &CAPABILITIES[1],
            HandlerKind::Proprietary => &CAPABILITIES[2],
            HandlerKind::Web => &CAPABILITIES[3],
            HandlerKind::Analog => &CAPABILITIES[4],
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration keys a handler kind needs before it can be constructed.
#[derive(Debug)]
pub struct DvrCapabilityDescriptor {
    pub kind: HandlerKind,
    pub required_keys: &'static [&'static str],
}

impl DvrCapabilityDescriptor {
    /// Set containment: every required key is present in `config`.
    pub fn is_satisfied_by(&self, config: &DvrConfig) -> bool {
        let present = config.present_keys();
        self.required_keys.iter().all(|key| present.contains(key))
    }

    pub fn missing_keys(&self, config: &DvrConfig) -> Vec<&'static str> {
        let present = config.present_keys();
        self.required_keys
            .iter()
            .copied()
            .filter(|key| !present.contains(key))
            .collect()
    }
}

/// Static capability table, indexed in `HandlerKind::PRIORITY` order.
pub static CAPABILITIES: [DvrCapabilityDescriptor; 5] = [
    DvrCapabilityDescriptor {
        kind: HandlerKind::Rtsp,
        required_keys: &["rtsp_url", "user_fps", "duration"],
    },
    DvrCapabilityDescriptor {
        kind: HandlerKind::Onvif,
        required_keys: &["ip", "port", "username", "password", "user_fps", "duration"],
    },
    DvrCapabilityDescriptor {
        kind: HandlerKind::Proprietary,
        required_keys: &["ip", "port", "username", "password"],
    },
    DvrCapabilityDescriptor {
        kind: HandlerKind::Web,
        required_keys: &["ip", "port"],
    },
    DvrCapabilityDescriptor {
        kind: HandlerKind::Analog,
        required_keys: &["device"],
    },
];

/// DVR connection record. Every field is optional; which ones are present
/// decides which handler kinds are constructible.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DvrConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtsp_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_fps: Option<u32>,
    /// Seconds of footage per capture window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// Probe timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Fetch delay in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// DVR channel number (1-based).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    /// Local capture device index for analog capture cards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<u32>,
}

impl DvrConfig {
    /// Names of the keys that carry a value. Empty strings count as absent.
    pub fn present_keys(&self) -> BTreeSet<&'static str> {
        let mut keys = BTreeSet::new();
        let mut mark = |key: &'static str, present: bool| {
            if present {
                keys.insert(key);
            }
        };
        mark("ip", non_empty(&self.ip));
        mark("port", self.port.is_some());
        mark("username", non_empty(&self.username));
        mark("password", self.password.is_some());
        mark("rtsp_url", non_empty(&self.rtsp_url));
        mark("user_fps", self.user_fps.is_some());
        mark("duration", self.duration.is_some());
        mark("timeout", self.timeout.is_some());
        mark("delay", self.delay.is_some());
        mark("channel", self.channel.is_some());
        mark("device", self.device.is_some());
        keys
    }

    pub fn probe_timeout(&self) -> Duration {
        self.timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn fetch_delay(&self) -> Duration {
        self.delay
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FETCH_DELAY)
    }

    pub fn channel_or_default(&self) -> u32 {
        self.channel.filter(|c| *c > 0).unwrap_or(1)
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}
