use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::descriptor::{DvrConfig, HandlerKind};
use crate::config::CameraLink;
use crate::error::WatchError;
use crate::timeout::run_with_timeout;

/// A constructed protocol handler for one DVR.
pub trait DvrHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Real connection attempt. May block; callers bound it with a timeout.
    fn test_connection(&self) -> Result<()>;

    /// Link the stream manager opens once this handler is selected.
    fn stream_link(&self) -> CameraLink;

    /// Delay to observe after the stream opens before frames are trusted.
    fn fetch_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Builds a handler of a given kind from a record that satisfies its descriptor.
pub trait HandlerFactory: Send + Sync {
    fn build(&self, kind: HandlerKind, config: &DvrConfig) -> Result<Arc<dyn DvrHandler>>;
}

/// What happened to one kind during detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Record lacks required keys; the handler was never constructed.
    Skipped { missing: Vec<&'static str> },
    /// Constructed, but building or probing failed.
    Failed { reason: String },
    Succeeded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub kind: HandlerKind,
    pub outcome: ProbeOutcome,
}

/// Every kind's outcome plus the handler detection would pick: the first
/// success in priority order.
pub struct Survey {
    pub reports: Vec<ProbeReport>,
    selected: Option<Arc<dyn DvrHandler>>,
}

impl Survey {
    pub fn selected(&self) -> Option<&Arc<dyn DvrHandler>> {
        self.selected.as_ref()
    }

    /// The selected handler, or `ProtocolDetectionExhausted` for `camera`.
    pub fn into_handler(self, camera: &str) -> Result<Arc<dyn DvrHandler>, WatchError> {
        self.selected.ok_or_else(|| WatchError::ProtocolDetectionExhausted {
            camera: camera.to_string(),
        })
    }
}

/// Walks the fixed handler priority chain for a DVR record.
pub struct ProtocolDetector {
    factory: Arc<dyn HandlerFactory>,
    timeout_override: Option<Duration>,
}

impl ProtocolDetector {
    pub fn new(factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            factory,
            timeout_override: None,
        }
    }

    /// Use `timeout` for every probe instead of the record's own `timeout` key.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// First kind, in priority order, that is constructible and whose probe succeeds.
    pub fn detect(&self, config: &DvrConfig) -> Option<HandlerKind> {
        self.select(config).map(|handler| handler.kind())
    }

    /// Like `detect`, but hands back the selected handler.
    pub fn resolve(&self, camera: &str, config: &DvrConfig) -> Result<Arc<dyn DvrHandler>, WatchError> {
        match self.select(config) {
            Some(handler) => {
                log::info!("camera '{camera}': DVR speaks {}", handler.kind());
                Ok(handler)
            }
            None => Err(WatchError::ProtocolDetectionExhausted {
                camera: camera.to_string(),
            }),
        }
    }

    /// Probe every constructible kind once and report each outcome. Does not
    /// stop at the first success; used for diagnostics.
    pub fn survey(&self, config: &DvrConfig) -> Survey {
        let mut reports = Vec::with_capacity(HandlerKind::PRIORITY.len());
        let mut selected: Option<Arc<dyn DvrHandler>> = None;
        for kind in HandlerKind::PRIORITY {
            let outcome = match self.try_kind(kind, config) {
                Ok(handler) => {
                    selected.get_or_insert(handler);
                    ProbeOutcome::Succeeded
                }
                Err(outcome) => outcome,
            };
            reports.push(ProbeReport { kind, outcome });
        }
        Survey { reports, selected }
    }

    fn select(&self, config: &DvrConfig) -> Option<Arc<dyn DvrHandler>> {
        for kind in HandlerKind::PRIORITY {
            match self.try_kind(kind, config) {
                Ok(handler) => return Some(handler),
                Err(ProbeOutcome::Skipped { missing }) => {
                    log::debug!("{kind} handler skipped: missing {}", missing.join(", "));
                }
                Err(ProbeOutcome::Failed { reason }) => {
                    log::info!("{kind} handler rejected: {reason}");
                }
                Err(ProbeOutcome::Succeeded) => {}
            }
        }
        log::warn!("no DVR protocol handler succeeded");
        None
    }

    fn try_kind(&self, kind: HandlerKind, config: &DvrConfig) -> Result<Arc<dyn DvrHandler>, ProbeOutcome> {
        let missing = kind.descriptor().missing_keys(config);
        if !missing.is_empty() {
            return Err(ProbeOutcome::Skipped { missing });
        }
        let handler = self
            .factory
            .build(kind, config)
            .map_err(|err| ProbeOutcome::Failed {
                reason: format!("construction failed: {err:#}"),
            })?;

        let timeout = self.timeout_override.unwrap_or_else(|| config.probe_timeout());
        let probe = handler.clone();
        match run_with_timeout(&format!("{kind} probe"), timeout, move || probe.test_connection()) {
            Ok(Ok(())) => {
                log::info!("{kind} probe succeeded");
                Ok(handler)
            }
            Ok(Err(err)) => Err(ProbeOutcome::Failed {
                reason: format!("{err:#}"),
            }),
            Err(err) => Err(ProbeOutcome::Failed {
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Probe behaviour per kind: `true` succeeds, `false` fails, absent hangs.
    struct FakeFactory {
        probes: Vec<(HandlerKind, bool)>,
        built: Mutex<Vec<HandlerKind>>,
    }

    struct FakeHandler {
        kind: HandlerKind,
        succeed: Option<bool>,
    }

    impl DvrHandler for FakeHandler {
        fn kind(&self) -> HandlerKind {
            self.kind
        }
        fn test_connection(&self) -> Result<()> {
            match self.succeed {
                Some(true) => Ok(()),
                Some(false) => Err(anyhow!("connection refused")),
                None => {
                    std::thread::sleep(Duration::from_secs(5));
                    Ok(())
                }
            }
        }
        fn stream_link(&self) -> CameraLink {
            CameraLink::Uri(format!("stub://{}", self.kind.name().to_lowercase()))
        }
    }

    impl HandlerFactory for FakeFactory {
        fn build(&self, kind: HandlerKind, _config: &DvrConfig) -> Result<Arc<dyn DvrHandler>> {
            self.built.lock().unwrap().push(kind);
            let succeed = self
                .probes
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, ok)| *ok);
            Ok(Arc::new(FakeHandler { kind, succeed }))
        }
    }

    fn factory(probes: Vec<(HandlerKind, bool)>) -> Arc<FakeFactory> {
        Arc::new(FakeFactory {
            probes,
            built: Mutex::new(Vec::new()),
        })
    }

    fn full_record() -> DvrConfig {
        DvrConfig {
            ip: Some("192.168.1.100".into()),
            port: Some(80),
            username: Some("admin".into()),
            password: Some("pw".into()),
            rtsp_url: Some("rtsp://192.168.1.100/live".into()),
            user_fps: Some(5),
            duration: Some(10),
            device: Some(0),
            ..DvrConfig::default()
        }
    }

    #[test]
    fn earlier_kind_wins_when_several_succeed() {
        let f = factory(vec![(HandlerKind::Rtsp, true), (HandlerKind::Onvif, true)]);
        let detector = ProtocolDetector::new(f.clone());
        assert_eq!(detector.detect(&full_record()), Some(HandlerKind::Rtsp));
        assert_eq!(*f.built.lock().unwrap(), vec![HandlerKind::Rtsp]);
    }

    #[test]
    fn onvif_is_not_constructed_without_its_keys() {
        let f = factory(vec![(HandlerKind::Rtsp, true), (HandlerKind::Onvif, true)]);
        let record = DvrConfig {
            rtsp_url: Some("rtsp://10.0.0.5/live".into()),
            user_fps: Some(5),
            duration: Some(10),
            ..DvrConfig::default()
        };
        let detector = ProtocolDetector::new(f.clone());
        assert_eq!(detector.detect(&record), Some(HandlerKind::Rtsp));
        assert!(!f.built.lock().unwrap().contains(&HandlerKind::Onvif));
    }

    #[test]
    fn failed_probes_fall_through_in_order() {
        let f = factory(vec![
            (HandlerKind::Rtsp, false),
            (HandlerKind::Onvif, false),
            (HandlerKind::Proprietary, false),
            (HandlerKind::Web, true),
            (HandlerKind::Analog, true),
        ]);
        let detector = ProtocolDetector::new(f.clone());
        assert_eq!(detector.detect(&full_record()), Some(HandlerKind::Web));
        assert_eq!(
            *f.built.lock().unwrap(),
            vec![
                HandlerKind::Rtsp,
                HandlerKind::Onvif,
                HandlerKind::Proprietary,
                HandlerKind::Web
            ]
        );
    }

    #[test]
    fn hanging_probe_times_out_and_detection_continues() {
        // RTSP is absent from the script, so its probe hangs.
        let f = factory(vec![(HandlerKind::Onvif, true)]);
        let detector =
            ProtocolDetector::new(f).with_probe_timeout(Duration::from_millis(50));
        let started = std::time::Instant::now();
        assert_eq!(detector.detect(&full_record()), Some(HandlerKind::Onvif));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn exhausted_chain_is_reported_for_the_camera() {
        let f = factory(vec![(HandlerKind::Web, false)]);
        let record = DvrConfig {
            ip: Some("10.0.0.9".into()),
            port: Some(8080),
            ..DvrConfig::default()
        };
        let detector = ProtocolDetector::new(f);
        assert_eq!(detector.detect(&record), None);
        match detector.resolve("Yard", &record) {
            Err(WatchError::ProtocolDetectionExhausted { camera }) => assert_eq!(camera, "Yard"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("detection must fail"),
        }
    }

    #[test]
    fn survey_reports_every_kind() {
        let f = factory(vec![(HandlerKind::Web, true)]);
        let record = DvrConfig {
            ip: Some("10.0.0.9".into()),
            port: Some(8080),
            ..DvrConfig::default()
        };
        let survey = ProtocolDetector::new(f).survey(&record);
        let reports = &survey.reports;
        assert_eq!(reports.len(), 5);
        let succeeded: HashSet<_> = reports
            .iter()
            .filter(|r| r.outcome == ProbeOutcome::Succeeded)
            .map(|r| r.kind)
            .collect();
        assert_eq!(succeeded, HashSet::from([HandlerKind::Web]));
        assert!(matches!(
            reports[0].outcome,
            ProbeOutcome::Skipped { ref missing } if missing.contains(&"rtsp_url")
        ));
        assert_eq!(survey.selected().map(|h| h.kind()), Some(HandlerKind::Web));
    }

    #[test]
    fn survey_selects_first_success_with_one_build_per_kind() -> Result<()> {
        let f = factory(vec![
            (HandlerKind::Rtsp, false),
            (HandlerKind::Onvif, true),
            (HandlerKind::Proprietary, false),
            (HandlerKind::Web, true),
            (HandlerKind::Analog, true),
        ]);
        let survey = ProtocolDetector::new(f.clone()).survey(&full_record());
        let constructed = survey
            .reports
            .iter()
            .filter(|r| !matches!(r.outcome, ProbeOutcome::Skipped { .. }))
            .count();
        let handler = survey.into_handler("Yard")?;
        assert_eq!(handler.kind(), HandlerKind::Onvif);
        // One construction per kind: the selection reuses the survey's handlers.
        let built = f.built.lock().unwrap().clone();
        assert_eq!(built.len(), constructed);
        assert_eq!(built.iter().collect::<HashSet<_>>().len(), built.len());
        Ok(())
    }

    #[test]
    fn survey_without_success_names_the_camera() {
        let f = factory(vec![(HandlerKind::Web, false)]);
        let record = DvrConfig {
            ip: Some("10.0.0.9".into()),
            port: Some(8080),
            ..DvrConfig::default()
        };
        match ProtocolDetector::new(f).survey(&record).into_handler("Yard") {
            Err(WatchError::ProtocolDetectionExhausted { camera }) => assert_eq!(camera, "Yard"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("survey must not select a handler"),
        }
    }
}
