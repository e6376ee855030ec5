//! Per-camera alert cooldown shared by every detection worker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(180);

/// Camera name -> instant of the last alert that was let through.
///
/// All access goes through one mutex, so `try_acquire` is a single critical
/// section even when two workers race on the same camera.
#[derive(Debug)]
pub struct AlertThrottle {
    cooldown: Duration,
    last_alert: Mutex<HashMap<String, Instant>>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// True if no alert was recorded for `camera`, or the last one is strictly
    /// more than `cooldown` before `now`.
    pub fn should_alert(&self, camera: &str, now: Instant) -> bool {
        let map = self.lock();
        self.elapsed_ok(map.get(camera), now)
    }

    pub fn record_alert(&self, camera: &str, now: Instant) {
        self.lock().insert(camera.to_string(), now);
    }

    /// Check and record in one step. Returns true when the caller may alert.
    pub fn try_acquire(&self, camera: &str, now: Instant) -> bool {
        let mut map = self.lock();
        if !self.elapsed_ok(map.get(camera), now) {
            return false;
        }
        map.insert(camera.to_string(), now);
        true
    }

    pub fn last_alert(&self, camera: &str) -> Option<Instant> {
        self.lock().get(camera).copied()
    }

    fn elapsed_ok(&self, last: Option<&Instant>, now: Instant) -> bool {
        match last {
            None => true,
            // An instant earlier than the recorded one is inside the window.
            Some(last) => now
                .checked_duration_since(*last)
                .is_some_and(|elapsed| elapsed > self.cooldown),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // A worker that panicked mid-insert leaves a usable map behind.
        self.last_alert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AlertThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_alert_inside_cooldown_is_suppressed() {
        let throttle = AlertThrottle::new(Duration::from_secs(180));
        let t0 = Instant::now();
        assert!(throttle.should_alert("Gate", t0));
        throttle.record_alert("Gate", t0);

        assert!(!throttle.should_alert("Gate", t0 + Duration::from_secs(10)));
        assert!(!throttle.should_alert("Gate", t0 + Duration::from_secs(180)));
        assert!(throttle.should_alert("Gate", t0 + Duration::from_secs(181)));
    }

    #[test]
    fn cameras_are_throttled_independently() {
        let throttle = AlertThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.try_acquire("Gate", t0));
        assert!(throttle.try_acquire("Yard", t0));
        assert!(!throttle.try_acquire("Gate", t0 + Duration::from_secs(1)));
        assert_eq!(throttle.last_alert("Gate"), Some(t0));
    }

    #[test]
    fn concurrent_acquire_lets_exactly_one_through() {
        let throttle = Arc::new(AlertThrottle::new(Duration::from_secs(60)));
        let granted = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                let granted = granted.clone();
                thread::spawn(move || {
                    if throttle.try_acquire("Gate", now) {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }
}
