//! Bounded-time execution of blocking calls.
//!
//! Camera opens and DVR probes sit on calls that cannot be cancelled from the
//! outside (socket connects, decoder start-up). They run on a helper thread
//! and the caller waits on a channel with a deadline. On timeout the helper
//! is detached: it finishes on its own and its result is discarded.

use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};

use crate::error::WatchError;

/// Run `f` on a helper thread and wait at most `timeout` for its result.
pub fn run_with_timeout<T, F>(what: &str, timeout: Duration, f: F) -> Result<T, WatchError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = channel::bounded(1);
    std::thread::Builder::new()
        .name(format!("probe:{what}"))
        .spawn(move || {
            // The receiver is gone once the caller gave up.
            let _ = tx.send(f());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(WatchError::ProbeTimeout {
            what: what.to_string(),
            timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(WatchError::ProbeAborted {
            what: what.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn returns_value_when_call_finishes_in_time() {
        let value = run_with_timeout("fast", Duration::from_secs(1), || 41 + 1).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn slow_call_times_out_without_blocking_caller() {
        let started = Instant::now();
        let result = run_with_timeout("slow", Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(2));
        });
        assert!(matches!(result, Err(WatchError::ProbeTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn panicking_call_is_reported_as_aborted() {
        let result: Result<(), _> =
            run_with_timeout("boom", Duration::from_secs(1), || panic!("probe exploded"));
        assert!(matches!(result, Err(WatchError::ProbeAborted { .. })));
    }
}
