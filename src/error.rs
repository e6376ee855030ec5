use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the watch pipeline.
///
/// Every variant is scoped to the smallest unit it can affect: a camera, a
/// frame, a channel or a probe. None of them is allowed to abort sibling
/// streams, workers or the process; callers log and continue.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("camera '{camera}' failed to connect: {reason}")]
    ConnectFailed { camera: String, reason: String },

    #[error("camera '{camera}' read failed: {reason}")]
    ReadFailed { camera: String, reason: String },

    #[error("detector failed on camera '{camera}': {reason}")]
    Detector { camera: String, reason: String },

    #[error("channel '{channel}' failed to send: {reason}")]
    ChannelSendFailed { channel: String, reason: String },

    #[error("no DVR protocol handler succeeded for camera '{camera}'")]
    ProtocolDetectionExhausted { camera: String },

    #[error("{what} timed out after {}ms", timeout.as_millis())]
    ProbeTimeout { what: String, timeout: Duration },

    #[error("{what} aborted before reporting a result")]
    ProbeAborted { what: String },

    #[error("{0} is shutting down")]
    Shutdown(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// True for failures that the acquisition loop answers with another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatchError::ConnectFailed { .. }
                | WatchError::ReadFailed { .. }
                | WatchError::ProbeTimeout { .. }
                | WatchError::ProbeAborted { .. }
        )
    }
}

/// Render a caught panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
