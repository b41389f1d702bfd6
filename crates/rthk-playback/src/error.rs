use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a fatal transport failure came from.  Drives both the recovery path
/// and the wording of the message shown once every candidate is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailureKind {
    /// Mirror unreachable, timed out, or the stream dropped.
    Network,
    /// The transport rejected the stream content.
    MediaDecode,
    #[default]
    Unknown,
}

impl FailureKind {
    pub fn describe(self) -> &'static str {
        match self {
            FailureKind::Network => "network error",
            FailureKind::MediaDecode => "media decode error",
            FailureKind::Unknown => "unknown error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    /// Malformed request.  Caller error, never retried.
    #[error("invalid playback request: {0}")]
    InvalidRequest(String),

    #[error("stream unreachable: {0}")]
    Network(String),

    #[error("stream could not be decoded: {0}")]
    MediaDecode(String),

    /// Every mirror and every retry cycle failed.
    #[error("playback failed after {attempts} attempts ({})", cause.describe())]
    Exhausted { cause: FailureKind, attempts: u32 },
}

impl PlaybackError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PlaybackError::InvalidRequest(msg.into())
    }

    /// The failure origin this error is classified under, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PlaybackError::InvalidRequest(_) => None,
            PlaybackError::Network(_) => Some(FailureKind::Network),
            PlaybackError::MediaDecode(_) => Some(FailureKind::MediaDecode),
            PlaybackError::Exhausted { cause, .. } => Some(*cause),
        }
    }
}

/// Errors a transport may return synchronously from a command.  Asynchronous
/// failures arrive as `TransportEventKind::FatalError` instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Backend is gone (process died, channel closed).
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport command failed: {0}")]
    Command(String),
}

impl TransportError {
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_the_cause() {
        let err = PlaybackError::Exhausted {
            cause: FailureKind::Network,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "playback failed after 3 attempts (network error)"
        );
    }

    #[test]
    fn invalid_request_has_no_failure_origin() {
        assert_eq!(PlaybackError::invalid("empty id").failure_kind(), None);
        assert_eq!(
            PlaybackError::MediaDecode("bad aac".into()).failure_kind(),
            Some(FailureKind::MediaDecode)
        );
    }
}
