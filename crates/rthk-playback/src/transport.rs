//! The boundary between the controller and whatever actually plays a URL.
//!
//! Commands are fire-and-forget.  Results come back later as
//! [`TransportEvent`]s tagged with the [`Generation`] of the binding that
//! produced them; the controller never polls the transport for readiness.

use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, TransportError};

/// Identifies one attach/detach cycle of the transport.  Strictly increasing
/// over the controller's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Can play HLS playlists natively or through a segmented-streaming library.
    pub segmented_streaming: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            segmented_streaming: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEventKind {
    /// Media is loaded and can start.  Carries the measured duration when the
    /// transport knows one.
    Ready { duration_secs: Option<f64> },
    TimeUpdate { position_secs: f64 },
    /// The transport learned a better duration after `Ready`.
    DurationChanged { duration_secs: f64 },
    /// Buffering stall or another recoverable hiccup.
    Stalled,
    FatalError(FailureKind),
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    pub generation: Generation,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(generation: Generation, kind: TransportEventKind) -> Self {
        Self { generation, kind }
    }
}

pub trait TransportAdapter {
    fn capabilities(&self) -> TransportCapabilities;

    /// Bind to the output sink.  Every event produced until the matching
    /// `detach` must carry `generation`.
    fn attach(&mut self, generation: Generation) -> Result<(), TransportError>;

    /// Stop network activity and release decoder resources.  Must not fail.
    fn detach(&mut self);

    fn load(&mut self, url: &str, seek_hint_secs: Option<f64>) -> Result<(), TransportError>;

    fn play(&mut self) -> Result<(), TransportError>;

    fn pause(&mut self) -> Result<(), TransportError>;

    fn seek(&mut self, position_secs: f64) -> Result<(), TransportError>;

    fn set_volume(&mut self, _volume: f32) -> Result<(), TransportError> {
        Ok(())
    }
}
