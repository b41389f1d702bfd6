//! Playback core: request resolution, mirror failover and session state.
//! Runtime-agnostic; the daemon drives it with a real transport.

pub mod catalog;
pub mod controller;
pub mod error;
pub mod request;
pub mod resolver;
pub mod session;
pub mod transport;

pub use controller::{PlaybackController, ScheduledRetry};
pub use error::{FailureKind, PlaybackError, TransportError};
pub use request::PlaybackRequest;
pub use resolver::{CandidateList, SourceResolver};
pub use session::{PlaybackPolicy, PlaybackSnapshot, PlaybackStatus, ResumePolicy};
pub use transport::{
    Generation, TransportAdapter, TransportCapabilities, TransportEvent, TransportEventKind,
};
