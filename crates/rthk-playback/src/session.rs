use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::PlaybackRequest;
use crate::resolver::CandidateList;

/// Transitions:
///   Idle -> Loading -> Playing <-> Paused
///   Loading | Playing | Paused -> Recovering -> Loading | Failed
/// `Failed` is terminal until a new request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    /// A candidate just failed; the next one (or a retry) is pending.
    Recovering,
    Failed,
}

impl PlaybackStatus {
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackStatus::Playing | PlaybackStatus::Paused)
    }
}

/// Where an episode resumes after a mirror switch or a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Last position observed while playing, else the requested offset.
    #[default]
    LastObserved,
    /// Always the offset the request asked for.
    RequestedOffset,
}

/// Recovery tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackPolicy {
    /// Full mirror-cycle restarts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff: retry `n` waits `n * backoff_step_secs`.
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: f64,
    /// Stalls tolerated on one binding before it counts as fatal.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    /// Seconds of uninterrupted progress after a stall that clear the stall count.
    #[serde(default = "default_stall_reset_secs")]
    pub stall_reset_secs: f64,
    #[serde(default)]
    pub resume: ResumePolicy,
}

impl PlaybackPolicy {
    pub fn backoff(&self, retry_count: u32) -> Duration {
        Duration::from_secs_f64((self.backoff_step_secs * retry_count as f64).max(0.0))
    }
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_step_secs: default_backoff_step_secs(),
            stall_threshold: default_stall_threshold(),
            stall_reset_secs: default_stall_reset_secs(),
            resume: ResumePolicy::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_step_secs() -> f64 {
    1.0
}

fn default_stall_threshold() -> u32 {
    3
}

fn default_stall_reset_secs() -> f64 {
    60.0
}

/// State of the request currently being played.  Owned by the controller;
/// everyone else reads a [`PlaybackSnapshot`].
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub request: PlaybackRequest,
    pub candidates: CandidateList,
    pub candidate_index: usize,
    /// Full mirror cycles restarted so far.
    pub retry_count: u32,
    pub status: PlaybackStatus,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    pub(crate) stall_count: u32,
    /// Position at the most recent stall.
    pub(crate) stall_mark_secs: Option<f64>,
    /// The episode played to its end and the transport has unloaded it.
    pub(crate) ended: bool,
    /// Exact offset for the next load, ahead of the resume policy.
    pub(crate) reload_offset_secs: Option<f64>,
    /// Position last reported by the transport while playing (or set by a seek).
    pub(crate) observed_position_secs: Option<f64>,
    /// Number of loads issued, across all candidates and cycles.
    pub(crate) attempts: u32,
}

impl PlaybackSession {
    pub(crate) fn new(request: PlaybackRequest, candidates: CandidateList) -> Self {
        let duration_secs = request.known_duration_secs();
        let position_secs = request.start_offset_secs().unwrap_or(0.0);
        Self {
            request,
            candidates,
            candidate_index: 0,
            retry_count: 0,
            status: PlaybackStatus::Idle,
            position_secs,
            duration_secs,
            stall_count: 0,
            stall_mark_secs: None,
            ended: false,
            reload_offset_secs: None,
            observed_position_secs: None,
            attempts: 0,
        }
    }

    pub fn current_url(&self) -> &str {
        self.candidates
            .get(self.candidate_index)
            .unwrap_or_else(|| self.candidates.primary())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Offset handed to the next `load`.  Live streams always start at the
    /// live edge.
    pub fn load_offset(&self, resume: ResumePolicy) -> Option<f64> {
        let requested = self.request.start_offset_secs()?;
        let offset = match resume {
            ResumePolicy::LastObserved => self.observed_position_secs.unwrap_or(requested),
            ResumePolicy::RequestedOffset => requested,
        };
        (offset > 0.0).then_some(offset)
    }
}

/// Read-only view published to the UI after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlaybackSnapshot {
    /// Increases on every transition.
    pub rev: u64,
    pub status: PlaybackStatus,
    pub request: Option<PlaybackRequest>,
    pub title: String,
    pub subtitle: String,
    pub current_url: Option<String>,
    pub candidate_index: usize,
    pub candidate_count: usize,
    pub retry_count: u32,
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub volume: f32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn episode_session(offset: f64) -> PlaybackSession {
        let date = NaiveDate::from_ymd_opt(2026, 2, 8).unwrap();
        let req = PlaybackRequest::episode("radio1", "millennium", date, offset);
        let list = CandidateList::new(vec!["a".into(), "b".into()]).unwrap();
        PlaybackSession::new(req, list)
    }

    #[test]
    fn backoff_is_linear() {
        let policy = PlaybackPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
    }

    #[test]
    fn load_offset_prefers_observed_position() {
        let mut s = episode_session(300.0);
        assert_eq!(s.load_offset(ResumePolicy::LastObserved), Some(300.0));
        s.observed_position_secs = Some(412.5);
        assert_eq!(s.load_offset(ResumePolicy::LastObserved), Some(412.5));
        assert_eq!(s.load_offset(ResumePolicy::RequestedOffset), Some(300.0));
    }

    #[test]
    fn zero_offset_loads_from_the_start() {
        let s = episode_session(0.0);
        assert_eq!(s.load_offset(ResumePolicy::LastObserved), None);
    }

    #[test]
    fn live_sessions_never_carry_an_offset() {
        let list = CandidateList::new(vec!["a".into()]).unwrap();
        let mut s = PlaybackSession::new(PlaybackRequest::live("radio1"), list);
        s.observed_position_secs = Some(90.0);
        assert_eq!(s.load_offset(ResumePolicy::LastObserved), None);
    }
}
