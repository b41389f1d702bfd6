//! Playback session controller: the failover state machine.
//!
//! ```text
//!   start / supersede ─► resolve ─► Loading(candidate 0)
//!                                     │ ready            │ fatal error
//!                                     ▼                  ▼
//!                             Playing ⇄ Paused ──► Recovering
//!                                                   ├─ next mirror  ─► Loading(i + 1)
//!                                                   ├─ retry cycle  ─► (backoff) Loading(0)
//!                                                   └─ exhausted    ─► Failed
//! ```
//!
//! Every load runs on a fresh transport binding tagged with a new
//! [`Generation`].  Events whose generation is not the attached binding are
//! dropped before they touch the session, so a slow error from a torn-down
//! stream cannot corrupt the one that replaced it.
//!
//! The controller never sleeps.  A retry cycle is handed to the host as a
//! [`ScheduledRetry`]; the host calls [`PlaybackController::retry_due`] once
//! the delay has passed.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{FailureKind, PlaybackError};
use crate::request::PlaybackRequest;
use crate::resolver::SourceResolver;
use crate::session::{PlaybackPolicy, PlaybackSession, PlaybackSnapshot, PlaybackStatus};
use crate::transport::{Generation, TransportAdapter, TransportEvent, TransportEventKind};

/// Backoff the host must wait out before calling `retry_due(generation)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledRetry {
    pub generation: Generation,
    pub delay: Duration,
}

enum Recovery {
    /// Load the (already advanced) candidate now.
    Reload,
    /// A retry cycle was scheduled.
    Wait,
    Failed,
}

pub struct PlaybackController<T: TransportAdapter> {
    resolver: SourceResolver,
    transport: T,
    policy: PlaybackPolicy,
    session: Option<PlaybackSession>,
    /// Last generation handed out.
    last_generation: u64,
    /// Generation of the attached binding, if any.
    binding: Option<Generation>,
    /// Token of the retry we are waiting on.
    pending_retry: Option<Generation>,
    /// Retry scheduled but not yet collected by the host.
    scheduled: Option<ScheduledRetry>,
    rev: u64,
    volume: f32,
    last_error: Option<String>,
    /// Sessions that ended in `Failed` so far.
    failures: u64,
}

impl<T: TransportAdapter> PlaybackController<T> {
    pub fn new(resolver: SourceResolver, transport: T, policy: PlaybackPolicy) -> Self {
        Self {
            resolver,
            transport,
            policy,
            session: None,
            last_generation: 0,
            binding: None,
            pending_retry: None,
            scheduled: None,
            rev: 0,
            volume: 1.0,
            last_error: None,
            failures: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.resolver
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(PlaybackStatus::Idle)
    }

    /// Number of sessions that have ended in `Failed`.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Generation of the currently attached binding.
    pub fn generation(&self) -> Option<Generation> {
        self.binding
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Begin playing `request`.  Any current session is torn down first.  An
    /// invalid request leaves the current session untouched.
    pub fn start(&mut self, request: PlaybackRequest) -> Result<(), PlaybackError> {
        let candidates = self.resolver.resolve(&request)?;

        self.release_binding();
        self.pending_retry = None;
        self.scheduled = None;
        self.last_error = None;

        info!(
            "playback: start {:?} with {} candidate(s), primary {}",
            request,
            candidates.len(),
            candidates.primary()
        );
        self.session = Some(PlaybackSession::new(request, candidates));
        self.begin_attempt();
        Ok(())
    }

    /// Replace whatever is playing with `request`.
    pub fn supersede(&mut self, request: PlaybackRequest) -> Result<(), PlaybackError> {
        if let Some(old) = self.session.as_ref() {
            debug!(
                "playback: superseding {:?} ({:?})",
                old.request, old.status
            );
        }
        self.start(request)
    }

    /// Tear down the binding and discard the session.
    pub fn stop(&mut self) {
        if self.session.is_none() && self.binding.is_none() {
            return;
        }
        info!("playback: stop");
        self.release_binding();
        self.session = None;
        self.pending_retry = None;
        self.scheduled = None;
        self.last_error = None;
        self.touch();
    }

    pub fn pause(&mut self) {
        if self.status() != PlaybackStatus::Playing {
            debug!("playback: pause ignored in {:?}", self.status());
            return;
        }
        if let Err(e) = self.transport.pause() {
            warn!("playback: transport pause failed: {}", e);
        }
        self.set_status(PlaybackStatus::Paused);
    }

    /// Resuming an episode that played to its end starts it over.
    pub fn resume(&mut self) {
        if self.status() != PlaybackStatus::Paused {
            debug!("playback: resume ignored in {:?}", self.status());
            return;
        }
        if self.session.as_ref().is_some_and(|s| s.ended) {
            self.reload_at(0.0);
            return;
        }
        if let Err(e) = self.transport.play() {
            warn!("playback: transport play failed: {}", e);
        }
        self.set_status(PlaybackStatus::Playing);
    }

    pub fn toggle_pause(&mut self) {
        match self.status() {
            PlaybackStatus::Playing => self.pause(),
            PlaybackStatus::Paused => self.resume(),
            other => debug!("playback: toggle ignored in {:?}", other),
        }
    }

    /// Seek within an episode.  Clamped to `[0, duration]`, or just floored
    /// at zero while the duration is unknown.  The position is updated before
    /// the transport confirms.  An episode that already ended has been
    /// unloaded, so the current candidate is loaded again at the target.
    pub fn seek(&mut self, offset_secs: f64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.status.is_active() || session.request.is_live() || !offset_secs.is_finite() {
            debug!(
                "playback: seek to {} ignored in {:?}",
                offset_secs, session.status
            );
            return;
        }
        let target = match session.duration_secs {
            Some(d) => offset_secs.clamp(0.0, d),
            None => offset_secs.max(0.0),
        };
        if session.ended {
            self.reload_at(target);
            return;
        }
        session.position_secs = target;
        session.observed_position_secs = Some(target);
        if let Err(e) = self.transport.seek(target) {
            warn!("playback: transport seek failed: {}", e);
        }
        self.touch();
    }

    pub fn seek_relative(&mut self, delta_secs: f64) {
        if let Some(position) = self.session.as_ref().map(|s| s.position_secs) {
            self.seek(position + delta_secs);
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        if let Err(e) = self.transport.set_volume(self.volume) {
            warn!("playback: transport volume failed: {}", e);
        }
        self.touch();
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Hand out the retry scheduled by the last transition, if any.
    pub fn take_scheduled_retry(&mut self) -> Option<ScheduledRetry> {
        self.scheduled.take()
    }

    /// The backoff for `generation` has elapsed.  Stale tokens are ignored.
    pub fn retry_due(&mut self, generation: Generation) {
        if self.pending_retry != Some(generation) {
            debug!("playback: stale retry {} ignored", generation);
            return;
        }
        self.pending_retry = None;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.status != PlaybackStatus::Recovering {
            return;
        }
        info!(
            "playback: retry cycle {}/{} from candidate 0",
            session.retry_count, self.policy.max_retries
        );
        session.candidate_index = 0;
        self.begin_attempt();
    }

    // ── transport events ──────────────────────────────────────────────────────

    /// Single entry point for everything the transport reports.  Always leaves
    /// the controller in a valid state.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.binding != Some(event.generation) {
            debug!(
                "playback: dropping {:?} from stale binding {} (current {:?})",
                event.kind, event.generation, self.binding
            );
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event.kind {
            TransportEventKind::Ready { duration_secs } => {
                if session.status != PlaybackStatus::Loading {
                    return;
                }
                // The measured duration wins over listing metadata.
                if let Some(d) = duration_secs.filter(|d| d.is_finite() && *d > 0.0) {
                    session.duration_secs = Some(d);
                }
                session.status = PlaybackStatus::Playing;
                info!("playback: ready on {}", session.current_url());
                if let Err(e) = self.transport.play() {
                    warn!("playback: transport play failed: {}", e);
                    self.handle_fatal(e.failure_kind());
                    return;
                }
                self.touch();
            }
            TransportEventKind::TimeUpdate { position_secs } => {
                if !session.status.is_active() || !position_secs.is_finite() {
                    return;
                }
                session.position_secs = position_secs;
                if let Some(mark) = session.stall_mark_secs {
                    if position_secs - mark >= self.policy.stall_reset_secs {
                        debug!("playback: stable since {:.0}s, stall count cleared", mark);
                        session.stall_count = 0;
                        session.stall_mark_secs = None;
                    }
                }
                if !session.request.is_live() {
                    session.observed_position_secs = Some(position_secs);
                }
                self.touch();
            }
            TransportEventKind::Stalled => {
                session.stall_count += 1;
                session.stall_mark_secs = Some(session.position_secs);
                debug!(
                    "playback: stall {}/{}",
                    session.stall_count, self.policy.stall_threshold
                );
                if session.stall_count > self.policy.stall_threshold {
                    warn!("playback: too many stalls, treating as fatal");
                    self.handle_fatal(FailureKind::Network);
                }
            }
            TransportEventKind::DurationChanged { duration_secs } => {
                if session.request.is_live()
                    || !duration_secs.is_finite()
                    || duration_secs <= 0.0
                    || session.duration_secs == Some(duration_secs)
                {
                    return;
                }
                debug!("playback: duration now {:.1}s", duration_secs);
                session.duration_secs = Some(duration_secs);
                self.touch();
            }
            TransportEventKind::FatalError(kind) => self.handle_fatal(kind),
            TransportEventKind::Ended => {
                if session.request.is_live() {
                    // A live stream has no end; the connection dropped.
                    self.handle_fatal(FailureKind::Network);
                } else if session.status.is_active() {
                    if let Some(d) = session.duration_secs {
                        session.position_secs = d;
                    }
                    session.status = PlaybackStatus::Paused;
                    session.ended = true;
                    info!("playback: episode ended");
                    self.touch();
                }
            }
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let Some(session) = self.session.as_ref() else {
            return PlaybackSnapshot {
                rev: self.rev,
                volume: self.volume,
                ..PlaybackSnapshot::default()
            };
        };
        let (title, subtitle) = self.display_labels(&session.request);
        PlaybackSnapshot {
            rev: self.rev,
            status: session.status,
            request: Some(session.request.clone()),
            title,
            subtitle,
            current_url: Some(session.current_url().to_string()),
            candidate_index: session.candidate_index,
            candidate_count: session.candidates.len(),
            retry_count: session.retry_count,
            position_secs: session.position_secs,
            duration_secs: session.duration_secs,
            volume: self.volume,
            last_error: self.last_error.clone(),
        }
    }

    // ── internals ─────────────────────────────────────────────────────────────

    /// Load the current candidate on a fresh binding.  A load the transport
    /// rejects outright goes through the same recovery path as an
    /// asynchronous fatal error.
    fn begin_attempt(&mut self) {
        loop {
            let resume = self.policy.resume;
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let url = session.current_url().to_string();
            let seek_hint = match session.reload_offset_secs.take() {
                Some(offset) => (offset > 0.0).then_some(offset),
                None => session.load_offset(resume),
            };
            session.status = PlaybackStatus::Loading;
            session.stall_count = 0;
            session.stall_mark_secs = None;
            session.ended = false;
            session.attempts += 1;
            if let Some(offset) = seek_hint {
                session.position_secs = offset;
            } else if session.request.is_live() {
                session.position_secs = 0.0;
            }
            let idx = session.candidate_index;

            let result = self
                .bind()
                .and_then(|g| self.transport.load(&url, seek_hint).map(|()| g));
            self.touch();

            match result {
                Ok(generation) => {
                    info!(
                        "playback: loading candidate {} ({}) on {} seek={:?}",
                        idx, url, generation, seek_hint
                    );
                    return;
                }
                Err(e) => {
                    warn!("playback: load of {} rejected: {}", url, e);
                    match self.recover(e.failure_kind()) {
                        Recovery::Reload => continue,
                        Recovery::Wait | Recovery::Failed => return,
                    }
                }
            }
        }
    }

    /// Load the current candidate again from `offset_secs`.
    fn reload_at(&mut self, offset_secs: f64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        info!("playback: reloading {} at {:.1}s", session.current_url(), offset_secs);
        session.position_secs = offset_secs;
        session.observed_position_secs = Some(offset_secs);
        session.reload_offset_secs = Some(offset_secs);
        self.begin_attempt();
    }

    fn handle_fatal(&mut self, kind: FailureKind) {
        if let Recovery::Reload = self.recover(kind) {
            self.begin_attempt();
        }
    }

    /// Mirror first, then a delayed full cycle, then give up.
    fn recover(&mut self, kind: FailureKind) -> Recovery {
        self.release_binding();
        let failed_generation = Generation(self.last_generation);
        let Some(session) = self.session.as_mut() else {
            return Recovery::Failed;
        };
        let failure = match kind {
            FailureKind::MediaDecode => PlaybackError::MediaDecode(session.current_url().into()),
            // Unclassified failures are retried like network ones.
            FailureKind::Network | FailureKind::Unknown => {
                PlaybackError::Network(session.current_url().into())
            }
        };
        warn!(
            "playback: candidate {}/{} failed: {}",
            session.candidate_index + 1,
            session.candidates.len(),
            failure
        );
        session.status = PlaybackStatus::Recovering;

        let recovery = if session.candidate_index + 1 < session.candidates.len() {
            session.candidate_index += 1;
            Recovery::Reload
        } else if session.retry_count < self.policy.max_retries {
            session.retry_count += 1;
            let delay = self.policy.backoff(session.retry_count);
            info!(
                "playback: all candidates failed, retry {}/{} in {:?}",
                session.retry_count, self.policy.max_retries, delay
            );
            self.pending_retry = Some(failed_generation);
            self.scheduled = Some(ScheduledRetry {
                generation: failed_generation,
                delay,
            });
            Recovery::Wait
        } else {
            session.status = PlaybackStatus::Failed;
            let err = PlaybackError::Exhausted {
                cause: kind,
                attempts: session.attempts,
            };
            warn!("playback: {}", err);
            self.last_error = Some(err.to_string());
            self.failures += 1;
            Recovery::Failed
        };
        self.touch();
        recovery
    }

    /// Detach the current binding (if any) and attach a new one.
    fn bind(&mut self) -> Result<Generation, crate::error::TransportError> {
        self.release_binding();
        self.last_generation += 1;
        let generation = Generation(self.last_generation);
        self.transport.attach(generation)?;
        self.binding = Some(generation);
        Ok(generation)
    }

    fn release_binding(&mut self) {
        if let Some(generation) = self.binding.take() {
            debug!("playback: detaching {}", generation);
            self.transport.detach();
        }
    }

    fn set_status(&mut self, status: PlaybackStatus) {
        if let Some(session) = self.session.as_mut() {
            if session.status != status {
                debug!("playback: {:?} -> {:?}", session.status, status);
                session.status = status;
                self.touch();
            }
        }
    }

    fn touch(&mut self) {
        self.rev += 1;
    }

    fn display_labels(&self, request: &PlaybackRequest) -> (String, String) {
        match request {
            PlaybackRequest::Live { channel_id } => match self.resolver.catalog().get(channel_id) {
                Some(ch) => (ch.name.clone(), ch.description.clone()),
                None => (channel_id.clone(), String::new()),
            },
            PlaybackRequest::Episode {
                program_id,
                date,
                title,
                ..
            } => (
                title.clone().unwrap_or_else(|| program_id.clone()),
                date.format("%Y-%m-%d").to_string(),
            ),
        }
    }
}

impl<T: TransportAdapter> Drop for PlaybackController<T> {
    fn drop(&mut self) {
        self.release_binding();
    }
}
