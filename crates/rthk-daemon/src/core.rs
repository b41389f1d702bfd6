//! DaemonCore: the single owner of playback state.
//!
//! Architecture
//! ────────────
//! ```text
//!   socket clients ──┐
//!   mpv worker     ──┼──► mpsc::Sender<DaemonEvent> ──► DaemonCore::run()
//!   retry timers   ──┤                                      │
//!   heartbeat      ──┘                                      ├── PlaybackController
//!                                                           ├── StateManager  (snapshot + state.json)
//!                                                           ├── FavoritesStore
//!                                                           └── broadcast_tx  (snapshot / favorites / errors)
//! ```
//!
//! Nothing else mutates the session.  Backoff timers are plain sleeping tasks
//! that post `RetryDue` back into the queue; the controller decides whether
//! the token is still current.

use rthk_playback::{
    Generation, PlaybackController, PlaybackRequest, TransportAdapter, TransportEvent,
};
use rthk_proto::favorites::FavoritesStore;
use rthk_proto::protocol::Command;
use rthk_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::BroadcastMessage;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client.
    ClientCommand(Command),
    /// Translated transport event from the mpv worker.
    Transport(TransportEvent),
    /// A scheduled backoff elapsed.
    RetryDue(Generation),
    /// Periodic progress checkpoint.
    HeartbeatTick,
    Shutdown,
}

pub struct DaemonCore<T: TransportAdapter> {
    controller: PlaybackController<T>,
    state_manager: StateManager,
    favorites: FavoritesStore,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Handed to timer tasks so they can post back into our own queue.
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl<T: TransportAdapter> DaemonCore<T> {
    pub fn new(
        mut controller: PlaybackController<T>,
        state_manager: StateManager,
        favorites: FavoritesStore,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        controller.set_volume(state_manager.persistent().volume);
        Self {
            controller,
            state_manager,
            favorites,
            broadcast_tx,
            event_tx,
        }
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        self.sync().await;

        loop {
            let Some(evt) = event_rx.recv().await else {
                info!("DaemonCore: event channel closed, shutting down");
                break;
            };
            if matches!(evt, DaemonEvent::Shutdown) {
                info!("DaemonCore: shutdown requested");
                break;
            }
            self.handle_event(evt).await;
        }

        self.cleanup().await;
        Ok(())
    }

    /// Apply one event and publish the result.
    pub async fn handle_event(&mut self, evt: DaemonEvent) {
        let failures = self.controller.failures();
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("DaemonCore: command error: {}", e);
                    let _ = self.broadcast_tx.send(BroadcastMessage::Error(e.to_string()));
                }
            }
            DaemonEvent::Transport(event) => self.controller.handle_event(event),
            DaemonEvent::RetryDue(generation) => self.controller.retry_due(generation),
            DaemonEvent::HeartbeatTick => {
                if let Err(e) = self.checkpoint().await {
                    warn!("DaemonCore: checkpoint failed: {}", e);
                }
            }
            DaemonEvent::Shutdown => {}
        }
        // Loads rejected synchronously can exhaust a session outside a transport event.
        if self.controller.failures() > failures {
            if let Some(msg) = self.controller.snapshot().last_error {
                warn!("DaemonCore: playback failed: {}", msg);
                let _ = self.broadcast_tx.send(BroadcastMessage::Error(msg));
            }
        }
        self.sync().await;
    }

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Start { request } => self.play(request, false).await?,
            Command::Supersede { request } => self.play(request, true).await?,
            Command::Pause => self.controller.pause(),
            Command::Resume => self.controller.resume(),
            Command::TogglePause => self.controller.toggle_pause(),
            Command::Seek { seconds } => self.controller.seek(seconds),
            Command::SeekRelative { seconds } => self.controller.seek_relative(seconds),
            Command::Stop => {
                self.checkpoint().await?;
                self.controller.stop();
            }
            Command::Volume { value } => {
                self.controller.set_volume(value);
                self.state_manager
                    .remember(None, self.controller.volume())
                    .await?;
            }
            Command::PlayLast => {
                let Some(request) = self.state_manager.last_request().cloned() else {
                    anyhow::bail!("nothing played yet");
                };
                self.play(request, false).await?;
            }
            Command::GetSnapshot => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::ListFavorites => self.broadcast_favorites(),
            Command::AddFavorite { favorite } => {
                let added = self.favorites.add(favorite);
                debug!("DaemonCore: favorite {} ({})", added.id, added.episode_id);
                self.favorites.save().await?;
                self.broadcast_favorites();
            }
            Command::RemoveFavorite { id } => {
                if !self.favorites.remove(&id) {
                    anyhow::bail!("no favorite with id {}", id);
                }
                self.favorites.save().await?;
                self.broadcast_favorites();
            }
        }
        Ok(())
    }

    async fn play(&mut self, request: PlaybackRequest, supersede: bool) -> anyhow::Result<()> {
        // Progress of whatever is being replaced.
        if let Err(e) = self.checkpoint().await {
            warn!("DaemonCore: checkpoint before new request failed: {}", e);
        }
        let result = if supersede {
            self.controller.supersede(request.clone())
        } else {
            self.controller.start(request.clone())
        };
        result?;
        self.state_manager
            .remember(Some(request), self.controller.volume())
            .await
    }

    /// Persist where the current episode is, both as the resume point for
    /// `PlayLast` and on its favorite entry.
    async fn checkpoint(&mut self) -> anyhow::Result<()> {
        let Some(session) = self.controller.session() else {
            return Ok(());
        };
        if !session.status.is_active() {
            return Ok(());
        }
        let request = session.request.clone();
        let position = session.position_secs;

        if let Some(key) = request.episode_key() {
            if self.favorites.update_progress(&key, position) {
                self.favorites.save().await?;
            }
        }
        let resume = request.with_start_offset(position);
        self.state_manager
            .remember(Some(resume), self.controller.volume())
            .await
    }

    fn broadcast_favorites(&self) {
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Favorites(self.favorites.list().to_vec()));
    }

    /// Arm pending retry timers and push the snapshot if it moved.
    async fn sync(&mut self) {
        if let Some(retry) = self.controller.take_scheduled_retry() {
            debug!(
                "DaemonCore: retry {} in {:?}",
                retry.generation, retry.delay
            );
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(retry.delay).await;
                let _ = tx.send(DaemonEvent::RetryDue(retry.generation)).await;
            });
        }
        if self.state_manager.publish(self.controller.snapshot()).await {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn cleanup(&mut self) {
        info!("DaemonCore: cleanup");
        if let Err(e) = self.checkpoint().await {
            warn!("DaemonCore: final checkpoint failed: {}", e);
        }
        self.controller.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rthk_playback::catalog::{builtin_archive_templates, Catalog};
    use rthk_playback::{
        PlaybackPolicy, PlaybackStatus, SourceResolver, TransportCapabilities, TransportError,
        TransportEventKind,
    };
    use rthk_proto::favorites::NewFavorite;

    #[derive(Default)]
    struct NullTransport {
        attached: Option<Generation>,
        loads: Vec<(String, Option<f64>)>,
        reject_loads: bool,
    }

    impl TransportAdapter for NullTransport {
        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities::default()
        }
        fn attach(&mut self, generation: Generation) -> Result<(), TransportError> {
            self.attached = Some(generation);
            Ok(())
        }
        fn detach(&mut self) {
            self.attached = None;
        }
        fn load(&mut self, url: &str, seek_hint: Option<f64>) -> Result<(), TransportError> {
            self.loads.push((url.to_string(), seek_hint));
            if self.reject_loads {
                return Err(TransportError::Unavailable("mpv is gone".into()));
            }
            Ok(())
        }
        fn play(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn pause(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn seek(&mut self, _position_secs: f64) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct Harness {
        core: DaemonCore<NullTransport>,
        events: mpsc::Receiver<DaemonEvent>,
        broadcasts: broadcast::Receiver<BroadcastMessage>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with(NullTransport::default())
    }

    fn harness_with(transport: NullTransport) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SourceResolver::new(
            Catalog::builtin(),
            builtin_archive_templates(),
            TransportCapabilities::default(),
        );
        let controller =
            PlaybackController::new(resolver, transport, PlaybackPolicy::default());
        let state = StateManager::new(dir.path().join("state.json"), 0.8);
        let favorites = FavoritesStore::load(dir.path().join("favorites.json"));
        let (broadcast_tx, broadcasts) = broadcast::channel(64);
        let (event_tx, events) = mpsc::channel(16);
        Harness {
            core: DaemonCore::new(controller, state, favorites, broadcast_tx, event_tx),
            events,
            broadcasts,
            _dir: dir,
        }
    }

    fn episode() -> PlaybackRequest {
        let date = NaiveDate::from_ymd_opt(2026, 2, 8).unwrap();
        PlaybackRequest::episode("radio1", "millennium", date, 0.0)
    }

    async fn ready(h: &mut Harness) {
        let generation = h.core.controller.generation().unwrap();
        h.core
            .handle_event(DaemonEvent::Transport(TransportEvent::new(
                generation,
                TransportEventKind::Ready {
                    duration_secs: Some(3600.0),
                },
            )))
            .await;
    }

    fn drain(rx: &mut broadcast::Receiver<BroadcastMessage>) -> Vec<BroadcastMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn start_publishes_snapshot_and_remembers_request() {
        let mut h = harness();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Start {
                request: PlaybackRequest::live("radio2"),
            }))
            .await;

        let snap = h.core.state_manager().get_snapshot().await;
        assert_eq!(snap.status, PlaybackStatus::Loading);
        assert_eq!(snap.volume, 0.8);
        assert_eq!(
            h.core.state_manager().last_request(),
            Some(&PlaybackRequest::live("radio2"))
        );
        assert!(drain(&mut h.broadcasts)
            .iter()
            .any(|m| matches!(m, BroadcastMessage::StateUpdated)));
    }

    #[tokio::test]
    async fn invalid_request_is_reported_to_clients() {
        let mut h = harness();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Start {
                request: PlaybackRequest::live("radio9"),
            }))
            .await;
        let msgs = drain(&mut h.broadcasts);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, BroadcastMessage::Error(e) if e.contains("radio9"))));
        assert!(h.core.state_manager().last_request().is_none());
    }

    #[tokio::test]
    async fn play_last_without_history_is_an_error() {
        let mut h = harness();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::PlayLast))
            .await;
        assert!(drain(&mut h.broadcasts)
            .iter()
            .any(|m| matches!(m, BroadcastMessage::Error(_))));
        assert_eq!(h.core.controller.status(), PlaybackStatus::Idle);
    }

    #[tokio::test]
    async fn stop_records_progress_on_favorited_episode() {
        let mut h = harness();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::AddFavorite {
                favorite: NewFavorite {
                    episode_id: "millennium-2026-02-08".into(),
                    program_id: "millennium".into(),
                    title: "千禧年代".into(),
                    channel: "radio1".into(),
                },
            }))
            .await;
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Start {
                request: episode(),
            }))
            .await;
        ready(&mut h).await;
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Seek { seconds: 754.0 }))
            .await;
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Stop))
            .await;

        let fav = h.core.favorites.get("millennium-2026-02-08").unwrap();
        assert_eq!(fav.last_played_time, Some(754.0));
        assert_eq!(
            h.core
                .state_manager()
                .last_request()
                .and_then(|r| r.start_offset_secs()),
            Some(754.0)
        );
        assert_eq!(h.core.controller.status(), PlaybackStatus::Idle);
    }

    #[tokio::test]
    async fn remove_unknown_favorite_is_an_error() {
        let mut h = harness();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::RemoveFavorite {
                id: "nope".into(),
            }))
            .await;
        assert!(drain(&mut h.broadcasts)
            .iter()
            .any(|m| matches!(m, BroadcastMessage::Error(e) if e.contains("nope"))));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_posts_back_into_the_queue() {
        let mut h = harness();
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Start {
                request: PlaybackRequest::live("radio1"),
            }))
            .await;
        let generation = h.core.controller.generation().unwrap();
        h.core
            .handle_event(DaemonEvent::Transport(TransportEvent::new(
                generation,
                TransportEventKind::FatalError(rthk_playback::FailureKind::Network),
            )))
            .await;
        assert_eq!(h.core.controller.status(), PlaybackStatus::Recovering);

        let evt = h.events.recv().await.unwrap();
        let DaemonEvent::RetryDue(token) = evt else {
            panic!("expected RetryDue, got {:?}", evt);
        };
        h.core.handle_event(DaemonEvent::RetryDue(token)).await;
        assert_eq!(h.core.controller.status(), PlaybackStatus::Loading);
        assert_eq!(h.core.controller.transport().loads.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_rejected_retries_is_reported() {
        let mut h = harness_with(NullTransport {
            reject_loads: true,
            ..NullTransport::default()
        });
        h.core
            .handle_event(DaemonEvent::ClientCommand(Command::Start {
                request: PlaybackRequest::live("radio2"),
            }))
            .await;
        assert_eq!(h.core.controller.status(), PlaybackStatus::Recovering);
        drain(&mut h.broadcasts);

        let mut retries = 0;
        while h.core.controller.status() != PlaybackStatus::Failed {
            let evt = h.events.recv().await.unwrap();
            assert!(matches!(evt, DaemonEvent::RetryDue(_)), "got {:?}", evt);
            h.core.handle_event(evt).await;
            retries += 1;
            assert!(retries <= 5, "never gave up");
        }

        let errors: Vec<_> = drain(&mut h.broadcasts)
            .into_iter()
            .filter_map(|m| match m {
                BroadcastMessage::Error(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert!(errors[0].contains("playback failed"), "{}", errors[0]);
        assert_eq!(
            h.core.state_manager().get_snapshot().await.status,
            PlaybackStatus::Failed
        );
    }
}
