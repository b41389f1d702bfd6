use rthk_playback::{PlaybackRequest, PlaybackSnapshot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// What survives a daemon restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub last_request: Option<PlaybackRequest>,
    pub volume: f32,
}

impl PersistentState {
    fn with_volume(volume: f32) -> Self {
        Self {
            last_request: None,
            volume,
        }
    }
}

/// Holds the snapshot every client reads and the persisted player state.
/// Only the daemon core writes to it.
pub struct StateManager {
    snapshot: Arc<RwLock<PlaybackSnapshot>>,
    persistent: PersistentState,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, default_volume: f32) -> Self {
        let persistent = Self::load_persistent(&state_file)
            .unwrap_or_else(|| PersistentState::with_volume(default_volume));
        let snapshot = PlaybackSnapshot {
            volume: persistent.volume,
            ..PlaybackSnapshot::default()
        };
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
            persistent,
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<PlaybackSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub async fn get_snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Replace the shared snapshot.  Returns false when `rev` has not moved.
    pub async fn publish(&self, snapshot: PlaybackSnapshot) -> bool {
        let mut current = self.snapshot.write().await;
        if current.rev == snapshot.rev && current.rev != 0 {
            return false;
        }
        *current = snapshot;
        true
    }

    pub fn persistent(&self) -> &PersistentState {
        &self.persistent
    }

    pub fn last_request(&self) -> Option<&PlaybackRequest> {
        self.persistent.last_request.as_ref()
    }

    /// Update the persisted state, writing it out only if it changed.
    pub async fn remember(
        &mut self,
        last_request: Option<PlaybackRequest>,
        volume: f32,
    ) -> anyhow::Result<()> {
        let next = PersistentState {
            last_request: last_request.or_else(|| self.persistent.last_request.clone()),
            volume: volume.clamp(0.0, 1.0),
        };
        if next == self.persistent {
            return Ok(());
        }
        self.persistent = next;
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> Option<PersistentState> {
        let content = std::fs::read_to_string(state_file).ok()?;
        serde_json::from_str::<PersistentState>(&content).ok()
    }
}
