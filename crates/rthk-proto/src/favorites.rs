//! Favorited episodes, kept as one JSON array on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub id: String,
    /// `{program_id}-{date}`, see `PlaybackRequest::episode_key`.
    pub episode_id: String,
    pub program_id: String,
    pub title: String,
    pub channel: String,
    pub added_at: DateTime<Utc>,
    /// Position in seconds the episode was last left at.
    #[serde(default)]
    pub last_played_time: Option<f64>,
}

/// What a client sends to add a favorite.  Id and timestamp are assigned here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFavorite {
    pub episode_id: String,
    pub program_id: String,
    pub title: String,
    pub channel: String,
}

pub struct FavoritesStore {
    items: Vec<Favorite>,
    path: PathBuf,
}

impl FavoritesStore {
    /// A missing or unreadable file starts an empty list.
    pub fn load(path: PathBuf) -> Self {
        let items = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("favorites: ignoring corrupt {}: {}", path.display(), e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self { items, path }
    }

    pub fn list(&self) -> &[Favorite] {
        &self.items
    }

    /// Returns the stored favorite.  Adding an episode twice keeps the first entry.
    pub fn add(&mut self, new: NewFavorite) -> &Favorite {
        if let Some(idx) = self.position(&new.episode_id) {
            return &self.items[idx];
        }
        self.items.push(Favorite {
            id: uuid::Uuid::new_v4().to_string(),
            episode_id: new.episode_id,
            program_id: new.program_id,
            title: new.title,
            channel: new.channel,
            added_at: Utc::now(),
            last_played_time: None,
        });
        &self.items[self.items.len() - 1]
    }

    /// Remove by favorite id.  Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|f| f.id != id);
        self.items.len() != before
    }

    pub fn is_favorite(&self, episode_id: &str) -> bool {
        self.position(episode_id).is_some()
    }

    pub fn get(&self, episode_id: &str) -> Option<&Favorite> {
        self.items.iter().find(|f| f.episode_id == episode_id)
    }

    /// Record where a favorited episode was left.  Returns false if the
    /// episode is not a favorite.
    pub fn update_progress(&mut self, episode_id: &str, secs: f64) -> bool {
        if !secs.is_finite() || secs < 0.0 {
            return false;
        }
        match self.items.iter_mut().find(|f| f.episode_id == episode_id) {
            Some(f) => {
                f.last_played_time = Some(secs);
                true
            }
            None => false,
        }
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.items)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    fn position(&self, episode_id: &str) -> Option<usize> {
        self.items.iter().position(|f| f.episode_id == episode_id)
    }
}
