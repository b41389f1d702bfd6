use rthk_playback::{PlaybackRequest, PlaybackSnapshot};
use serde::{Deserialize, Serialize};

use crate::favorites::{Favorite, NewFavorite};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Messages sent from a UI client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Play a live channel or an archived episode.
    Start { request: PlaybackRequest },
    /// Replace whatever is playing.  Same effect as `Start`, kept separate so
    /// logs show intent.
    Supersede { request: PlaybackRequest },
    Pause,
    Resume,
    TogglePause,
    Seek { seconds: f64 },
    SeekRelative { seconds: f64 },
    Stop,
    Volume { value: f32 },
    /// Restart the request that was playing when the daemon last shut down.
    PlayLast,
    GetSnapshot,
    ListFavorites,
    AddFavorite { favorite: NewFavorite },
    RemoveFavorite { id: String },
}

/// Messages sent from the daemon to UI clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect.
    Hello {
        protocol_version: u32,
        snapshot: PlaybackSnapshot,
    },
    Snapshot {
        data: PlaybackSnapshot,
    },
    Favorites {
        items: Vec<Favorite>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_FRAME_LEN {
            anyhow::bail!("Message of {} bytes exceeds frame limit", json.len());
        }
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        let Some(len) = frame_len(data)? else {
            anyhow::bail!("Insufficient data for length header");
        };
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

/// Payload length announced by the header at the start of `data`, or `None`
/// if the header is incomplete.
pub fn frame_len(data: &[u8]) -> anyhow::Result<Option<usize>> {
    if data.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Frame of {} bytes exceeds limit", len);
    }
    Ok(Some(len))
}
