use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PlaybackError;

/// What the user asked to hear.  Replaced wholesale on every new request;
/// everything downstream (resume offset, live edge restarts, duration source)
/// switches on the variant instead of re-deriving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PlaybackRequest {
    Live {
        channel_id: String,
    },
    Episode {
        channel_id: String,
        program_id: String,
        /// Broadcast date of the archived episode.
        date: NaiveDate,
        #[serde(default)]
        start_offset_secs: f64,
        /// Duration from listing metadata.  Often wrong; the transport's
        /// measured duration replaces it once known.
        #[serde(default)]
        known_duration_secs: Option<f64>,
        #[serde(default)]
        title: Option<String>,
    },
}

impl PlaybackRequest {
    pub fn live(channel_id: impl Into<String>) -> Self {
        PlaybackRequest::Live {
            channel_id: channel_id.into(),
        }
    }

    pub fn episode(
        channel_id: impl Into<String>,
        program_id: impl Into<String>,
        date: NaiveDate,
        start_offset_secs: f64,
    ) -> Self {
        PlaybackRequest::Episode {
            channel_id: channel_id.into(),
            program_id: program_id.into(),
            date,
            start_offset_secs,
            known_duration_secs: None,
            title: None,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            PlaybackRequest::Live { channel_id } | PlaybackRequest::Episode { channel_id, .. } => {
                channel_id
            }
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, PlaybackRequest::Live { .. })
    }

    /// Requested start offset.  Always `None` for live streams.
    pub fn start_offset_secs(&self) -> Option<f64> {
        match self {
            PlaybackRequest::Live { .. } => None,
            PlaybackRequest::Episode {
                start_offset_secs, ..
            } => Some(*start_offset_secs),
        }
    }

    pub fn known_duration_secs(&self) -> Option<f64> {
        match self {
            PlaybackRequest::Live { .. } => None,
            PlaybackRequest::Episode {
                known_duration_secs,
                ..
            } => *known_duration_secs,
        }
    }

    /// Same request resuming at `secs`.  Live requests are returned unchanged.
    pub fn with_start_offset(mut self, secs: f64) -> Self {
        if let PlaybackRequest::Episode {
            start_offset_secs, ..
        } = &mut self
        {
            if secs.is_finite() {
                *start_offset_secs = secs.max(0.0);
            }
        }
        self
    }

    /// Identifier favorites and progress tracking use for an archived episode
    /// (`"{program}-{YYYY-MM-DD}"`).
    pub fn episode_key(&self) -> Option<String> {
        match self {
            PlaybackRequest::Live { .. } => None,
            PlaybackRequest::Episode {
                program_id, date, ..
            } => Some(format!("{}-{}", program_id, date.format("%Y-%m-%d"))),
        }
    }

    /// Structural checks only.  Whether a live channel exists is the
    /// resolver's call since it owns the catalog.
    pub fn validate(&self) -> Result<(), PlaybackError> {
        check_id("channel id", self.channel_id())?;
        if let PlaybackRequest::Episode {
            program_id,
            start_offset_secs,
            known_duration_secs,
            ..
        } = self
        {
            check_id("program id", program_id)?;
            if !start_offset_secs.is_finite() || *start_offset_secs < 0.0 {
                return Err(PlaybackError::invalid(format!(
                    "start offset must be a non-negative number of seconds, got {}",
                    start_offset_secs
                )));
            }
            if let Some(d) = known_duration_secs {
                if !d.is_finite() || *d <= 0.0 {
                    return Err(PlaybackError::invalid(format!(
                        "known duration must be positive, got {}",
                        d
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_id(what: &str, id: &str) -> Result<(), PlaybackError> {
    if id.is_empty() {
        return Err(PlaybackError::invalid(format!("missing {}", what)));
    }
    if id
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '%'))
    {
        return Err(PlaybackError::invalid(format!(
            "{} {:?} contains characters not allowed in a URL path segment",
            what, id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 8).unwrap()
    }

    #[test]
    fn episode_key_uses_dashed_date() {
        let req = PlaybackRequest::episode("radio1", "millennium", date(), 300.0);
        assert_eq!(req.episode_key().as_deref(), Some("millennium-2026-02-08"));
        assert_eq!(PlaybackRequest::live("radio1").episode_key(), None);
    }

    #[test]
    fn live_has_no_offset() {
        assert_eq!(PlaybackRequest::live("radio2").start_offset_secs(), None);
        let live = PlaybackRequest::live("radio2").with_start_offset(90.0);
        assert_eq!(live.start_offset_secs(), None);
    }

    #[test]
    fn with_start_offset_moves_the_resume_point() {
        let req = PlaybackRequest::episode("radio1", "millennium", date(), 300.0);
        assert_eq!(req.clone().with_start_offset(412.0).start_offset_secs(), Some(412.0));
        assert_eq!(req.clone().with_start_offset(-5.0).start_offset_secs(), Some(0.0));
        assert_eq!(req.with_start_offset(f64::NAN).start_offset_secs(), Some(300.0));
    }

    #[test]
    fn rejects_missing_and_malformed_fields() {
        assert!(PlaybackRequest::live("").validate().is_err());
        assert!(PlaybackRequest::episode("radio1", "", date(), 0.0)
            .validate()
            .is_err());
        assert!(PlaybackRequest::episode("radio1", "a/b", date(), 0.0)
            .validate()
            .is_err());
        assert!(PlaybackRequest::episode("radio1", "morning", date(), -1.0)
            .validate()
            .is_err());
        assert!(PlaybackRequest::episode("radio1", "morning", date(), f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn accepts_cjk_program_ids() {
        let req = PlaybackRequest::episode("radio2", "三五成群", date(), 0.0);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_known_duration() {
        let req = PlaybackRequest::Episode {
            channel_id: "radio1".into(),
            program_id: "morning".into(),
            date: date(),
            start_offset_secs: 0.0,
            known_duration_secs: Some(0.0),
            title: None,
        };
        assert!(matches!(
            req.validate(),
            Err(PlaybackError::InvalidRequest(_))
        ));
    }

    #[test]
    fn serde_tag_round_trips_through_json() {
        let json = r#"{"kind":"Episode","channel_id":"radio1","program_id":"millennium","date":"2026-02-08","start_offset_secs":300.0}"#;
        let req: PlaybackRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.start_offset_secs(), Some(300.0));
        assert_eq!(req.known_duration_secs(), None);
    }
}
