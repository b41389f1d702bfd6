//! Source resolution: playback request in, ranked stream URLs out.
//!
//! Pure and synchronous.  The same request against the same resolver always
//! yields the same list in the same order.

use serde::Serialize;

use crate::catalog::{ArchiveTemplate, Catalog};
use crate::error::PlaybackError;
use crate::request::PlaybackRequest;
use crate::transport::TransportCapabilities;

/// Ordered, never-empty list of candidate URLs, primary first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateList(Vec<String>);

impl CandidateList {
    /// Returns `None` for an empty list.  Duplicates are dropped, keeping the
    /// first (highest priority) occurrence.
    pub fn new(urls: Vec<String>) -> Option<Self> {
        let mut out: Vec<String> = Vec::with_capacity(urls.len());
        for url in urls {
            if !url.is_empty() && !out.contains(&url) {
                out.push(url);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Self(out))
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SourceResolver {
    catalog: Catalog,
    templates: Vec<ArchiveTemplate>,
    capabilities: TransportCapabilities,
}

impl SourceResolver {
    pub fn new(
        catalog: Catalog,
        templates: Vec<ArchiveTemplate>,
        capabilities: TransportCapabilities,
    ) -> Self {
        Self {
            catalog,
            templates,
            capabilities,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    pub fn resolve(&self, request: &PlaybackRequest) -> Result<CandidateList, PlaybackError> {
        request.validate()?;
        match request {
            PlaybackRequest::Live { channel_id } => self.resolve_live(channel_id),
            PlaybackRequest::Episode {
                channel_id,
                program_id,
                date,
                ..
            } => {
                let date = date.format("%Y%m%d").to_string();
                let urls = self
                    .templates
                    .iter()
                    .map(|t| t.expand(channel_id, program_id, &date))
                    .collect();
                CandidateList::new(urls).ok_or_else(|| {
                    PlaybackError::invalid("no archive URL templates configured")
                })
            }
        }
    }

    fn resolve_live(&self, channel_id: &str) -> Result<CandidateList, PlaybackError> {
        let channel = self
            .catalog
            .get(channel_id)
            .ok_or_else(|| PlaybackError::invalid(format!("unknown channel {:?}", channel_id)))?;

        let segmented = self.capabilities.segmented_streaming;
        let mut urls = Vec::with_capacity(1 + channel.mirrors.len());
        urls.push(if segmented {
            channel.hls_url.clone()
        } else {
            channel.direct_url.clone()
        });

        // Stable sort keeps configuration order within a tier.
        let mut mirrors: Vec<_> = channel
            .mirrors
            .iter()
            .filter(|m| segmented || !m.is_segmented())
            .collect();
        mirrors.sort_by_key(|m| m.tier);
        urls.extend(mirrors.into_iter().map(|m| m.url.clone()));

        CandidateList::new(urls)
            .ok_or_else(|| PlaybackError::invalid(format!("channel {:?} has no stream URL", channel_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{builtin_archive_templates, CdnTier, Channel, Mirror};
    use chrono::NaiveDate;

    fn resolver(segmented: bool) -> SourceResolver {
        let mut channels = crate::catalog::builtin_channels();
        channels.push(Channel {
            id: "mirrored".into(),
            name: "Mirrored".into(),
            hls_url: "https://a.example/live/master.m3u8".into(),
            direct_url: "https://a.example/live.mp3".into(),
            mirrors: vec![
                Mirror {
                    url: "https://c.example/live.mp3".into(),
                    tier: CdnTier::Tertiary,
                },
                Mirror {
                    url: "https://b.example/live/master.m3u8".into(),
                    tier: CdnTier::Secondary,
                },
                Mirror {
                    url: "https://p.example/live.aac".into(),
                    tier: CdnTier::Primary,
                },
            ],
            ..Channel::default()
        });
        SourceResolver::new(
            Catalog::new(channels),
            builtin_archive_templates(),
            TransportCapabilities {
                segmented_streaming: segmented,
            },
        )
    }

    #[test]
    fn live_without_mirrors_is_exactly_the_canonical_url() {
        let list = resolver(true).resolve(&PlaybackRequest::live("radio2")).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.primary().ends_with("master.m3u8"));
    }

    #[test]
    fn live_falls_back_to_direct_url_without_segmented_support() {
        let list = resolver(false).resolve(&PlaybackRequest::live("radio1")).unwrap();
        assert_eq!(list.primary(), "https://stream.rthk.hk/radio1live");
    }

    #[test]
    fn mirrors_follow_cdn_tier_order() {
        let list = resolver(true)
            .resolve(&PlaybackRequest::live("mirrored"))
            .unwrap();
        let urls: Vec<_> = list.iter().collect();
        assert_eq!(
            urls,
            vec![
                "https://a.example/live/master.m3u8",
                "https://p.example/live.aac",
                "https://b.example/live/master.m3u8",
                "https://c.example/live.mp3",
            ]
        );
    }

    #[test]
    fn segmented_mirrors_are_skipped_without_segmented_support() {
        let list = resolver(false)
            .resolve(&PlaybackRequest::live("mirrored"))
            .unwrap();
        let urls: Vec<_> = list.iter().collect();
        assert_eq!(
            urls,
            vec![
                "https://a.example/live.mp3",
                "https://p.example/live.aac",
                "https://c.example/live.mp3",
            ]
        );
    }

    #[test]
    fn unknown_live_channel_is_invalid() {
        let err = resolver(true)
            .resolve(&PlaybackRequest::live("radio9"))
            .unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidRequest(_)));
    }

    #[test]
    fn episode_expands_every_template_in_order() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 8).unwrap();
        let req = PlaybackRequest::episode("radio1", "millennium", date, 300.0);
        let list = resolver(true).resolve(&req).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(
            list.primary(),
            "https://rthkaod2022.akamaized.net/m4a/radio/archive/radio1/millennium/m4a/20260208.m4a/index_0_a.m3u8"
        );
        assert_eq!(
            list.get(2),
            Some("https://rthkaod2022.akamaized.net/m4a/radio/radio1/millennium/20260208.m4a/index_0_a.m3u8")
        );
    }

    #[test]
    fn candidate_list_rejects_empty_and_dedups() {
        assert!(CandidateList::new(vec![]).is_none());
        assert!(CandidateList::new(vec![String::new()]).is_none());
        let list = CandidateList::new(vec!["a".into(), "b".into(), "a".into()]).unwrap();
        assert_eq!(list.len(), 2);
    }
}
