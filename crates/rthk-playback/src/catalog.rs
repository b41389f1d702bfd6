use serde::{Deserialize, Serialize};

/// CDN priority of a live mirror.  Ordering of the variants is the order in
/// which mirrors are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CdnTier {
    #[default]
    Primary,
    Secondary,
    Tertiary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    pub url: String,
    #[serde(default)]
    pub tier: CdnTier,
}

impl Mirror {
    pub fn is_segmented(&self) -> bool {
        is_segmented_url(&self.url)
    }
}

/// A live channel and the URLs it can be heard on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_en: String,
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub description: String,
    /// Canonical segmented (HLS) stream.
    pub hls_url: String,
    /// Single-file stream for transports without HLS support.
    pub direct_url: String,
    #[serde(default)]
    pub mirrors: Vec<Mirror>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    channels: Vec<Channel>,
}

impl Catalog {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn builtin() -> Self {
        Self::new(builtin_channels())
    }
}

pub fn builtin_channels() -> Vec<Channel> {
    vec![
        Channel {
            id: "radio1".into(),
            name: "第一台".into(),
            name_en: "Radio 1".into(),
            frequency: "FM 92.6MHz".into(),
            description: "新聞、財經、時事".into(),
            hls_url: "https://rthkradio1-live.akamaized.net/hls/live/2035313/radio1/master.m3u8"
                .into(),
            direct_url: "https://stream.rthk.hk/radio1live".into(),
            mirrors: Vec::new(),
        },
        Channel {
            id: "radio2".into(),
            name: "第二台".into(),
            name_en: "Radio 2".into(),
            frequency: "FM 94.8MHz".into(),
            description: "流行音樂、青年節目".into(),
            hls_url: "https://rthkradio2-live.akamaized.net/hls/live/2040078/radio2/master.m3u8"
                .into(),
            direct_url: "https://stream.rthk.hk/radio2live".into(),
            mirrors: Vec::new(),
        },
        Channel {
            id: "radio5".into(),
            name: "第五台".into(),
            name_en: "Radio 5".into(),
            frequency: "AM 783kHz".into(),
            description: "文化、教育、社區".into(),
            hls_url: "https://rthkradio5-live.akamaized.net/hls/live/2040081/radio5/master.m3u8"
                .into(),
            direct_url: "https://stream.rthk.hk/radio5live".into(),
            mirrors: Vec::new(),
        },
    ]
}

// ── archive URL templates ─────────────────────────────────────────────────────

/// URL template for an archived episode.  Placeholders: `{channel}`,
/// `{program}`, `{date}` (YYYYMMDD).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveTemplate(pub String);

impl ArchiveTemplate {
    pub fn expand(&self, channel: &str, program: &str, date: &str) -> String {
        self.0
            .replace("{channel}", &urlencoding::encode(channel))
            .replace("{program}", &urlencoding::encode(program))
            .replace("{date}", date)
    }
}

/// The archive is inconsistent about which path convention a given
/// program/date uses, so all known conventions are tried in this order.
pub fn builtin_archive_templates() -> Vec<ArchiveTemplate> {
    [
        "https://rthkaod2022.akamaized.net/m4a/radio/archive/{channel}/{program}/m4a/{date}.m4a/index_0_a.m3u8",
        "https://rthkaod2022.akamaized.net/m4a/radio/archive/{channel}/{program}/m4a/{date}.m4a/master.m3u8",
        "https://rthkaod2022.akamaized.net/m4a/radio/{channel}/{program}/{date}.m4a/index_0_a.m3u8",
    ]
    .into_iter()
    .map(|t| ArchiveTemplate(t.to_string()))
    .collect()
}

pub fn is_segmented_url(url: &str) -> bool {
    url.to_ascii_lowercase().contains(".m3u8")
}

// ── TOML channel loader ───────────────────────────────────────────────────────

/// Matches the `[[channel]]` tables of a channels file.  Kept apart from
/// `Channel` so the file schema can stay lenient.
#[derive(Debug, Deserialize)]
struct TomlChannelFile {
    channel: Vec<TomlChannel>,
}

#[derive(Debug, Deserialize)]
struct TomlChannel {
    id: String,
    name: String,
    #[serde(default)]
    name_en: String,
    #[serde(default)]
    frequency: String,
    #[serde(default)]
    description: String,
    hls_url: String,
    #[serde(default)]
    direct_url: String,
    #[serde(default)]
    mirrors: Vec<Mirror>,
}

pub fn load_channels_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<Channel>> {
    let content = std::fs::read_to_string(path)?;
    parse_channels_from_toml_str(&content)
}

pub fn parse_channels_from_toml_str(content: &str) -> anyhow::Result<Vec<Channel>> {
    let file: TomlChannelFile = toml::from_str(content)?;
    let channels = file
        .channel
        .into_iter()
        .map(|c| Channel {
            // Fall back to the HLS URL when no single-file stream is known.
            direct_url: if c.direct_url.is_empty() {
                c.hls_url.clone()
            } else {
                c.direct_url
            },
            id: c.id,
            name: c.name,
            name_en: c.name_en,
            frequency: c.frequency,
            description: c.description,
            hls_url: c.hls_url,
            mirrors: c.mirrors,
        })
        .collect();
    Ok(channels)
}
