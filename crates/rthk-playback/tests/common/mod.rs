#![allow(dead_code)]

use rthk_playback::catalog::{builtin_archive_templates, Catalog, CdnTier, Channel, Mirror};
use rthk_playback::{
    Generation, PlaybackController, PlaybackPolicy, SourceResolver, TransportAdapter,
    TransportCapabilities, TransportError, TransportEvent, TransportEventKind,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Attach(Generation),
    Detach,
    Load {
        generation: Generation,
        url: String,
        seek_hint: Option<f64>,
    },
    Play,
    Pause,
    Seek(f64),
    Volume(f32),
}

/// Records every command and flags any attach made while a binding is live.
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub ops: Vec<Op>,
    pub attached: Option<Generation>,
    pub double_binds: usize,
    pub segmented: bool,
    /// Loads of these URLs are rejected synchronously.
    pub reject: Vec<String>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            segmented: true,
            ..Self::default()
        }
    }

    pub fn loads(&self) -> Vec<(String, Option<f64>)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Load { url, seek_hint, .. } => Some((url.clone(), *seek_hint)),
                _ => None,
            })
            .collect()
    }
}

impl TransportAdapter for FakeTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            segmented_streaming: self.segmented,
        }
    }

    fn attach(&mut self, generation: Generation) -> Result<(), TransportError> {
        if self.attached.is_some() {
            self.double_binds += 1;
        }
        self.attached = Some(generation);
        self.ops.push(Op::Attach(generation));
        Ok(())
    }

    fn detach(&mut self) {
        self.attached = None;
        self.ops.push(Op::Detach);
    }

    fn load(&mut self, url: &str, seek_hint_secs: Option<f64>) -> Result<(), TransportError> {
        let generation = self
            .attached
            .ok_or_else(|| TransportError::Unavailable("load without binding".into()))?;
        if self.reject.iter().any(|r| r == url) {
            return Err(TransportError::Command(format!("cannot open {}", url)));
        }
        self.ops.push(Op::Load {
            generation,
            url: url.to_string(),
            seek_hint: seek_hint_secs,
        });
        Ok(())
    }

    fn play(&mut self) -> Result<(), TransportError> {
        self.ops.push(Op::Play);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), TransportError> {
        self.ops.push(Op::Pause);
        Ok(())
    }

    fn seek(&mut self, position_secs: f64) -> Result<(), TransportError> {
        self.ops.push(Op::Seek(position_secs));
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), TransportError> {
        self.ops.push(Op::Volume(volume));
        Ok(())
    }
}

/// Built-in catalog plus a `mirrored` channel with two extra mirrors.
pub fn test_catalog() -> Catalog {
    let mut channels = rthk_playback::catalog::builtin_channels();
    channels.push(Channel {
        id: "mirrored".into(),
        name: "Mirrored".into(),
        hls_url: "https://a.example/live/master.m3u8".into(),
        direct_url: "https://a.example/live.mp3".into(),
        mirrors: vec![
            Mirror {
                url: "https://b.example/live/master.m3u8".into(),
                tier: CdnTier::Secondary,
            },
            Mirror {
                url: "https://c.example/live.mp3".into(),
                tier: CdnTier::Tertiary,
            },
        ],
        ..Channel::default()
    });
    Catalog::new(channels)
}

pub fn resolver() -> SourceResolver {
    SourceResolver::new(
        test_catalog(),
        builtin_archive_templates(),
        TransportCapabilities::default(),
    )
}

pub fn controller() -> PlaybackController<FakeTransport> {
    PlaybackController::new(resolver(), FakeTransport::new(), PlaybackPolicy::default())
}

/// Deliver `kind` on the currently attached binding.
pub fn emit(c: &mut PlaybackController<FakeTransport>, kind: TransportEventKind) {
    let generation = c.generation().expect("no binding attached");
    c.handle_event(TransportEvent::new(generation, kind));
}

/// Collect the scheduled retry and pretend its backoff elapsed.
pub fn elapse_retry(c: &mut PlaybackController<FakeTransport>) {
    let retry = c.take_scheduled_retry().expect("no retry scheduled");
    c.retry_due(retry.generation);
}
