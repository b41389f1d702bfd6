//! mpv as a playback transport.
//!
//! ```text
//!   PlaybackController ──(TransportAdapter, sync)──► MpvTransport
//!                                                      │ MpvCommand (unbounded mpsc, ordered)
//!                                                      ▼
//!                                                   worker task ── owns MpvDriver + MpvHandle
//!                                                      │   ├── writer task: request → socket
//!                                                      │   └── reader task: replies → oneshot,
//!                                                      │                    events  → worker
//!                                                      ▼
//!                                        EventTranslator (generation fence)
//!                                                      │ DaemonEvent::Transport
//!                                                      ▼
//!                                                  DaemonCore
//! ```
//!
//! mpv reports everything through one IPC connection, including the tail end
//! of a file we already stopped.  The translator only lets events through
//! between the `start-file` of the load it is waiting on and the matching
//! `end-file`, and tags them with the generation attached at the time.

use rthk_playback::{
    FailureKind, Generation, TransportAdapter, TransportCapabilities, TransportError,
    TransportEvent, TransportEventKind,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observed properties ───────────────────────────────────────────────────────

pub const OBS_TIME_POS: u64 = 1;
pub const OBS_DURATION: u64 = 2;
pub const OBS_PAUSED_FOR_CACHE: u64 = 3;

const OBSERVED: [(u64, &str); 3] = [
    (OBS_TIME_POS, "time-pos"),
    (OBS_DURATION, "duration"),
    (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
];

type ReplyMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    /// Serialised JSON line, newline included.
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Anything mpv sent without a `request_id`.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn playlist_entry_id(&self) -> Option<i64> {
        self.raw.get("playlist_entry_id")?.as_i64()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key)?.as_str()
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        payload.push('\n');

        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// `loadfile` with an optional start offset.  Returns mpv's playlist entry
    /// id for the new file when the mpv version reports one.
    pub async fn load(&self, url: &str, start_secs: Option<f64>) -> anyhow::Result<Option<i64>> {
        let start = match start_secs {
            Some(secs) => json!(format!("{:.3}", secs)),
            None => json!("none"),
        };
        self.set_property("start", start).await?;
        self.set_property("pause", json!(false)).await?;
        let reply = self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(reply["data"]["playlist_entry_id"].as_i64())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.set_property("pause", json!(paused)).await
    }

    pub async fn seek_to(&self, secs: f64) -> anyhow::Result<()> {
        self.send(json!(["seek", secs, "absolute"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.set_property("volume", json!(volume_pct(volume))).await
    }

    pub async fn observe_properties(&self) {
        for (id, name) in OBSERVED {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

fn volume_pct(volume: f32) -> f64 {
    (volume as f64 * 100.0).clamp(0.0, 100.0).round()
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: rthk_proto::platform::mpv_socket_name(),
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        let mpv_binary = rthk_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {}", mpv_binary.display());

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(rthk_proto::platform::mpv_socket_arg())
            .arg(format!("--volume={}", volume_pct(self.volume)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process().await?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = tokio::net::UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to {}", socket_path.display());
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        use tokio::net::windows::named_pipe::ClientOptions;

        self.spawn_process().await?;
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to {}", pipe_path);
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: ReplyMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);
    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));
    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &ReplyMap, reason: &str) {
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: ReplyMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                    continue;
                };
                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                    continue;
                };
                let result = match val["error"].as_str() {
                    Some("success") => Ok(val),
                    other => Err(anyhow::anyhow!(
                        "mpv error: {}",
                        other.unwrap_or("unknown error")
                    )),
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: ReplyMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Registered first so the reader can never see an unmatched reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// Maps mpv's `file_error` string on `end-file` to a failure origin.
pub fn classify_file_error(file_error: Option<&str>) -> FailureKind {
    let Some(err) = file_error else {
        return FailureKind::Unknown;
    };
    let err = err.to_ascii_lowercase();
    if err.contains("unrecognized file format")
        || err.contains("no audio or video data")
        || err.contains("unsupported")
        || err.contains("demux")
    {
        FailureKind::MediaDecode
    } else if err.contains("loading failed")
        || err.contains("network")
        || err.contains("http")
        || err.contains("timed out")
    {
        FailureKind::Network
    } else {
        FailureKind::Unknown
    }
}

/// Waiting for the `start-file` of a load.  `entry_id` is filled in once
/// mpv's reply to `loadfile` arrives.
#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    entry_id: Option<i64>,
}

/// Turns raw mpv events into `TransportEvent`s for the attached generation.
/// Pure state, no IO.
#[derive(Debug, Default)]
pub struct EventTranslator {
    attached: Option<Generation>,
    pending_load: Option<PendingLoad>,
    current_entry: Option<i64>,
    /// Between the awaited `start-file` and its `end-file`.
    accepting: bool,
    awaiting_ready: bool,
    duration: Option<f64>,
    load_deadline: Option<Instant>,
}

impl EventTranslator {
    pub fn attached(&self) -> Option<Generation> {
        self.attached
    }

    pub fn attach(&mut self, generation: Generation) {
        *self = Self {
            attached: Some(generation),
            ..Self::default()
        };
    }

    pub fn detach(&mut self) {
        *self = Self::default();
    }

    pub fn begin_load(&mut self, deadline: Instant) {
        self.pending_load = Some(PendingLoad { entry_id: None });
        self.current_entry = None;
        self.accepting = false;
        self.awaiting_ready = true;
        self.duration = None;
        self.load_deadline = Some(deadline);
    }

    pub fn set_entry_id(&mut self, entry_id: Option<i64>) {
        if let Some(p) = self.pending_load.as_mut() {
            p.entry_id = entry_id;
        }
    }

    /// The load never reached mpv.
    pub fn load_failed(&mut self) -> Option<TransportEvent> {
        self.fail(FailureKind::Unknown)
    }

    pub fn check_timeout(&mut self, now: Instant) -> Option<TransportEvent> {
        match self.load_deadline {
            Some(deadline) if self.awaiting_ready && now >= deadline => {
                warn!("mpv: load not ready before deadline");
                self.fail(FailureKind::Network)
            }
            _ => None,
        }
    }

    /// mpv exited or the IPC connection dropped.
    pub fn process_died(&mut self) -> Option<TransportEvent> {
        if self.accepting || self.pending_load.is_some() {
            self.fail(FailureKind::Unknown)
        } else {
            None
        }
    }

    pub fn translate(&mut self, evt: &MpvEvent) -> Option<TransportEvent> {
        let generation = self.attached?;

        if evt.event_name() == Some("start-file") {
            let id = evt.playlist_entry_id();
            if let Some(pending) = self.pending_load {
                if pending.entry_id.is_none() || pending.entry_id == id {
                    self.pending_load = None;
                    self.current_entry = id;
                    self.accepting = true;
                }
            }
            return None;
        }
        if !self.accepting {
            return None;
        }

        let kind = if let Some((obs_id, data)) = evt.as_property_change() {
            match obs_id {
                OBS_TIME_POS => TransportEventKind::TimeUpdate {
                    position_secs: data.as_f64()?,
                },
                OBS_DURATION => {
                    let duration = data.as_f64().filter(|d| d.is_finite() && *d > 0.0)?;
                    let changed = self.duration != Some(duration);
                    self.duration = Some(duration);
                    // Before the first playback-restart it rides on Ready instead.
                    if self.awaiting_ready || !changed {
                        return None;
                    }
                    TransportEventKind::DurationChanged {
                        duration_secs: duration,
                    }
                }
                OBS_PAUSED_FOR_CACHE if data.as_bool() == Some(true) => {
                    TransportEventKind::Stalled
                }
                _ => return None,
            }
        } else {
            match evt.event_name()? {
                "playback-restart" if self.awaiting_ready => {
                    self.awaiting_ready = false;
                    self.load_deadline = None;
                    TransportEventKind::Ready {
                        duration_secs: self.duration,
                    }
                }
                "end-file" => {
                    let id = evt.playlist_entry_id();
                    if id.is_some() && self.current_entry.is_some() && id != self.current_entry {
                        return None;
                    }
                    let kind = match evt.str_field("reason")? {
                        "eof" => TransportEventKind::Ended,
                        "error" => TransportEventKind::FatalError(classify_file_error(
                            evt.str_field("file_error"),
                        )),
                        _ => return None,
                    };
                    self.accepting = false;
                    self.awaiting_ready = false;
                    self.load_deadline = None;
                    kind
                }
                _ => return None,
            }
        };
        Some(TransportEvent::new(generation, kind))
    }

    fn fail(&mut self, kind: FailureKind) -> Option<TransportEvent> {
        let generation = self.attached?;
        self.pending_load = None;
        self.accepting = false;
        self.awaiting_ready = false;
        self.load_deadline = None;
        Some(TransportEvent::new(
            generation,
            TransportEventKind::FatalError(kind),
        ))
    }
}

// ── transport adapter ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum MpvCommand {
    Attach(Generation),
    Detach,
    Load {
        url: String,
        seek_hint: Option<f64>,
    },
    Play,
    Pause,
    Seek(f64),
    Volume(f32),
}

/// `TransportAdapter` over an mpv worker task.  Commands are queued in
/// order and never block the caller.  Dropping it stops the worker and mpv.
pub struct MpvTransport {
    tx: mpsc::UnboundedSender<MpvCommand>,
    capabilities: TransportCapabilities,
}

impl MpvTransport {
    pub fn spawn(
        capabilities: TransportCapabilities,
        load_timeout: Duration,
        volume: f32,
        core_tx: mpsc::Sender<DaemonEvent>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = MpvWorker {
            driver: MpvDriver::new(volume),
            handle: None,
            mpv_events: None,
            translator: EventTranslator::default(),
            load_timeout,
            core_tx,
        };
        let join = tokio::spawn(worker.run(rx));
        (Self { tx, capabilities }, join)
    }

    fn send(&self, cmd: MpvCommand) -> Result<(), TransportError> {
        self.tx
            .send(cmd)
            .map_err(|_| TransportError::Unavailable("mpv worker stopped".into()))
    }
}

impl TransportAdapter for MpvTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    fn attach(&mut self, generation: Generation) -> Result<(), TransportError> {
        self.send(MpvCommand::Attach(generation))
    }

    fn detach(&mut self) {
        let _ = self.send(MpvCommand::Detach);
    }

    fn load(&mut self, url: &str, seek_hint_secs: Option<f64>) -> Result<(), TransportError> {
        self.send(MpvCommand::Load {
            url: url.to_string(),
            seek_hint: seek_hint_secs,
        })
    }

    fn play(&mut self) -> Result<(), TransportError> {
        self.send(MpvCommand::Play)
    }

    fn pause(&mut self) -> Result<(), TransportError> {
        self.send(MpvCommand::Pause)
    }

    fn seek(&mut self, position_secs: f64) -> Result<(), TransportError> {
        self.send(MpvCommand::Seek(position_secs))
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), TransportError> {
        self.send(MpvCommand::Volume(volume))
    }
}

enum Step {
    Command(Option<MpvCommand>),
    Mpv(Option<MpvEvent>),
    Tick,
}

struct MpvWorker {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    mpv_events: Option<mpsc::Receiver<MpvEvent>>,
    translator: EventTranslator,
    load_timeout: Duration,
    core_tx: mpsc::Sender<DaemonEvent>,
}

async fn next_mpv_event(rx: &mut Option<mpsc::Receiver<MpvEvent>>) -> Option<MpvEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl MpvWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MpvCommand>) {
        let mut tick = tokio::time::interval(Duration::from_millis(500));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                cmd = rx.recv() => Step::Command(cmd),
                evt = next_mpv_event(&mut self.mpv_events) => Step::Mpv(evt),
                _ = tick.tick() => Step::Tick,
            };
            match step {
                // Every sender is gone once the controller is dropped.
                Step::Command(None) => break,
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Mpv(Some(evt)) => {
                    let translated = self.translator.translate(&evt);
                    self.emit(translated).await;
                }
                Step::Mpv(None) => {
                    warn!("mpv: IPC connection lost");
                    self.lost_process().await;
                }
                Step::Tick => {
                    let timed_out = self.translator.check_timeout(Instant::now());
                    self.emit(timed_out).await;
                    if self.handle.is_some() && !self.driver.process_alive() {
                        warn!("mpv: process exited");
                        self.lost_process().await;
                    }
                }
            }
        }

        if let Some(h) = self.handle.take() {
            let _ = h.stop().await;
        }
        self.driver.kill().await;
        info!("mpv: worker stopped");
    }

    async fn handle_command(&mut self, cmd: MpvCommand) {
        match cmd {
            MpvCommand::Attach(generation) => {
                debug!("mpv: attach {}", generation);
                self.translator.attach(generation);
            }
            MpvCommand::Detach => {
                debug!("mpv: detach {:?}", self.translator.attached());
                self.translator.detach();
                if let Some(h) = self.handle.as_ref() {
                    if let Err(e) = h.stop().await {
                        debug!("mpv: stop failed: {}", e);
                    }
                }
            }
            MpvCommand::Load { url, seek_hint } => {
                self.translator
                    .begin_load(Instant::now() + self.load_timeout);
                let result = match self.ensure_handle().await {
                    Some(h) => h.load(&url, seek_hint).await,
                    None => Err(anyhow::anyhow!("mpv unavailable")),
                };
                match result {
                    Ok(entry_id) => {
                        info!("mpv: loadfile {} start={:?} entry={:?}", url, seek_hint, entry_id);
                        self.translator.set_entry_id(entry_id);
                    }
                    Err(e) => {
                        warn!("mpv: load of {} failed: {}", url, e);
                        let failed = self.translator.load_failed();
                        self.emit(failed).await;
                    }
                }
            }
            MpvCommand::Play => self.with_handle("resume", |h| async move { h.set_pause(false).await }).await,
            MpvCommand::Pause => self.with_handle("pause", |h| async move { h.set_pause(true).await }).await,
            MpvCommand::Seek(secs) => self.with_handle("seek", |h| async move { h.seek_to(secs).await }).await,
            MpvCommand::Volume(volume) => {
                self.driver.volume = volume;
                self.with_handle("volume", |h| async move { h.set_volume(volume).await })
                    .await
            }
        }
    }

    async fn with_handle<F, Fut>(&self, what: &str, f: F)
    where
        F: FnOnce(MpvHandle) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let Some(h) = self.handle.clone() else {
            debug!("mpv: {} skipped, no process", what);
            return;
        };
        if let Err(e) = f(h).await {
            warn!("mpv: {} failed: {}", what, e);
        }
    }

    async fn ensure_handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, respawning");
            self.handle = None;
            self.mpv_events = None;
        }
        if self.handle.is_none() {
            let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(256);
            match self.driver.spawn_and_connect(event_tx).await {
                Ok(h) => {
                    h.observe_properties().await;
                    self.handle = Some(h);
                    self.mpv_events = Some(event_rx);
                }
                Err(e) => {
                    warn!("mpv: failed to start: {}", e);
                    return None;
                }
            }
        }
        self.handle.clone()
    }

    async fn lost_process(&mut self) {
        self.handle = None;
        self.mpv_events = None;
        self.driver.kill().await;
        let died = self.translator.process_died();
        self.emit(died).await;
    }

    async fn emit(&self, event: Option<TransportEvent>) {
        if let Some(event) = event {
            debug!("mpv: emit {:?}", event);
            let _ = self.core_tx.send(DaemonEvent::Transport(event)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    fn loading(entry: Option<i64>) -> EventTranslator {
        let mut t = EventTranslator::default();
        t.attach(Generation(7));
        t.begin_load(Instant::now() + Duration::from_secs(15));
        t.set_entry_id(entry);
        t
    }

    fn kinds(t: &mut EventTranslator, events: Vec<Value>) -> Vec<TransportEventKind> {
        events
            .into_iter()
            .filter_map(|raw| t.translate(&evt(raw)))
            .map(|e| {
                assert_eq!(e.generation, Generation(7));
                e.kind
            })
            .collect()
    }

    #[test]
    fn classify_common_file_errors() {
        assert_eq!(
            classify_file_error(Some("loading failed")),
            FailureKind::Network
        );
        assert_eq!(
            classify_file_error(Some("unrecognized file format")),
            FailureKind::MediaDecode
        );
        assert_eq!(
            classify_file_error(Some("no audio or video data played")),
            FailureKind::MediaDecode
        );
        assert_eq!(
            classify_file_error(Some("audio output initialization failed")),
            FailureKind::Unknown
        );
        assert_eq!(classify_file_error(None), FailureKind::Unknown);
    }

    #[test]
    fn first_playback_restart_is_ready_with_duration() {
        let mut t = loading(Some(3));
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file", "playlist_entry_id": 3}),
                json!({"event": "property-change", "id": OBS_DURATION, "data": 3540.5}),
                json!({"event": "playback-restart"}),
                json!({"event": "property-change", "id": OBS_TIME_POS, "data": 300.2}),
                json!({"event": "playback-restart"}),
            ],
        );
        assert_eq!(
            out,
            vec![
                TransportEventKind::Ready {
                    duration_secs: Some(3540.5)
                },
                TransportEventKind::TimeUpdate {
                    position_secs: 300.2
                },
            ]
        );
    }

    #[test]
    fn events_before_the_awaited_start_file_are_dropped() {
        let mut t = loading(Some(5));
        let out = kinds(
            &mut t,
            vec![
                // Tail of the previous file.
                json!({"event": "property-change", "id": OBS_TIME_POS, "data": 99.0}),
                json!({"event": "end-file", "reason": "error", "playlist_entry_id": 4, "file_error": "loading failed"}),
                json!({"event": "start-file", "playlist_entry_id": 4}),
                json!({"event": "playback-restart"}),
                json!({"event": "start-file", "playlist_entry_id": 5}),
                json!({"event": "playback-restart"}),
            ],
        );
        assert_eq!(out, vec![TransportEventKind::Ready { duration_secs: None }]);
    }

    #[test]
    fn end_file_reasons() {
        let mut t = loading(Some(1));
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file", "playlist_entry_id": 1}),
                json!({"event": "end-file", "reason": "error", "playlist_entry_id": 1, "file_error": "unrecognized file format"}),
                // Nothing after end-file until the next load.
                json!({"event": "property-change", "id": OBS_TIME_POS, "data": 1.0}),
            ],
        );
        assert_eq!(
            out,
            vec![TransportEventKind::FatalError(FailureKind::MediaDecode)]
        );

        let mut t = loading(None);
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file"}),
                json!({"event": "end-file", "reason": "stop"}),
                json!({"event": "end-file", "reason": "eof"}),
            ],
        );
        assert_eq!(out, vec![TransportEventKind::Ended]);
    }

    #[test]
    fn duration_after_ready_is_reported_once() {
        let mut t = loading(None);
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file"}),
                json!({"event": "property-change", "id": OBS_DURATION, "data": 600.0}),
                json!({"event": "playback-restart"}),
                json!({"event": "property-change", "id": OBS_DURATION, "data": 600.0}),
                json!({"event": "property-change", "id": OBS_DURATION, "data": 3540.0}),
                json!({"event": "property-change", "id": OBS_DURATION, "data": null}),
            ],
        );
        assert_eq!(
            out,
            vec![
                TransportEventKind::Ready {
                    duration_secs: Some(600.0)
                },
                TransportEventKind::DurationChanged {
                    duration_secs: 3540.0
                },
            ]
        );
    }

    #[test]
    fn nothing_after_eof_until_the_next_load() {
        let mut t = loading(Some(1));
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file", "playlist_entry_id": 1}),
                json!({"event": "playback-restart"}),
                json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 1}),
                json!({"event": "property-change", "id": OBS_TIME_POS, "data": 5.0}),
            ],
        );
        assert_eq!(
            out,
            vec![
                TransportEventKind::Ready { duration_secs: None },
                TransportEventKind::Ended,
            ]
        );

        // The controller reloads an ended episode on a fresh binding.
        t.attach(Generation(7));
        t.begin_load(Instant::now() + Duration::from_secs(15));
        t.set_entry_id(Some(2));
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file", "playlist_entry_id": 2}),
                json!({"event": "playback-restart"}),
            ],
        );
        assert_eq!(out, vec![TransportEventKind::Ready { duration_secs: None }]);
    }

    #[test]
    fn cache_pause_is_a_stall() {
        let mut t = loading(None);
        let out = kinds(
            &mut t,
            vec![
                json!({"event": "start-file"}),
                json!({"event": "property-change", "id": OBS_PAUSED_FOR_CACHE, "data": true}),
                json!({"event": "property-change", "id": OBS_PAUSED_FOR_CACHE, "data": false}),
            ],
        );
        assert_eq!(out, vec![TransportEventKind::Stalled]);
    }

    #[test]
    fn nothing_passes_after_detach() {
        let mut t = loading(None);
        t.detach();
        assert!(t
            .translate(&evt(json!({"event": "start-file"})))
            .is_none());
        assert!(t
            .translate(&evt(json!({"event": "end-file", "reason": "eof"})))
            .is_none());
        assert!(t.process_died().is_none());
    }

    #[test]
    fn load_timeout_fires_once_as_network_error() {
        let mut t = EventTranslator::default();
        t.attach(Generation(2));
        let start = Instant::now();
        t.begin_load(start + Duration::from_secs(15));
        assert!(t.check_timeout(start + Duration::from_secs(14)).is_none());
        let fired = t.check_timeout(start + Duration::from_secs(15)).unwrap();
        assert_eq!(fired.generation, Generation(2));
        assert_eq!(
            fired.kind,
            TransportEventKind::FatalError(FailureKind::Network)
        );
        assert!(t.check_timeout(start + Duration::from_secs(30)).is_none());
    }

    #[test]
    fn process_death_during_playback_is_unknown_failure() {
        let mut t = loading(None);
        t.translate(&evt(json!({"event": "start-file"})));
        let died = t.process_died().unwrap();
        assert_eq!(
            died.kind,
            TransportEventKind::FatalError(FailureKind::Unknown)
        );
        assert!(t.process_died().is_none());
    }
}
