mod core;
mod mpv;
mod relay;
mod socket;

use rthk_playback::{PlaybackController, SourceResolver};
use rthk_proto::config::Config;
use rthk_proto::favorites::{Favorite, FavoritesStore};
use rthk_proto::state::StateManager;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The shared snapshot changed; clients re-read it.
    StateUpdated,
    Favorites(Vec<Favorite>),
    /// A command or playback failure the user should see.
    Error(String),
    Log(String),
}

/// Forwards WARN and ERROR events to connected clients.
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine.
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn init_logging(config: &Config, broadcast_tx: broadcast::Sender<BroadcastMessage>) -> anyhow::Result<()> {
    let log_path = &config.daemon.log_file;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,rthk_daemon=debug,rthk_playback=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    // Config first: it decides where the log file goes.
    let config = Config::load()?;
    init_logging(&config, broadcast_tx.clone())?;
    info!("Config loaded from: {:?}", Config::config_path());

    let catalog = config.catalog.load_catalog()?;
    info!("Catalog: {} channels", catalog.channels().len());
    let capabilities = config.transport.capabilities();
    let resolver = SourceResolver::new(catalog, config.catalog.templates(), capabilities);

    let state_manager = StateManager::new(
        config.daemon.state_file.clone(),
        config.transport.default_volume,
    );
    let favorites = FavoritesStore::load(config.daemon.favorites_file.clone());

    // All external inputs funnel into DaemonCore.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let (transport, mpv_worker) = mpv::MpvTransport::spawn(
        capabilities,
        Duration::from_secs(config.transport.load_timeout_secs),
        state_manager.persistent().volume,
        event_tx.clone(),
    );
    let controller = PlaybackController::new(resolver, transport, config.playback.clone());

    let daemon_core = core::DaemonCore::new(
        controller,
        state_manager,
        favorites,
        broadcast_tx.clone(),
        event_tx.clone(),
    );

    let listener = socket::bind(&config.socket.bind_address, config.socket.port).await?;
    let _socket_handle = socket::start_server(
        listener,
        daemon_core.state_manager().arc(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.relay.enabled {
        let _relay_handle = relay::start_server(&config.relay)?;
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });
    drop(event_tx);

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    // The core dropped the transport, so the worker is on its way out.
    if tokio::time::timeout(Duration::from_secs(3), mpv_worker).await.is_err() {
        error!("mpv worker did not stop in time");
    }
    Ok(())
}
