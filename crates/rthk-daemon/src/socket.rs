use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use rthk_playback::PlaybackSnapshot;
use rthk_proto::protocol::{frame_len, Broadcast, Message, PROTOCOL_VERSION};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

type SharedSnapshot = Arc<RwLock<PlaybackSnapshot>>;

pub async fn bind(bind_address: &str, port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("TCP server listening at {}", listener.local_addr()?);
    Ok(listener)
}

pub fn start_server(
    listener: TcpListener,
    snapshot: SharedSnapshot,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let snap = snapshot.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, snap, id, evt_tx, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    snapshot: SharedSnapshot,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    match encode_hello(&snapshot).await {
        Ok(encoded) => {
            if write_half.write_all(&encoded).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("Client {}: failed to encode hello: {}", client_id, e),
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let frame = match frame_len(&read_buf) {
                                Ok(Some(len)) if read_buf.len() >= 4 + len => 4 + len,
                                Ok(_) => break,
                                Err(e) => {
                                    // The stream is out of sync; nothing after this can be trusted.
                                    warn!("Client {} sent a bad frame: {}", client_id, e);
                                    return;
                                }
                            };
                            let decoded = Message::decode(&read_buf[..frame]);
                            read_buf.drain(..frame);
                            match decoded {
                                Ok((Message::Command(cmd), _)) => {
                                    debug!("Client {} sent command: {:?}", client_id, cmd);
                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => warn!("Client {} sent an unreadable message: {}", client_id, e),
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_snapshot(&snapshot).await,
                    Ok(BroadcastMessage::Favorites(items)) => {
                        Message::Broadcast(Broadcast::Favorites { items }).encode()
                    }
                    Ok(BroadcastMessage::Error(message)) => {
                        Message::Broadcast(Broadcast::Error { message }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_snapshot(&snapshot).await
                    }
                    Err(_) => break,
                };
                match encoded {
                    Ok(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Client {}: failed to encode broadcast: {}", client_id, e),
                }
            }
        }
    }
}

async fn encode_hello(snapshot: &SharedSnapshot) -> anyhow::Result<Vec<u8>> {
    let snapshot = snapshot.read().await.clone();
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        snapshot,
    })
    .encode()
}

async fn encode_snapshot(snapshot: &SharedSnapshot) -> anyhow::Result<Vec<u8>> {
    let data = snapshot.read().await.clone();
    Message::Broadcast(Broadcast::Snapshot { data }).encode()
}
