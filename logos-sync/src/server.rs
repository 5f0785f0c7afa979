//! WebSocket relay server.
//!
//! Exposes a [`LocalHub`] to remote [`WsTransport`](crate::transport::WsTransport)
//! clients. One WebSocket connection is one channel subscription:
//!
//! ```text
//! Client A ──ws──┐                         ┌── forwarder ──► Client A
//!                ├── handle_connection ──► LocalHub("room:r1")
//! Client B ──ws──┘                         └── forwarder ──► Client B
//! ```
//!
//! The relay keeps no canvas state. Presence lives in the hub for as long
//! as the connection is open; when the socket drops, the hub publishes a
//! leave and a fresh snapshot to the remaining subscribers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::config::RelayConfig;
use crate::transport::frame::{ClientFrame, ServerFrame};
use crate::transport::{ChannelEvent, ChannelHandle, LocalHub, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
}

pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<LocalHub>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let hub = Arc::new(LocalHub::with_config(&config));
        Self {
            config,
            hub,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = Self::handle_connection(stream, addr, hub, stats.clone()).await {
                    log::error!("Connection error from {addr}: {e}");
                }

                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<LocalHub>,
        stats: Arc<AtomicRelayStats>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // ─── Handshake: first frame must be Open ───────────────────────
        let channel = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    match ClientFrame::decode(&data) {
                        Ok(ClientFrame::Open { channel }) => break channel,
                        Ok(other) => {
                            stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                            log::warn!("{addr}: expected Open, got {other:?}");
                            let reply = ServerFrame::Error {
                                message: "first frame must be Open".to_string(),
                            };
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            let _ = ws_sender.close().await;
                            return Ok(());
                        }
                        Err(e) => {
                            stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                            log::warn!("{addr}: ignoring undecodable frame: {e}");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            }
        };

        let (handle, mut events) = match hub.open_channel(&channel).await {
            Ok(opened) => opened,
            Err(e) => {
                log::warn!("{addr}: cannot open '{channel}': {e}");
                let reply = ServerFrame::Error { message: e.to_string() };
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                let _ = ws_sender.close().await;
                return Ok(());
            }
        };

        let opened = ServerFrame::Opened { handle_id: handle.id };
        ws_sender.send(Message::Binary(opened.encode()?.into())).await?;
        log::info!("{addr} subscribed to '{channel}' as {}", handle.id);

        let result = pump(
            &addr,
            &channel,
            &handle,
            &hub,
            &stats,
            &mut events,
            &mut ws_sender,
            &mut ws_receiver,
        )
        .await;

        let _ = ws_sender.close().await;
        let _ = hub.unsubscribe(&handle).await;
        log::info!("{addr} left '{channel}'");
        result
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

// ─── Pump: hub events out, client frames in ────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn pump<S, R>(
    addr: &SocketAddr,
    channel: &str,
    handle: &ChannelHandle,
    hub: &LocalHub,
    stats: &AtomicRelayStats,
    events: &mut mpsc::Receiver<ChannelEvent>,
    ws_sender: &mut S,
    ws_receiver: &mut R,
) -> Result<(), BoxError>
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let frame = ServerFrame::Event(event);
                        ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    }
                    None => break,
                }
            }

            msg = ws_receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => continue,
                };
                stats.frames_received.fetch_add(1, Ordering::Relaxed);

                let reply = match ClientFrame::decode(&data) {
                    Ok(ClientFrame::Track { payload }) => match hub.track(handle, payload).await {
                        Ok(()) => Some(ServerFrame::Tracked),
                        Err(e) => Some(ServerFrame::Error { message: e.to_string() }),
                    },
                    Ok(ClientFrame::Broadcast { event_type, payload }) => {
                        if let Err(e) = hub.broadcast(handle, &event_type, payload) {
                            log::warn!("{addr}: broadcast on '{channel}' failed: {e}");
                        }
                        None
                    }
                    Ok(ClientFrame::Close) => break,
                    Ok(ClientFrame::Open { .. }) => {
                        stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                        Some(ServerFrame::Error {
                            message: "channel already open".to_string(),
                        })
                    }
                    Err(e) => {
                        stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                        log::warn!("{addr}: ignoring undecodable frame: {e}");
                        None
                    }
                };

                if let Some(reply) = reply {
                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_defaults() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.config().bind_addr, "127.0.0.1:9191");
        assert_eq!(server.stats(), RelayStats::default());
        assert_eq!(server.hub().channel_count(), 0);
    }
}
