//! WebSocket client transport for a [`crate::server::RelayServer`].
//!
//! One WebSocket connection per open channel. Each connection runs a
//! writer task (outgoing frame queue → socket) and a reader task
//! (socket → [`ChannelEvent`] stream, `Tracked` acks → ack queue).
//! When the socket closes, the reader drops its event sender and the
//! subscriber sees the stream end. A reader that stops, either because
//! the socket closed or because the subscriber dropped its event stream,
//! removes its own connection entry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::frame::{ClientFrame, ServerFrame};
use super::{ChannelEvent, ChannelHandle, Transport};
use crate::error::TransportError;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const OUTGOING_CAPACITY: usize = 256;

type AckResult = Result<(), TransportError>;
type Connections = Mutex<HashMap<Uuid, Connection>>;

struct Connection {
    outgoing: mpsc::Sender<ClientFrame>,
    /// Serialises `track` calls so each one waits for its own ack.
    acks: Arc<tokio::sync::Mutex<mpsc::Receiver<AckResult>>>,
    reader: JoinHandle<()>,
}

pub struct WsTransport {
    url: String,
    ack_timeout: Duration,
    event_queue_capacity: usize,
    connections: Arc<Connections>,
}

impl WsTransport {
    /// `url` is the relay address, e.g. `ws://127.0.0.1:9191`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            event_queue_capacity: 256,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of open channel connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn outgoing(&self, handle: &ChannelHandle) -> Result<mpsc::Sender<ClientFrame>, TransportError> {
        self.connections
            .lock()
            .get(&handle.id)
            .map(|c| c.outgoing.clone())
            .ok_or(TransportError::UnknownHandle)
    }
}

/// Drop the entry for a connection whose reader has stopped. If it was
/// still registered, ask the writer to close the socket.
fn release_connection(connections: &Weak<Connections>, id: Uuid) {
    let Some(connections) = connections.upgrade() else {
        return;
    };
    let removed = connections.lock().remove(&id);
    if let Some(conn) = removed {
        let _ = conn.outgoing.try_send(ClientFrame::Close);
    }
}

fn binary(frame: &ClientFrame) -> Result<Message, TransportError> {
    Ok(Message::Binary(frame.encode()?.into()))
}

#[async_trait]
impl Transport for WsTransport {
    async fn open_channel(
        &self,
        name: &str,
    ) -> Result<(ChannelHandle, mpsc::Receiver<ChannelEvent>), TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(binary(&ClientFrame::Open {
                channel: name.to_string(),
            })?)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        // Handshake: wait for Opened before starting the pumps.
        let handle_id = tokio::time::timeout(self.ack_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Opened { handle_id }) => return Ok(handle_id),
                        Ok(ServerFrame::Error { message }) => {
                            return Err(TransportError::Rejected(message))
                        }
                        Ok(other) => log::debug!("Ignoring pre-open frame {other:?}"),
                        Err(e) => return Err(TransportError::Frame(e)),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            Err(TransportError::ConnectionClosed)
        })
        .await
        .map_err(|_| TransportError::Timeout("channel open"))??;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(OUTGOING_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(self.event_queue_capacity);
        let (ack_tx, ack_rx) = mpsc::channel::<AckResult>(8);

        // Writer task: outgoing queue → socket
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = frame == ClientFrame::Close;
                let msg = match binary(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
                if closing {
                    let _ = ws_writer.close().await;
                    break;
                }
            }
        });

        // Reader task: socket → event stream
        let channel_name = name.to_string();
        let connections = Arc::downgrade(&self.connections);
        let reader = async move {
            loop {
                let msg = tokio::select! {
                    msg = ws_reader.next() => msg,
                    _ = event_tx.closed() => {
                        log::debug!("Event stream for '{channel_name}' dropped");
                        break;
                    }
                };
                match msg {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(ServerFrame::Event(event)) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(ServerFrame::Tracked) => {
                            let _ = ack_tx.try_send(Ok(()));
                        }
                        Ok(ServerFrame::Error { message }) => {
                            log::warn!("Relay error on '{channel_name}': {message}");
                            let _ = ack_tx.try_send(Err(TransportError::Rejected(message)));
                        }
                        Ok(ServerFrame::Opened { .. }) => {}
                        Err(e) => log::warn!("Undecodable relay frame on '{channel_name}': {e}"),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            release_connection(&connections, handle_id);
            log::debug!("Relay connection for '{channel_name}' closed");
        };

        {
            // Insert before the reader can remove itself.
            let mut connections = self.connections.lock();
            let reader = tokio::spawn(reader);
            connections.insert(
                handle_id,
                Connection {
                    outgoing: out_tx,
                    acks: Arc::new(tokio::sync::Mutex::new(ack_rx)),
                    reader,
                },
            );
        }

        log::debug!("Opened '{name}' on {} as {handle_id}", self.url);
        Ok((
            ChannelHandle {
                id: handle_id,
                channel: name.to_string(),
            },
            event_rx,
        ))
    }

    async fn track(&self, handle: &ChannelHandle, payload: Vec<u8>) -> Result<(), TransportError> {
        let (outgoing, acks) = {
            let connections = self.connections.lock();
            let conn = connections.get(&handle.id).ok_or(TransportError::UnknownHandle)?;
            (conn.outgoing.clone(), conn.acks.clone())
        };

        let mut acks = acks.lock().await;
        outgoing
            .send(ClientFrame::Track { payload })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        match tokio::time::timeout(self.ack_timeout, acks.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout("presence ack")),
        }
    }

    fn broadcast(
        &self,
        handle: &ChannelHandle,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let outgoing = self.outgoing(handle)?;
        outgoing
            .try_send(ClientFrame::Broadcast {
                event_type: event_type.to_string(),
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull(handle.channel.clone()),
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
            })
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), TransportError> {
        let conn = self
            .connections
            .lock()
            .remove(&handle.id)
            .ok_or(TransportError::UnknownHandle)?;

        // The writer closes the socket after flushing `Close`.
        let _ = conn.outgoing.send(ClientFrame::Close).await;
        conn.reader.abort();
        log::debug!("Closed '{}' ({})", handle.channel, handle.id);
        Ok(())
    }
}
