//! WebSocket transport.
//!
//! One upstream connection, authenticated with a BTP auth message, no
//! reconnection. Frames are turned into [`WireMessage`]s by a [`FrameCodec`];
//! [`JsonFrames`] is the built-in one.

use crate::transport::{EventSender, PeerId, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use btp_core::{generate_request_id, BtpUri, Packet, ProtocolData, RejectionDescriptor, WireMessage};
use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// Serializes wire messages to and from frame bytes.
pub trait FrameCodec: Send + Sync + 'static {
    fn encode(&self, message: &WireMessage) -> Result<Vec<u8>, TransportError>;
    fn decode(&self, frame: &[u8]) -> Result<WireMessage, TransportError>;
}

/// JSON frames. Handy for tests and tooling; not the BTP byte layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrames;

impl FrameCodec for JsonFrames {
    fn encode(&self, message: &WireMessage) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(message).map_err(|e| TransportError::Frame(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<WireMessage, TransportError> {
        serde_json::from_slice(frame).map_err(|e| TransportError::Frame(e.to_string()))
    }
}

/// The first message on every link.
pub fn auth_message(username: &str, token: &str) -> WireMessage {
    WireMessage {
        request_id: generate_request_id(),
        packet: Packet::Message(vec![
            ProtocolData::binary("auth", Vec::new()),
            ProtocolData::text("auth_username", username),
            ProtocolData::text("auth_token", token),
        ]),
    }
}

struct Link {
    peer_id: PeerId,
    outbound: mpsc::Sender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Single-upstream WebSocket transport.
pub struct WsTransport<F = JsonFrames> {
    frames: Arc<F>,
    link: Mutex<Option<Link>>,
}

impl<F: FrameCodec> WsTransport<F> {
    pub fn new(frames: F) -> Self {
        Self {
            frames: Arc::new(frames),
            link: Mutex::new(None),
        }
    }
}

impl Default for WsTransport<JsonFrames> {
    fn default() -> Self {
        Self::new(JsonFrames)
    }
}

#[async_trait]
impl<F: FrameCodec> Transport for WsTransport<F> {
    async fn start(&self, uri: &BtpUri, events: EventSender) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            if !old.reader.is_finished() {
                *link = Some(old);
                return Err(TransportError::Connect("already started".into()));
            }
            old.writer.abort();
        }

        let url = uri.transport_url().as_str();
        tracing::debug!(%url, "opening websocket");
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let auth = auth_message(uri.username(), uri.token());
        sink.send(WsMessage::Binary(self.frames.encode(&auth)?.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        await_auth_reply(&mut stream, self.frames.as_ref(), auth.request_id).await?;

        let peer_id = PeerId(url.to_string());
        tracing::debug!(%peer_id, "link authenticated");

        let (outbound, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(error = %e, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Connected must reach the session before any message does.
        let _ = events.send(TransportEvent::Connected {
            peer_id: peer_id.clone(),
        });
        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.frames),
            peer_id.clone(),
            events,
        ));

        *link = Some(Link {
            peer_id,
            outbound,
            reader,
            writer,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        link.reader.abort();
        let _ = link.outbound.send(WsMessage::Close(None)).await;
        drop(link.outbound);
        let _ = link.writer.await;
        tracing::debug!(peer_id = %link.peer_id, "websocket closed");
        Ok(())
    }

    async fn send(&self, message: WireMessage, peer_id: &PeerId) -> Result<(), TransportError> {
        let outbound = {
            let link = self.link.lock().await;
            let link = link.as_ref().ok_or(TransportError::Closed)?;
            if &link.peer_id != peer_id {
                return Err(TransportError::UnknownPeer(peer_id.clone()));
            }
            link.outbound.clone()
        };
        let frame = self.frames.encode(&message)?;
        outbound
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

fn frame_bytes(frame: &WsMessage) -> Option<&[u8]> {
    match frame {
        WsMessage::Binary(bytes) => Some(&bytes[..]),
        WsMessage::Text(text) => Some(text.as_str().as_bytes()),
        _ => None,
    }
}

async fn await_auth_reply<S, F>(
    stream: &mut S,
    frames: &F,
    request_id: u32,
) -> Result<(), TransportError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    F: FrameCodec,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| TransportError::Connect(e.to_string()))?;
        let Some(bytes) = frame_bytes(&frame) else {
            continue;
        };
        let reply = frames.decode(bytes)?;
        if reply.request_id != request_id {
            tracing::debug!(request_id = reply.request_id, "ignoring frame before auth reply");
            continue;
        }
        return match reply.packet {
            Packet::Ack(_) | Packet::Response(_) => Ok(()),
            Packet::Error {
                rejection_reason, ..
            } => {
                let reason = RejectionDescriptor::from_bytes(&rejection_reason)
                    .map(|r| format!("{}: {}", r.name, r.message))
                    .unwrap_or_else(|| "unreadable rejection".to_string());
                Err(TransportError::Auth(reason))
            }
            other => Err(TransportError::Auth(format!(
                "unexpected {} reply",
                other.type_name()
            ))),
        };
    }
    Err(TransportError::Closed)
}

async fn read_loop<S, F>(mut stream: S, frames: Arc<F>, peer_id: PeerId, events: EventSender)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    F: FrameCodec,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Close(close))) => {
                break close
                    .map(|c| c.reason.as_str().to_string())
                    .unwrap_or_else(|| "closed by peer".to_string());
            }
            Some(Ok(frame)) => {
                let Some(bytes) = frame_bytes(&frame) else {
                    continue;
                };
                match frames.decode(bytes) {
                    Ok(message) => {
                        let event = TransportEvent::Message {
                            message,
                            peer_id: peer_id.clone(),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(%peer_id, error = %e, "dropping undecodable frame"),
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };
    tracing::debug!(%peer_id, %reason, "link lost");
    let _ = events.send(TransportEvent::Closed { peer_id, reason });
}
