//! Transport seam.
//!
//! A transport owns the persistent link(s) to the connector. The session hands
//! it a channel at start-up and receives every link event through it:
//!
//! ```text
//! Session ──start(uri, events)──▶ Transport ──Connected{peer}──▶ events
//!         ──send(msg, peer)─────▶           ──Message{..}─────▶ events
//!         ──stop()──────────────▶           ──Closed{..}──────▶ events
//! ```

use async_trait::async_trait;
use btp_core::{BtpUri, WireMessage};
use std::fmt;
use tokio::sync::mpsc;

/// Identifier the transport assigns to a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Something that happened on the link.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Link established and authenticated.
    Connected { peer_id: PeerId },
    /// A decoded inbound message.
    Message {
        message: WireMessage,
        peer_id: PeerId,
    },
    /// Link lost.
    Closed { peer_id: PeerId, reason: String },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Transport failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("frame error: {0}")]
    Frame(String),
    #[error("transport is closed")]
    Closed,
}

/// A persistent, authenticated link to one or more peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link. Resolves once it is ready; `Connected` has been sent
    /// on `events` by then.
    async fn start(&self, uri: &BtpUri, events: EventSender) -> Result<(), TransportError>;

    /// Close the link.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Hand a message to the link. Resolves when the transport has accepted it.
    async fn send(&self, message: WireMessage, peer_id: &PeerId) -> Result<(), TransportError>;
}
