//! Ledger plugin speaking BTP to a connector.
//!
//! A [`Plugin`] wraps one [`Transport`] link. It translates between ledger
//! events and BTP messages with [`btp_core::Codec`], matches responses to
//! the requests that caused them, and fans incoming events out to
//! subscribers.

mod config;
mod session;
pub mod transport;
pub mod ws;

pub use btp_core;
pub use config::{ConfigError, PluginConfig};
pub use session::{Plugin, PluginError, RequestHandler};
pub use transport::{EventSender, PeerId, Transport, TransportError, TransportEvent};
pub use ws::{FrameCodec, JsonFrames, WsTransport};
