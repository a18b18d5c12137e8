//! Core types for the BTP ledger plugin.
//!
//! Two models of the same ledger protocol live here: the LPI event model that
//! application code speaks ([`LpiEvent`]) and the request-id-correlated BTP
//! wire model ([`WireMessage`]). The [`Codec`] translates between them,
//! including the error taxonomy. Byte-level framing is left to the transport.

mod codec;
mod condition;
mod error_kind;
mod event;
mod payload;
pub mod protocol_data;
mod rejection;
mod uri;
mod wire;

pub use codec::{
    generate_request_id, Codec, DecodeError, Decoded, EncodeError, IncomingEvent, ResponseData,
};
pub use condition::{Condition, Fulfillment, InvalidDigest};
pub use error_kind::{ErrorKind, LedgerError, UnknownErrorKind};
pub use event::{LpiEvent, Message, Transfer};
pub use payload::{CustomData, PayloadValue};
pub use protocol_data::{ContentType, ProtocolData};
pub use rejection::RejectionDescriptor;
pub use uri::{BtpUri, UriError};
pub use wire::{Packet, WireMessage};

use serde::{Deserialize, Serialize};

/// Protocol generation spoken with the connector.
///
/// Named after the Interledger testnet that introduced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// LPI draft 5 over BTP alpha.
    #[serde(rename = "17q3")]
    Alpha,
    /// LPI draft 7 over BTP 1.
    #[default]
    #[serde(rename = "17q4")]
    V1,
}

impl ProtocolVersion {
    /// LPI draft number.
    pub fn lpi_version(self) -> u8 {
        match self {
            Self::Alpha => 5,
            Self::V1 => 7,
        }
    }

    /// BTP version number carried by the packet serializer.
    pub fn btp_version(self) -> u8 {
        match self {
            Self::Alpha => 0,
            Self::V1 => 1,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport is open.
    #[default]
    Disconnected,
    /// Transport is being opened.
    Connecting,
    /// Link is up; fetching account and ledger info.
    Handshaking,
    /// Normal operation.
    Connected,
}
