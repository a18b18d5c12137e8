//! Translation between the LPI event model and the BTP wire model.
//!
//! Outbound, every event becomes one [`WireMessage`]. Inbound, a message is
//! either a settlement (Ack, Response, Error) that completes an earlier
//! request, or an [`IncomingEvent`] for subscribers.

use crate::condition::encode_base64url;
use crate::protocol_data::{self, ContentType, InvalidBase64, ProtocolData};
use crate::{
    CustomData, ErrorKind, Fulfillment, LedgerError, LpiEvent, Packet, ProtocolVersion,
    RejectionDescriptor, Transfer, WireMessage,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;

/// Draw a fresh 32-bit request id.
///
/// Uniqueness rests on the size of the keyspace alone; ids are not checked
/// against outstanding requests.
pub fn generate_request_id() -> u32 {
    let mut buf = [0u8; 4];
    rand::rng().fill_bytes(&mut buf);
    u32::from_be_bytes(buf)
}

/// Error turning an event into a wire message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    ProtocolData(#[from] InvalidBase64),
    #[error("invalid expiry {value:?}: {source}")]
    InvalidExpiry {
        value: String,
        source: chrono::ParseError,
    },
}

/// Error turning a wire message into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{packet} packet is missing protocol data {name:?}")]
    MissingProtocolData {
        packet: &'static str,
        name: &'static str,
    },
}

/// Value a request settles with.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    /// Ack, or a Response without protocol data.
    Empty,
    /// Binary payload as URL-safe base64.
    Binary(String),
    Text(String),
    Json(serde_json::Value),
}

impl ResponseData {
    /// Textual view, if the value is a string of some kind.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Binary(s) | Self::Text(s) => Some(s),
            Self::Json(serde_json::Value::String(s)) => Some(s),
            Self::Empty | Self::Json(_) => None,
        }
    }
}

/// Event emitted for an inbound message that answers nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEvent {
    /// The peer prepared a transfer to us.
    IncomingPrepare(Transfer),
    /// The peer fulfilled one of our transfers.
    OutgoingFulfill {
        transfer_id: String,
        fulfillment: Fulfillment,
    },
    /// The peer rejected one of our transfers.
    OutgoingReject {
        transfer_id: String,
        reason: RejectionDescriptor,
    },
    /// The peer sent a request; `data` is its primary protocol-data payload.
    IncomingRequest { request_id: u32, data: Vec<u8> },
}

impl IncomingEvent {
    /// LPI event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingPrepare(_) => "incoming_prepare",
            Self::OutgoingFulfill { .. } => "outgoing_fulfill",
            Self::OutgoingReject { .. } => "outgoing_reject",
            Self::IncomingRequest { .. } => "incoming_request",
        }
    }
}

/// Result of decoding an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Settlement {
        request_id: u32,
        outcome: Result<ResponseData, LedgerError>,
    },
    Event(IncomingEvent),
}

/// Event ⇄ wire translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    version: ProtocolVersion,
}

impl Codec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Encode an outbound event.
    ///
    /// Responses reuse the requester's id; every other event gets a fresh one.
    pub fn encode(&self, event: &LpiEvent) -> Result<WireMessage, EncodeError> {
        let (request_id, packet) = match event {
            LpiEvent::Prepare(transfer) => {
                let expires_at = DateTime::parse_from_rfc3339(&transfer.expires_at)
                    .map_err(|source| EncodeError::InvalidExpiry {
                        value: transfer.expires_at.clone(),
                        source,
                    })?
                    .with_timezone(&Utc);
                let packet = Packet::Prepare {
                    transfer_id: transfer.id.clone(),
                    amount: transfer.amount.clone(),
                    execution_condition: transfer.execution_condition,
                    expires_at,
                    protocol_data: protocol_data::build(transfer)?,
                };
                (generate_request_id(), packet)
            }
            LpiEvent::Fulfill {
                transfer_id,
                fulfillment,
            } => {
                let packet = Packet::Fulfill {
                    transfer_id: transfer_id.clone(),
                    fulfillment: *fulfillment,
                    protocol_data: Vec::new(),
                };
                (generate_request_id(), packet)
            }
            LpiEvent::Reject {
                transfer_id,
                reason,
            } => {
                let packet = Packet::Reject {
                    transfer_id: transfer_id.clone(),
                    rejection_reason: reason.to_bytes(),
                    protocol_data: Vec::new(),
                };
                (generate_request_id(), packet)
            }
            // The ledger-level message id is not the wire request id.
            LpiEvent::Request(message) => (
                generate_request_id(),
                Packet::Message(protocol_data::build(message)?),
            ),
            LpiEvent::Response {
                request_id,
                message,
            } => (*request_id, Packet::Response(protocol_data::build(message)?)),
        };
        Ok(WireMessage { request_id, packet })
    }

    /// Answer `request_id` with an Error packet describing `kind`.
    pub fn encode_error(
        &self,
        request_id: u32,
        kind: ErrorKind,
        while_fulfilling: bool,
        triggered_by: &str,
    ) -> WireMessage {
        let reason = RejectionDescriptor::new(kind.to_wire(while_fulfilling), triggered_by);
        WireMessage {
            request_id,
            packet: Packet::Error {
                rejection_reason: reason.to_bytes(),
                protocol_data: Vec::new(),
            },
        }
    }

    /// Acknowledge `request_id` without payload.
    pub fn ack(&self, request_id: u32) -> WireMessage {
        WireMessage {
            request_id,
            packet: Packet::Ack(Vec::new()),
        }
    }

    /// Decode an inbound message.
    ///
    /// `local_account` is recorded as the origin of rejections we relay.
    pub fn decode(
        &self,
        message: &WireMessage,
        local_account: &str,
    ) -> Result<Decoded, DecodeError> {
        let request_id = message.request_id;
        let settled = |outcome: Result<ResponseData, LedgerError>| -> Result<Decoded, DecodeError> {
            Ok(Decoded::Settlement {
                request_id,
                outcome,
            })
        };

        let event = match &message.packet {
            Packet::Ack(_) => return settled(Ok(ResponseData::Empty)),
            Packet::Response(items) => return settled(Ok(response_data(items))),
            Packet::Error {
                rejection_reason, ..
            } => {
                let remote_kind = rejection_kind(rejection_reason);
                return settled(Err(LedgerError::from_remote(remote_kind)));
            }
            Packet::Prepare {
                transfer_id,
                amount,
                execution_condition,
                expires_at,
                protocol_data,
            } => {
                let to = required(protocol_data, "prepare", "to")?;
                let ilp = required(protocol_data, "prepare", "ilp")?;
                IncomingEvent::IncomingPrepare(Transfer {
                    id: transfer_id.clone(),
                    amount: amount.clone(),
                    execution_condition: *execution_condition,
                    expires_at: expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    ilp: Some(encode_base64url(&ilp.data)),
                    custom: CustomData::new(),
                    from: None,
                    to: Some(to.data_as_text()),
                    ledger: None,
                })
            }
            Packet::Fulfill {
                transfer_id,
                fulfillment,
                ..
            } => IncomingEvent::OutgoingFulfill {
                transfer_id: transfer_id.clone(),
                fulfillment: *fulfillment,
            },
            Packet::Reject {
                transfer_id,
                rejection_reason,
                ..
            } => {
                let kind = rejection_kind(rejection_reason).to_event();
                IncomingEvent::OutgoingReject {
                    transfer_id: transfer_id.clone(),
                    reason: RejectionDescriptor::new(kind, local_account),
                }
            }
            Packet::Message(items) => IncomingEvent::IncomingRequest {
                request_id,
                data: items.first().map(|item| item.data.clone()).unwrap_or_default(),
            },
        };
        Ok(Decoded::Event(event))
    }
}

fn required<'a>(
    items: &'a [ProtocolData],
    packet: &'static str,
    name: &'static str,
) -> Result<&'a ProtocolData, DecodeError> {
    protocol_data::find(items, name).ok_or(DecodeError::MissingProtocolData { packet, name })
}

/// Wire kind named by embedded rejection bytes. Unreadable bytes count as unrecognized.
fn rejection_kind(bytes: &[u8]) -> ErrorKind {
    RejectionDescriptor::from_bytes(bytes)
        .map(|reason| reason.kind())
        .unwrap_or(ErrorKind::NotAccepted)
}

fn response_data(items: &[ProtocolData]) -> ResponseData {
    let Some(primary) = items.first() else {
        return ResponseData::Empty;
    };
    match primary.content_type {
        ContentType::OctetStream => ResponseData::Binary(encode_base64url(&primary.data)),
        ContentType::TextPlainUtf8 => ResponseData::Text(primary.data_as_text()),
        ContentType::ApplicationJson => match serde_json::from_slice(&primary.data) {
            Ok(value) => ResponseData::Json(value),
            Err(_) => ResponseData::Json(serde_json::json!({
                "unparseable": primary.data_as_text()
            })),
        },
    }
}
