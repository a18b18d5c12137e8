//! BTP wire model.
//!
//! This is the parsed, in-memory form of a BTP packet. Turning it into bytes
//! is the frame codec's job.

use crate::{Condition, Fulfillment, ProtocolData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A BTP message: correlation id plus typed packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub request_id: u32,
    pub packet: Packet,
}

/// Packet body, by BTP message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Packet {
    Prepare {
        transfer_id: String,
        amount: String,
        execution_condition: Condition,
        expires_at: DateTime<Utc>,
        protocol_data: Vec<ProtocolData>,
    },
    Fulfill {
        transfer_id: String,
        fulfillment: Fulfillment,
        protocol_data: Vec<ProtocolData>,
    },
    Reject {
        transfer_id: String,
        rejection_reason: Vec<u8>,
        protocol_data: Vec<ProtocolData>,
    },
    Message(Vec<ProtocolData>),
    Response(Vec<ProtocolData>),
    Ack(Vec<ProtocolData>),
    Error {
        rejection_reason: Vec<u8>,
        protocol_data: Vec<ProtocolData>,
    },
}

impl Packet {
    /// BTP message type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Prepare { .. } => "prepare",
            Self::Fulfill { .. } => "fulfill",
            Self::Reject { .. } => "reject",
            Self::Message(_) => "message",
            Self::Response(_) => "response",
            Self::Ack(_) => "ack",
            Self::Error { .. } => "error",
        }
    }

    pub fn protocol_data(&self) -> &[ProtocolData] {
        match self {
            Self::Prepare { protocol_data, .. }
            | Self::Fulfill { protocol_data, .. }
            | Self::Reject { protocol_data, .. }
            | Self::Error { protocol_data, .. } => protocol_data,
            Self::Message(items) | Self::Response(items) | Self::Ack(items) => items,
        }
    }

    /// Whether this packet answers an earlier request.
    pub fn is_settlement(&self) -> bool {
        matches!(self, Self::Ack(_) | Self::Response(_) | Self::Error { .. })
    }
}
