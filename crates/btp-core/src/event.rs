//! LPI event model.
//!
//! These are the shapes application code hands to the plugin. Each outbound
//! call builds exactly one [`LpiEvent`], which the codec consumes immediately.

use crate::{Condition, CustomData, Fulfillment, RejectionDescriptor};
use serde::{Deserialize, Serialize};

/// A conditional transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    /// Decimal amount, kept as text.
    pub amount: String,
    pub execution_condition: Condition,
    /// RFC 3339 timestamp.
    pub expires_at: String,
    /// Base64-encoded ILP packet.
    pub ilp: Option<String>,
    #[serde(default)]
    pub custom: CustomData,
    pub from: Option<String>,
    pub to: Option<String>,
    pub ledger: Option<String>,
}

impl Transfer {
    /// Create a transfer with no optional fields set.
    pub fn new(
        id: impl Into<String>,
        amount: impl Into<String>,
        execution_condition: Condition,
        expires_at: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            amount: amount.into(),
            execution_condition,
            expires_at: expires_at.into(),
            ilp: None,
            custom: CustomData::new(),
            from: None,
            to: None,
            ledger: None,
        }
    }
}

/// A ledger-level message (request or response payload).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Ledger-level message id. Unrelated to the wire request id.
    pub id: Option<String>,
    pub ilp: Option<String>,
    #[serde(default)]
    pub custom: CustomData,
    pub from: Option<String>,
    pub to: Option<String>,
    pub ledger: Option<String>,
}

impl Message {
    /// A message carrying only custom data.
    pub fn with_custom(custom: CustomData) -> Self {
        Self {
            custom,
            ..Self::default()
        }
    }
}

/// Outbound LPI event.
#[derive(Debug, Clone, PartialEq)]
pub enum LpiEvent {
    Prepare(Transfer),
    Fulfill {
        transfer_id: String,
        fulfillment: Fulfillment,
    },
    Reject {
        transfer_id: String,
        reason: RejectionDescriptor,
    },
    Request(Message),
    /// Reply to an inbound request, correlated by the requester's id.
    Response { request_id: u32, message: Message },
}

impl LpiEvent {
    /// LPI event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepare(_) => "prepare",
            Self::Fulfill { .. } => "fulfill",
            Self::Reject { .. } => "reject",
            Self::Request(_) => "request",
            Self::Response { .. } => "response",
        }
    }
}
