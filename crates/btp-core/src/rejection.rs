//! Rejection descriptors carried by Reject and Error packets.

use crate::{CustomData, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured record of why a transfer or request failed.
///
/// `code` and `name` always come from the wire taxonomy. `forwarded_by` is a
/// provenance trail: each hop appends itself and nothing is ever removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionDescriptor {
    pub code: String,
    pub name: String,
    pub message: String,
    pub triggered_by: String,
    forwarded_by: Vec<String>,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub additional_info: CustomData,
}

impl RejectionDescriptor {
    /// Describe a failure of `kind` raised by `triggered_by`, timestamped now.
    pub fn new(kind: ErrorKind, triggered_by: impl Into<String>) -> Self {
        let kind = if kind.is_canonical() {
            kind
        } else {
            kind.to_wire(false)
        };
        Self {
            code: kind.code().unwrap_or_default().to_string(),
            name: kind.name().to_string(),
            message: kind.wire_message().to_string(),
            triggered_by: triggered_by.into(),
            forwarded_by: Vec::new(),
            triggered_at: Utc::now(),
            additional_info: CustomData::new(),
        }
    }

    /// Wire kind named by this descriptor. Unrecognized labels read as `NotAccepted`.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_wire_label(&self.name, &self.code)
    }

    /// Record that `hop` passed this rejection on.
    pub fn forward(&mut self, hop: impl Into<String>) {
        self.forwarded_by.push(hop.into());
    }

    pub fn forwarded_by(&self) -> &[String] {
        &self.forwarded_by
    }

    /// JSON encoding of the descriptor.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
