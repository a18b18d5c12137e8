//! Error taxonomy shared by the event and wire models.
//!
//! The wire model knows exactly nine kinds, each with a fixed three-character
//! code. The event model shares eight of them and adds a few of its own that
//! never travel on the wire. Translation in both directions is a closed table;
//! anything it does not list falls back to [`ErrorKind::NotAccepted`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every error kind either model can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Unreachable,
    NotAccepted,
    InvalidFields,
    TransferNotFound,
    InvalidFulfillment,
    DuplicateId,
    AlreadyRolledBack,
    AlreadyFulfilled,
    InsufficientBalance,
    // Event model only.
    TransferNotConditional,
    AccountNotFound,
    NoSubscriptions,
    MissingFulfillment,
    RequestHandlerAlreadyRegistered,
}

struct Entry {
    kind: ErrorKind,
    code: &'static str,
    /// Canonical message on the wire.
    wire: &'static str,
    /// Message raised to event-model callers. `None` for wire-only kinds.
    event: Option<&'static str>,
}

const TAXONOMY: [Entry; 9] = [
    Entry {
        kind: ErrorKind::Unreachable,
        code: "T00",
        wire: "Temporary error, indicating that the connector cannot process this request at the moment. Try again later",
        event: Some("An error occured due to connection failure"),
    },
    Entry {
        kind: ErrorKind::NotAccepted,
        code: "F00",
        wire: "Data were symantically invalid",
        event: Some("An operation has been rejected due to ledger-side logic"),
    },
    Entry {
        kind: ErrorKind::InvalidFields,
        code: "F01",
        wire: "At least one field contained structurally invalid data, e.g. timestamp full of garbage characters",
        event: Some("Arguments or configuration were invalidated client-side"),
    },
    Entry {
        kind: ErrorKind::TransferNotFound,
        code: "F03",
        wire: "The transferId included in the packet does not reference an existing transfer",
        event: Some("A requested transfer does not exist, or is not conditional, and cannot be fetched"),
    },
    Entry {
        kind: ErrorKind::InvalidFulfillment,
        code: "F04",
        wire: "The fulfillment included in the packet does not match the transfer's condition",
        event: None,
    },
    Entry {
        kind: ErrorKind::DuplicateId,
        code: "F05",
        wire: "The transferId and method match a previous request, but other data do not",
        event: Some("A transfer with the same ID and different fields has been sent"),
    },
    Entry {
        kind: ErrorKind::AlreadyRolledBack,
        code: "F06",
        wire: "The transfer cannot be fulfilled because it has already been rejected or expired",
        event: Some("A requested transfer has already been timed out or rejected and cannot be modified"),
    },
    Entry {
        kind: ErrorKind::AlreadyFulfilled,
        code: "F07",
        wire: "The transfer cannot be rejected because it has already been fulfilled",
        event: Some("A requested transfer has already been fulfilled and cannot be modified"),
    },
    Entry {
        kind: ErrorKind::InsufficientBalance,
        code: "F08",
        wire: "The transfer cannot be prepared because there is not enough available liquidity",
        event: Some("An operation has been rejected because the source balance isn't high enough"),
    },
];

impl ErrorKind {
    /// The nine kinds that can appear on the wire.
    pub const CANONICAL: [ErrorKind; 9] = [
        Self::Unreachable,
        Self::NotAccepted,
        Self::InvalidFields,
        Self::TransferNotFound,
        Self::InvalidFulfillment,
        Self::DuplicateId,
        Self::AlreadyRolledBack,
        Self::AlreadyFulfilled,
        Self::InsufficientBalance,
    ];

    const ALL: [ErrorKind; 14] = [
        Self::Unreachable,
        Self::NotAccepted,
        Self::InvalidFields,
        Self::TransferNotFound,
        Self::InvalidFulfillment,
        Self::DuplicateId,
        Self::AlreadyRolledBack,
        Self::AlreadyFulfilled,
        Self::InsufficientBalance,
        Self::TransferNotConditional,
        Self::AccountNotFound,
        Self::NoSubscriptions,
        Self::MissingFulfillment,
        Self::RequestHandlerAlreadyRegistered,
    ];

    fn entry(self) -> Option<&'static Entry> {
        TAXONOMY.iter().find(|e| e.kind == self)
    }

    /// Whether this kind belongs to the wire taxonomy.
    pub fn is_canonical(self) -> bool {
        self.entry().is_some()
    }

    /// Error name as used by both models, e.g. `"NotAcceptedError"`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unreachable => "UnreachableError",
            Self::NotAccepted => "NotAcceptedError",
            Self::InvalidFields => "InvalidFieldsError",
            Self::TransferNotFound => "TransferNotFoundError",
            Self::InvalidFulfillment => "InvalidFulfillmentError",
            Self::DuplicateId => "DuplicateIdError",
            Self::AlreadyRolledBack => "AlreadyRolledBackError",
            Self::AlreadyFulfilled => "AlreadyFulfilledError",
            Self::InsufficientBalance => "InsufficientBalanceError",
            Self::TransferNotConditional => "TransferNotConditionalError",
            Self::AccountNotFound => "AccountNotFoundError",
            Self::NoSubscriptions => "NoSubscriptionsError",
            Self::MissingFulfillment => "MissingFulfillmentError",
            Self::RequestHandlerAlreadyRegistered => "RequestHandlerAlreadyRegisteredError",
        }
    }

    /// Three-character wire code. `None` for event-model-only kinds.
    pub fn code(self) -> Option<&'static str> {
        self.entry().map(|e| e.code)
    }

    /// Canonical message carried on the wire.
    ///
    /// Event-model-only kinds use the message of the kind they collapse into.
    pub fn wire_message(self) -> &'static str {
        self.entry()
            .or_else(|| self.to_wire(false).entry())
            .map(|e| e.wire)
            .unwrap_or_default()
    }

    /// Message presented to event-model callers.
    pub fn event_message(self) -> &'static str {
        self.to_wire(false)
            .to_event()
            .entry()
            .and_then(|e| e.event)
            .unwrap_or_default()
    }

    /// Look up a canonical kind by its wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        TAXONOMY.iter().find(|e| e.code == code).map(|e| e.kind)
    }

    /// Translate an event-model kind into the wire taxonomy.
    ///
    /// `while_fulfilling` marks failures of a fulfillment attempt, where a
    /// plain rejection is reported as an invalid fulfillment.
    pub fn to_wire(self, while_fulfilling: bool) -> Self {
        match self {
            Self::Unreachable
            | Self::InvalidFields
            | Self::TransferNotFound
            | Self::DuplicateId
            | Self::AlreadyRolledBack
            | Self::AlreadyFulfilled
            | Self::InsufficientBalance => self,
            Self::NotAccepted if while_fulfilling => Self::InvalidFulfillment,
            Self::NotAccepted => Self::NotAccepted,
            Self::TransferNotConditional => Self::TransferNotFound,
            Self::AccountNotFound => Self::InvalidFields,
            Self::NoSubscriptions => Self::Unreachable,
            Self::InvalidFulfillment
            | Self::MissingFulfillment
            | Self::RequestHandlerAlreadyRegistered => Self::NotAccepted,
        }
    }

    /// Translate a wire-model kind into the event taxonomy.
    pub fn to_event(self) -> Self {
        match self {
            Self::Unreachable
            | Self::NotAccepted
            | Self::InvalidFields
            | Self::TransferNotFound
            | Self::DuplicateId
            | Self::AlreadyRolledBack
            | Self::AlreadyFulfilled
            | Self::InsufficientBalance => self,
            Self::InvalidFulfillment
            | Self::TransferNotConditional
            | Self::AccountNotFound
            | Self::NoSubscriptions
            | Self::MissingFulfillment
            | Self::RequestHandlerAlreadyRegistered => Self::NotAccepted,
        }
    }

    /// Resolve a peer-supplied name or code, falling back to `NotAccepted`.
    pub fn from_wire_label(name: &str, code: &str) -> Self {
        name.parse::<Self>()
            .ok()
            .filter(|kind| kind.is_canonical())
            .or_else(|| Self::from_code(code))
            .unwrap_or(Self::NotAccepted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownErrorKind(s.to_string()))
    }
}

/// Name that is not part of either taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error kind: {0}")]
pub struct UnknownErrorKind(pub String);

/// Failure of a ledger operation, as seen by event-model callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LedgerError {
    /// Event-model kind.
    pub kind: ErrorKind,
    /// Wire-model kind reported by the peer, when the failure came off the wire.
    pub remote_kind: Option<ErrorKind>,
    pub message: String,
}

impl LedgerError {
    /// A locally raised failure.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            remote_kind: None,
            message: kind.event_message().to_string(),
        }
    }

    /// Translate a kind reported by the peer.
    pub fn from_remote(remote_kind: ErrorKind) -> Self {
        let kind = remote_kind.to_event();
        Self {
            kind,
            remote_kind: Some(remote_kind),
            message: kind.event_message().to_string(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_round_trip() {
        for kind in ErrorKind::CANONICAL {
            let back = kind.to_wire(false).to_event();
            if kind == ErrorKind::InvalidFulfillment {
                // wire-only kind, has no event-model counterpart
                assert_eq!(back, ErrorKind::NotAccepted);
            } else {
                assert_eq!(back, kind, "{kind} did not round-trip");
            }
        }
    }

    #[test]
    fn not_accepted_while_fulfilling_loses_its_origin() {
        let wire = ErrorKind::NotAccepted.to_wire(true);
        assert_eq!(wire, ErrorKind::InvalidFulfillment);
        assert_eq!(wire.code(), Some("F04"));
        assert_eq!(wire.to_event(), ErrorKind::NotAccepted);
    }

    #[test]
    fn event_only_kinds_collapse() {
        assert_eq!(
            ErrorKind::TransferNotConditional.to_wire(false),
            ErrorKind::TransferNotFound
        );
        assert_eq!(ErrorKind::AccountNotFound.to_wire(false), ErrorKind::InvalidFields);
        assert_eq!(ErrorKind::NoSubscriptions.to_wire(true), ErrorKind::Unreachable);
        assert_eq!(
            ErrorKind::RequestHandlerAlreadyRegistered.to_wire(false),
            ErrorKind::NotAccepted
        );
        for kind in ErrorKind::ALL {
            assert!(kind.to_wire(false).is_canonical());
            assert!(kind.to_wire(true).is_canonical());
        }
    }

    #[test]
    fn codes_are_unique_three_characters() {
        let mut codes: Vec<_> = ErrorKind::CANONICAL
            .iter()
            .filter_map(|k| k.code())
            .collect();
        assert_eq!(codes.len(), 9);
        assert!(codes.iter().all(|c| c.len() == 3));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 9);
        assert_eq!(ErrorKind::from_code("F08"), Some(ErrorKind::InsufficientBalance));
        assert_eq!(ErrorKind::from_code("F02"), None);
    }

    #[test]
    fn parses_names() {
        assert_eq!("DuplicateIdError".parse::<ErrorKind>(), Ok(ErrorKind::DuplicateId));
        assert!("TeapotError".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn unrecognized_wire_labels_fall_back() {
        assert_eq!(
            ErrorKind::from_wire_label("TeapotError", "X99"),
            ErrorKind::NotAccepted
        );
        assert_eq!(
            ErrorKind::from_wire_label("", "F06"),
            ErrorKind::AlreadyRolledBack
        );
        // event-only names are not wire kinds
        assert_eq!(
            ErrorKind::from_wire_label("AccountNotFoundError", ""),
            ErrorKind::NotAccepted
        );
    }

    #[test]
    fn remote_errors_keep_the_wire_kind() {
        let err = LedgerError::from_remote(ErrorKind::InvalidFulfillment);
        assert_eq!(err.kind, ErrorKind::NotAccepted);
        assert_eq!(err.remote_kind, Some(ErrorKind::InvalidFulfillment));
        assert_eq!(
            err.message,
            "An operation has been rejected due to ledger-side logic"
        );
    }
}
