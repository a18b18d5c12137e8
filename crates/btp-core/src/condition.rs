//! Fixed-length crypto-condition values.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Accepts standard and URL-safe alphabets, with or without padding.
pub(crate) fn decode_base64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = s
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    STANDARD_NO_PAD.decode(normalized)
}

pub(crate) fn encode_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Error building a 32-byte value from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDigest {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

macro_rules! digest_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Parse from base64 (either alphabet, padding optional).
            pub fn from_base64(s: &str) -> Result<Self, InvalidDigest> {
                let bytes = decode_base64(s)?;
                let array: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| InvalidDigest::Length(bytes.len()))?;
                Ok(Self(array))
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// URL-safe, unpadded base64.
            pub fn to_base64url(&self) -> String {
                encode_base64url(&self.0)
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_base64url())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_base64url())
            }
        }
    };
}

digest_type!(
    /// Execution condition of a transfer.
    Condition
);

digest_type!(
    /// Preimage that fulfills a [`Condition`].
    Fulfillment
);
