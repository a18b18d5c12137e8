//! Protocol data: the named, typed attachments of a BTP message.
//!
//! [`build`] turns the loose fields of an event into attachments. Its output
//! order is part of the wire contract: peers decoding a Message or Response
//! treat item 0 as the primary payload, so `ilp` comes first, then custom
//! entries in insertion order, then `from`, then `to`.

use crate::condition::{decode_base64, encode_base64url};
use crate::{CustomData, Message, PayloadValue, Transfer};
use serde::{Deserialize, Serialize};

/// Content type of a protocol-data item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContentType {
    OctetStream = 0,
    TextPlainUtf8 = 1,
    ApplicationJson = 2,
}

/// One named attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolData {
    pub protocol_name: String,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl ProtocolData {
    pub fn new(name: impl Into<String>, content_type: ContentType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            protocol_name: name.into(),
            content_type,
            data: data.into(),
        }
    }

    pub fn binary(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(name, ContentType::OctetStream, data)
    }

    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, ContentType::TextPlainUtf8, text.into().into_bytes())
    }

    pub fn json(name: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(name, ContentType::ApplicationJson, value.to_string().into_bytes())
    }

    /// Data as text, replacing invalid UTF-8.
    pub fn data_as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Find an item by name.
pub fn find<'a>(items: &'a [ProtocolData], name: &str) -> Option<&'a ProtocolData> {
    items.iter().find(|item| item.protocol_name == name)
}

/// Error building protocol data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} is not valid base64: {source}")]
pub struct InvalidBase64 {
    pub field: String,
    pub source: base64::DecodeError,
}

/// Event fields that become protocol data.
pub trait Attachments {
    fn ilp(&self) -> Option<&str>;
    fn custom(&self) -> &CustomData;
    fn from_account(&self) -> Option<&str>;
    fn to_account(&self) -> Option<&str>;
}

impl Attachments for Transfer {
    fn ilp(&self) -> Option<&str> {
        self.ilp.as_deref()
    }
    fn custom(&self) -> &CustomData {
        &self.custom
    }
    fn from_account(&self) -> Option<&str> {
        self.from.as_deref()
    }
    fn to_account(&self) -> Option<&str> {
        self.to.as_deref()
    }
}

impl Attachments for Message {
    fn ilp(&self) -> Option<&str> {
        self.ilp.as_deref()
    }
    fn custom(&self) -> &CustomData {
        &self.custom
    }
    fn from_account(&self) -> Option<&str> {
        self.from.as_deref()
    }
    fn to_account(&self) -> Option<&str> {
        self.to.as_deref()
    }
}

/// Build the ordered protocol data for an event.
pub fn build(event: &impl Attachments) -> Result<Vec<ProtocolData>, InvalidBase64> {
    let mut items = Vec::new();

    if let Some(ilp) = event.ilp() {
        items.push(ProtocolData::binary("ilp", base64_field("ilp", ilp)?));
    }

    for (name, value) in event.custom().iter() {
        items.push(custom_item(name, value)?);
    }

    if let Some(from) = event.from_account() {
        items.push(ProtocolData::text("from", from));
    }
    if let Some(to) = event.to_account() {
        items.push(ProtocolData::text("to", to));
    }

    Ok(items)
}

fn custom_item(name: &str, value: &PayloadValue) -> Result<ProtocolData, InvalidBase64> {
    let item = match name {
        "vouch" => {
            let data = match value {
                PayloadValue::Binary(bytes) => bytes.clone(),
                PayloadValue::Text(text) => base64_field(name, text)?,
                PayloadValue::Json(serde_json::Value::String(text)) => base64_field(name, text)?,
                PayloadValue::Json(other) => other.to_string().into_bytes(),
            };
            ProtocolData::binary(name, data)
        }
        // passed through unencoded
        "info" | "balance" => {
            let data = match value {
                PayloadValue::Binary(bytes) => bytes.clone(),
                PayloadValue::Text(text) => text.clone().into_bytes(),
                PayloadValue::Json(json) => json.to_string().into_bytes(),
            };
            ProtocolData::binary(name, data)
        }
        _ => {
            let json = match value {
                PayloadValue::Binary(bytes) => serde_json::Value::String(encode_base64url(bytes)),
                PayloadValue::Text(text) => serde_json::Value::String(text.clone()),
                PayloadValue::Json(json) => json.clone(),
            };
            ProtocolData::json(name, &json)
        }
    };
    Ok(item)
}

fn base64_field(field: &str, text: &str) -> Result<Vec<u8>, InvalidBase64> {
    decode_base64(text).map_err(|source| InvalidBase64 {
        field: field.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(items: &[ProtocolData]) -> Vec<&str> {
        items.iter().map(|i| i.protocol_name.as_str()).collect()
    }

    #[test]
    fn full_event_order() {
        let message = Message {
            ilp: Some("AQID".into()),
            custom: CustomData::new().with("memo", json!({"note": "hi"})),
            from: Some("test.alice".into()),
            to: Some("test.bob".into()),
            ..Message::default()
        };
        let items = build(&message).unwrap();
        assert_eq!(names(&items), ["ilp", "memo", "from", "to"]);
        assert_eq!(items[0].content_type, ContentType::OctetStream);
        assert_eq!(items[0].data, [1, 2, 3]);
        assert_eq!(items[1].content_type, ContentType::ApplicationJson);
        assert_eq!(items[1].data, br#"{"note":"hi"}"#);
        assert_eq!(items[2].content_type, ContentType::TextPlainUtf8);
        assert_eq!(items[3].data, b"test.bob");
    }

    #[test]
    fn empty_event_has_no_items() {
        assert!(build(&Message::default()).unwrap().is_empty());
    }

    #[test]
    fn custom_entries_keep_map_order() {
        let message = Message::with_custom(
            CustomData::new()
                .with("zz", "last-alphabetically")
                .with("info", vec![2u8])
                .with("aa", json!(1)),
        );
        let items = build(&message).unwrap();
        assert_eq!(names(&items), ["zz", "info", "aa"]);
    }

    #[test]
    fn content_types_follow_names() {
        let message = Message::with_custom(
            CustomData::new()
                .with("vouch", "AQI=")
                .with("balance", vec![0u8])
                .with("get_fulfillment", "transfer-1"),
        );
        let items = build(&message).unwrap();
        assert_eq!(items[0].content_type, ContentType::OctetStream);
        assert_eq!(items[0].data, [1, 2]);
        assert_eq!(items[1].content_type, ContentType::OctetStream);
        assert_eq!(items[1].data, [0]);
        assert_eq!(items[2].content_type, ContentType::ApplicationJson);
        assert_eq!(items[2].data, br#""transfer-1""#);
    }

    #[test]
    fn bad_base64_is_reported() {
        let message = Message {
            ilp: Some("not base64!".into()),
            ..Message::default()
        };
        let err = build(&message).unwrap_err();
        assert_eq!(err.field, "ilp");
    }
}
