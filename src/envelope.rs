// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutation envelope wire format.
//!
//! ```json
//! {"Key": "model.User", "Action": "save", "Payload": "eyJpZCI6N30="}
//! ```
//!
//! - `Action` is `"save"`, `"delete"` or `""`; empty or missing means save.
//! - `Payload` is written as base64. On read it may also be raw JSON, which
//!   lets hand-written envelopes carry the entity inline.

use crate::error::{RelayError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Action {
    #[default]
    Save,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Save => "save",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "save" => Ok(Action::Save),
            "delete" => Ok(Action::Delete),
            other => Err(RelayError::Serialization(format!("unknown action: {:?}", other))),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.as_deref()
            .unwrap_or("")
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// One captured mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "Action", default)]
    pub action: Action,

    /// JSON encoding of the entity.
    #[serde(rename = "Payload", with = "payload_bytes", default)]
    pub payload: Vec<u8>,
}

impl MutationEnvelope {
    pub fn new(key: impl Into<String>, action: Action, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            action,
            payload,
        }
    }

    pub fn save(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(key, Action::Save, payload)
    }

    pub fn delete(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(key, Action::Delete, payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod payload_bytes {
    use super::*;
    use serde_json::Value;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Vec::new()),
            Value::String(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| serde::de::Error::custom(format!("payload is not base64: {}", e))),
            raw => serde_json::to_vec(&raw).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uses_base64_payload() {
        let env = MutationEnvelope::save("model.User", br#"{"id":7}"#.to_vec());
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert_eq!(json["Key"], "model.User");
        assert_eq!(json["Action"], "save");
        assert_eq!(json["Payload"], "eyJpZCI6N30=");
    }

    #[test]
    fn test_decode_base64_payload() {
        let env = MutationEnvelope::decode(
            br#"{"Key":"model.User","Action":"delete","Payload":"eyJpZCI6N30="}"#,
        )
        .unwrap();
        assert_eq!(env.action, Action::Delete);
        assert_eq!(env.payload, br#"{"id":7}"#.to_vec());
    }

    #[test]
    fn test_decode_raw_json_payload() {
        let env = MutationEnvelope::decode(br#"{"Key":"model.User","Action":"save","Payload":{"id":7}}"#).unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&env.payload).unwrap();
        assert_eq!(payload["id"], 7);
    }

    #[test]
    fn test_empty_or_missing_action_is_save() {
        let empty = MutationEnvelope::decode(br#"{"Key":"k","Action":"","Payload":"e30="}"#).unwrap();
        let missing = MutationEnvelope::decode(br#"{"Key":"k","Payload":"e30="}"#).unwrap();
        let null = MutationEnvelope::decode(br#"{"Key":"k","Action":null}"#).unwrap();

        assert_eq!(empty.action, Action::Save);
        assert_eq!(missing.action, Action::Save);
        assert_eq!(null.action, Action::Save);
        assert!(null.payload.is_empty());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = MutationEnvelope::decode(br#"{"Key":"k","Action":"upsert","Payload":"e30="}"#).unwrap_err();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(MutationEnvelope::decode(br#"{"Key":"k","Payload":"not base64!"}"#).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(MutationEnvelope::decode(b"\x00\x01garbage").is_err());
        assert!(MutationEnvelope::decode(b"").is_err());
    }

    #[test]
    fn test_action_display_and_parse() {
        assert_eq!(Action::Delete.to_string(), "delete");
        assert_eq!("save".parse::<Action>().unwrap(), Action::Save);
        assert!("SAVE".parse::<Action>().is_err());
    }
}
