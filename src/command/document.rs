//! Command documents
//!
//! Commands are flat JSON objects. Field values are loosely typed on the
//! wire: a channel may arrive as `6` or `"6"`, a flag as `true` or `"true"`.
//! The accessors below accept either form.

use serde_json::{Map, Value};

/// Recognized field names
pub mod fields {
    pub const COMMAND: &str = "Command";
    pub const PAYLOAD: &str = "Payload";
    pub const PERIOD: &str = "Period";
    pub const INCLUDE_CONTROLLER: &str = "IncludeController";
    pub const WIFI_SSID: &str = "WifiSSID";
    pub const WIFI_PASSWORD: &str = "WifiPassword";
    pub const MQTT_HOST: &str = "MQTTHost";
    pub const MQTT_USERNAME: &str = "MQTTUsername";
    pub const MQTT_PASSWORD: &str = "MQTTPassword";
    pub const MESH_CONTROLLER: &str = "MeshController";
    pub const MESH_CHANNEL: &str = "MeshChannel";
    pub const MESH_KEY: &str = "MeshKey";
    pub const MESH_PEERS: &str = "MeshPeers";

    /// Firmware URL
    pub const UPDATE_URL: &str = "U";
    /// Firmware length in bytes
    pub const UPDATE_LENGTH: &str = "L";
    /// Firmware checksum
    pub const UPDATE_CHECKSUM: &str = "C";
    /// Network to download the firmware through
    pub const UPDATE_SSID: &str = "S";
    pub const UPDATE_PASSWORD: &str = "P";
}

/// Errors raised while decoding a command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed command document: {0}")]
    MalformedDocument(String),

    #[error("the {0} property is required")]
    MissingField(&'static str),

    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
}

/// A parsed command document.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDocument {
    fields: Map<String, Value>,
}

impl CommandDocument {
    /// Parse UTF-8 JSON text. Carriage returns are ignored.
    pub fn parse(text: &[u8]) -> Result<Self, ProtocolError> {
        let cleaned: Vec<u8> = text.iter().copied().filter(|b| *b != b'\r').collect();

        let value: Value = serde_json::from_slice(&cleaned)
            .map_err(|e| ProtocolError::MalformedDocument(e.to_string()))?;

        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ProtocolError::MalformedDocument(format!(
                "expected an object, found {}",
                type_name(&other)
            ))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Field rendered as text. Missing and null fields read as `None`.
    pub fn string(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Field rendered as text, empty if missing.
    pub fn string_or_empty(&self, name: &str) -> String {
        self.string(name).unwrap_or_default()
    }

    /// Integer field, accepting numbers and numeric strings.
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Boolean field. `true`, non-zero numbers and `"true"`/`"1"` are set.
    pub fn flag(&self, name: &str) -> bool {
        match self.fields.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => {
                let s = s.trim();
                s.eq_ignore_ascii_case("true") || s == "1"
            }
            _ => false,
        }
    }

    /// The `Command` field, lowercased
    pub fn command(&self) -> Option<String> {
        self.string(fields::COMMAND).map(|c| c.to_lowercase())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decode a payload, honouring the leading `h` hex marker.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, ProtocolError> {
    match payload.strip_prefix(HEX_MARKER) {
        Some(encoded) => {
            hex::decode(encoded).map_err(|e| ProtocolError::InvalidHex(e.to_string()))
        }
        None => Ok(payload.as_bytes().to_vec()),
    }
}

/// Leading marker on a hex encoded `Payload`
pub const HEX_MARKER: char = 'h';

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        let doc = CommandDocument::parse(b"{\"Command\":\"PiNg\"}\r").unwrap();
        assert_eq!(doc.command().as_deref(), Some("ping"));
        assert!(doc.contains(fields::COMMAND));
        assert!(!doc.contains(fields::PAYLOAD));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(matches!(
            CommandDocument::parse(b"[1,2]"),
            Err(ProtocolError::MalformedDocument(_))
        ));
        assert!(matches!(
            CommandDocument::parse(b"{\"Command\":"),
            Err(ProtocolError::MalformedDocument(_))
        ));
        assert!(CommandDocument::parse(b"").is_err());
    }

    #[test]
    fn test_loose_typing() {
        let doc = CommandDocument::parse(
            br#"{"Period":"30","MeshChannel":6,"IncludeController":"true","L":123456.0,"S":null}"#,
        )
        .unwrap();

        assert_eq!(doc.integer(fields::PERIOD), Some(30));
        assert_eq!(doc.integer(fields::MESH_CHANNEL), Some(6));
        assert_eq!(doc.string(fields::MESH_CHANNEL).as_deref(), Some("6"));
        assert!(doc.flag(fields::INCLUDE_CONTROLLER));
        assert_eq!(doc.integer(fields::UPDATE_LENGTH), Some(123456));
        assert_eq!(doc.string(fields::UPDATE_SSID), None);
        assert!(doc.contains(fields::UPDATE_SSID));
    }

    #[test]
    fn test_flag_defaults_false() {
        let doc = CommandDocument::parse(br#"{"IncludeController":0}"#).unwrap();
        assert!(!doc.flag(fields::INCLUDE_CONTROLLER));
        assert!(!doc.flag(fields::PAYLOAD));
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload("h6869").unwrap(), b"hi");
        assert_eq!(decode_payload("plain").unwrap(), b"plain");
        assert!(matches!(
            decode_payload("hxyz"),
            Err(ProtocolError::InvalidHex(_))
        ));
    }
}
