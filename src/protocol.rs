//! Protocol message types for the location link.
//!
//! All messages are newline-delimited JSON over iroh ALPN protocol `vivre/1`.
//! Every message is an envelope `{"type": .., "data": ..}`; receivers skip
//! envelopes whose `type` they do not know, so new kinds can be added without
//! breaking older peers.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::location::LocationSample;

/// The ALPN protocol identifier for the location link.
pub const ALPN: &[u8] = b"vivre/1";

/// First line written by the dialing side once its stream is open.
pub const PREAMBLE: &str = "vivre/1";

/// Messages exchanged between linked peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// The sender's most recent position.
    Location(LocationSample),
}

/// Result of decoding one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(ProtocolMessage),
    /// A well-formed envelope with a `type` this version does not handle.
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl ProtocolMessage {
    /// Serialize to a single JSON line, without the trailing newline.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse one line received from a peer.
    pub fn decode(line: &str) -> Result<Decoded, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(line).map_err(ProtocolError::Decode)?;
        match envelope.kind.as_str() {
            "location" => {
                let data = envelope
                    .data
                    .ok_or_else(|| ProtocolError::MissingData(envelope.kind.clone()))?;
                let sample =
                    serde_json::from_value::<LocationSample>(data).map_err(ProtocolError::Decode)?;
                Ok(Decoded::Message(ProtocolMessage::Location(sample)))
            }
            _ => Ok(Decoded::Unknown {
                kind: envelope.kind,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_envelope_shape() {
        let sample = LocationSample::new(10.0, 20.0, 42).unwrap();
        let line = ProtocolMessage::Location(sample).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "location",
                "data": {"latitude": 10.0, "longitude": 20.0, "observedAt": 42}
            })
        );
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_decode_location() {
        let decoded = ProtocolMessage::decode(
            r#"{"type":"location","data":{"latitude":-33.9,"longitude":151.2,"observedAt":7}}"#,
        )
        .unwrap();
        let expected = LocationSample::new(-33.9, 151.2, 7).unwrap();
        assert_eq!(decoded, Decoded::Message(ProtocolMessage::Location(expected)));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            ProtocolMessage::decode(r#"{"type":"ping"}"#).unwrap(),
            Decoded::Unknown {
                kind: "ping".to_string()
            }
        );
        assert_eq!(
            ProtocolMessage::decode(r#"{"type":"heading","data":{"degrees":12}}"#).unwrap(),
            Decoded::Unknown {
                kind: "heading".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            ProtocolMessage::decode("not json"),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            ProtocolMessage::decode(r#"{"type":"location"}"#),
            Err(ProtocolError::MissingData(_))
        ));
        assert!(matches!(
            ProtocolMessage::decode(
                r#"{"type":"location","data":{"latitude":95,"longitude":0,"observedAt":1}}"#
            ),
            Err(ProtocolError::Decode(_))
        ));
    }
}
