//! Wire representation of the mutations carried in Raft log entries.
//!
//! A command is a JSON object:
//!
//! ```json
//! {"op": "SET", "key": "a", "value": "MQ=="}
//! {"op": "DEL", "key": "a"}
//! ```
//!
//! `value` is base64 and only allowed for `SET`. The set of ops is closed: anything else is a
//! decode failure, never a silent no-op.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const OP_SET: &str = "SET";
pub const OP_DEL: &str = "DEL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: Vec<u8> },
    Del { key: String },
}

#[derive(Debug)]
pub enum DecodeError {
    Malformed(serde_json::Error),
    UnknownOp { op: String },
    EmptyKey,
    MissingValue { key: String },
    UnexpectedValue { key: String },
    InvalidValue { key: String, source: base64::DecodeError },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed command: {e}"),
            Self::UnknownOp { op } => write!(f, "{op} is an invalid command"),
            Self::EmptyKey => write!(f, "command key must not be empty"),
            Self::MissingValue { key } => write!(f, "SET {key}: missing value"),
            Self::UnexpectedValue { key } => write!(f, "DEL {key}: unexpected value"),
            Self::InvalidValue { key, source } => write!(f, "SET {key}: invalid value: {source}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            Self::InvalidValue { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCommand {
    op: String,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Del { key } => key,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Set { .. } => OP_SET,
            Self::Del { .. } => OP_DEL,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let wire = match self {
            Self::Set { key, value } => WireCommand {
                op: OP_SET.to_string(),
                key: key.clone(),
                value: Some(base64::engine::general_purpose::STANDARD.encode(value)),
            },
            Self::Del { key } => WireCommand {
                op: OP_DEL.to_string(),
                key: key.clone(),
                value: None,
            },
        };
        serde_json::to_vec(&wire).expect("command wire form is string fields only")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireCommand = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
        if wire.key.is_empty() {
            return Err(DecodeError::EmptyKey);
        }
        match wire.op.as_str() {
            OP_SET => {
                let Some(value) = wire.value else {
                    return Err(DecodeError::MissingValue { key: wire.key });
                };
                let value = match base64::engine::general_purpose::STANDARD.decode(value) {
                    Ok(v) => v,
                    Err(source) => {
                        return Err(DecodeError::InvalidValue {
                            key: wire.key,
                            source,
                        });
                    }
                };
                Ok(Self::Set {
                    key: wire.key,
                    value,
                })
            }
            OP_DEL => {
                if wire.value.is_some() {
                    return Err(DecodeError::UnexpectedValue { key: wire.key });
                }
                Ok(Self::Del { key: wire.key })
            }
            _ => Err(DecodeError::UnknownOp { op: wire.op }),
        }
    }
}

/// Serde adapter storing `Vec<u8>` as a base64 string.
pub(crate) mod serde_base64 {
    use base64::Engine as _;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_wire_format_uses_base64_value() {
        let bytes = Command::set("a", b"1".to_vec()).encode();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, serde_json::json!({"op": "SET", "key": "a", "value": "MQ=="}));
    }

    #[test]
    fn del_wire_format_omits_value() {
        let bytes = Command::del("a").encode();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, serde_json::json!({"op": "DEL", "key": "a"}));
    }

    #[test]
    fn decode_accepts_null_value_for_del() {
        let cmd = Command::decode(br#"{"op":"DEL","key":"k","value":null}"#).unwrap();
        assert_eq!(cmd, Command::del("k"));
    }

    #[test]
    fn decode_preserves_binary_values() {
        let value = vec![0u8, 255, 10, 13, 0];
        let cmd = Command::decode(&Command::set("bin", value.clone()).encode()).unwrap();
        assert_eq!(cmd, Command::Set {
            key: "bin".to_string(),
            value,
        });
    }

    #[test]
    fn encode_handles_awkward_keys_and_values() {
        for cmd in [
            Command::set("quote\"and\\slash", Vec::<u8>::new()),
            Command::set("ключ/🔑", vec![0u8; 3]),
            Command::del("\n\t"),
        ] {
            let bytes = cmd.encode();
            assert!(!bytes.is_empty());
            assert_eq!(Command::decode(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn decode_rejects_unknown_op() {
        let err = Command::decode(br#"{"op":"INCR","key":"k"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOp { ref op } if op == "INCR"));
        assert_eq!(err.to_string(), "INCR is an invalid command");
    }

    #[test]
    fn decode_rejects_lowercase_op() {
        let err = Command::decode(br#"{"op":"set","key":"k","value":"MQ=="}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOp { .. }));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let cases: [&[u8]; 4] = [b"", b"not json", b"{\"op\":\"SET\"}", &[0xff, 0xfe, 0x00]];
        for raw in cases {
            let err = Command::decode(raw).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed(_)), "{raw:?}: {err}");
        }
    }

    #[test]
    fn decode_rejects_set_without_value() {
        let err = Command::decode(br#"{"op":"SET","key":"k"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingValue { .. }));
    }

    #[test]
    fn decode_rejects_del_with_value() {
        let err = Command::decode(br#"{"op":"DEL","key":"k","value":"MQ=="}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedValue { .. }));
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        let err = Command::decode(br#"{"op":"SET","key":"k","value":"***"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { .. }));
    }

    #[test]
    fn decode_rejects_empty_key() {
        let err = Command::decode(br#"{"op":"DEL","key":""}"#).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyKey));
    }
}
