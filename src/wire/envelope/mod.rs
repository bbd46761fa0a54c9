use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::{CodecError, MessageEnvelope, WireCodec};

pub const PROTOCOL_VERSION: i64 = 1;
pub const SERVER_PUSH_REQUEST_ID: &str = "0";

pub const REQUEST_MESSAGE_TYPE: i64 = 1;
pub const HEARTBEAT_MESSAGE_TYPE: i64 = 2;
pub const FORWARD_REQUEST_MESSAGE_TYPE: i64 = 3;
pub const ERROR_MESSAGE_TYPE: i64 = 100;
pub const RESPONSE_MESSAGE_TYPE: i64 = 101;
pub const FORWARD_RESPONSE_MESSAGE_TYPE: i64 = 103;

pub const LEADER_UNAVAILABLE_CODE: &str = "LEADER_UNAVAILABLE";
pub const PROTOCOL_VIOLATION_CODE: &str = "PROTOCOL_VIOLATION";
pub const UNSUPPORTED_MESSAGE_CODE: &str = "UNSUPPORTED_MESSAGE";
pub const ENCODING_FAILED_CODE: &str = "ENCODING_FAILED";

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    pub version: i64,
    pub message_type: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    IntegerOutOfRange { field: &'static str },
    PayloadMapKeyMustBeUtf8String,
    RequestIdRequired,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::PayloadMapKeyMustBeUtf8String => {
                write!(f, "payload map keys must be UTF-8 strings")
            }
            Self::RequestIdRequired => write!(f, "request id must be non-empty"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Either layer can reject a frame; callers usually only log the reason.
#[derive(Debug)]
pub enum FrameError {
    Codec(CodecError),
    Envelope(EnvelopeError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "frame codec error: {source}"),
            Self::Envelope(source) => write!(f, "frame envelope error: {source}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<CodecError> for FrameError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<EnvelopeError> for FrameError {
    fn from(value: EnvelopeError) -> Self {
        Self::Envelope(value)
    }
}

impl WireEnvelope {
    pub fn new(message_type: i64, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let version = parse_i64(raw.get("v"), "v")?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::InvalidProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let message_type = parse_i64(raw.get("t"), "t")?;
        let request_id = parse_string(raw.get("rid"), "rid")?;
        let payload = parse_payload_map(raw.get("p"))?;

        Ok(Self {
            version,
            message_type,
            request_id,
            payload,
        })
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert("v".to_owned(), Value::Integer(self.version.into()));
        raw.insert("t".to_owned(), Value::Integer(self.message_type.into()));
        raw.insert("rid".to_owned(), Value::String(self.request_id.into()));

        let payload_map = self
            .payload
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect::<Vec<_>>();
        raw.insert("p".to_owned(), Value::Map(payload_map));

        raw
    }

    pub fn decode(codec: &WireCodec, frame: &[u8]) -> Result<Self, FrameError> {
        let raw = codec.decode_frame(frame)?;
        Ok(Self::from_raw(&raw)?)
    }

    pub fn encode(self, codec: &WireCodec) -> Result<Vec<u8>, FrameError> {
        Ok(codec.encode_frame(&self.into_raw())?)
    }

    pub fn validate_client_to_server(&self) -> Result<(), EnvelopeError> {
        if self.request_id.is_empty() {
            return Err(EnvelopeError::RequestIdRequired);
        }

        Ok(())
    }

    /// Client request carrying a JSON request document as text.
    #[cfg(test)]
    pub fn request(request_id: impl Into<String>, document: &str) -> Self {
        let mut payload = PayloadMap::new();
        payload.insert("doc".to_owned(), Value::String(document.into()));
        Self::new(REQUEST_MESSAGE_TYPE, request_id, payload)
    }

    pub fn response(request_id: impl Into<String>, document: &str) -> Self {
        let mut payload = PayloadMap::new();
        payload.insert("doc".to_owned(), Value::String(document.into()));
        Self::new(RESPONSE_MESSAGE_TYPE, request_id, payload)
    }

    pub fn error(request_id: impl Into<String>, code: &str, message: &str) -> Self {
        let mut payload = PayloadMap::new();
        payload.insert("code".to_owned(), Value::String(code.into()));
        payload.insert("message".to_owned(), Value::String(message.into()));
        Self::new(ERROR_MESSAGE_TYPE, request_id, payload)
    }

    pub fn document(&self) -> Result<&str, EnvelopeError> {
        self.payload_str("doc")
    }

    pub fn payload_str(&self, field: &'static str) -> Result<&str, EnvelopeError> {
        let value = self
            .payload
            .get(field)
            .ok_or(EnvelopeError::MissingField { field })?;
        match value {
            Value::String(text) => text.as_str().ok_or(EnvelopeError::InvalidFieldType {
                field,
                expected: "string",
            }),
            _ => Err(EnvelopeError::InvalidFieldType {
                field,
                expected: "string",
            }),
        }
    }

    pub fn payload_i64(&self, field: &'static str) -> Result<i64, EnvelopeError> {
        parse_i64(self.payload.get(field), field)
    }

    pub fn payload_bytes(&self, field: &'static str) -> Result<&[u8], EnvelopeError> {
        let value = self
            .payload
            .get(field)
            .ok_or(EnvelopeError::MissingField { field })?;
        match value {
            Value::Binary(bytes) => Ok(bytes.as_slice()),
            _ => Err(EnvelopeError::InvalidFieldType {
                field,
                expected: "binary",
            }),
        }
    }
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    if let Some(v) = integer.as_i64() {
        return Ok(v);
    }

    match integer.as_u64() {
        Some(v) if v <= i64::MAX as u64 => Ok(v as i64),
        _ => Err(EnvelopeError::IntegerOutOfRange { field }),
    }
}

fn parse_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::String(text) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        });
    };

    let Some(text) = text.as_str() else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        });
    };

    Ok(text.to_owned())
}

fn parse_payload_map(value: Option<&Value>) -> Result<PayloadMap, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field: "p" })?;
    let Value::Map(entries) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field: "p",
            expected: "map",
        });
    };

    let mut payload = PayloadMap::new();
    for (key, value) in entries {
        let Value::String(text) = key else {
            return Err(EnvelopeError::PayloadMapKeyMustBeUtf8String);
        };
        let Some(text) = text.as_str() else {
            return Err(EnvelopeError::PayloadMapKeyMustBeUtf8String);
        };

        payload.insert(text.to_owned(), value.clone());
    }

    Ok(payload)
}
