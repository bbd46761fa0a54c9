//! Follower-to-leader forwarding envelopes.
//!
//! A follower wraps a client frame it cannot execute into a [`ForwardRequest`]
//! together with an opaque [`SourceData`] capsule naming the requester. The
//! leader answers with a [`ForwardResponse`] that echoes the capsule bytes and
//! the timestamp untouched, which is all the follower needs to route the reply.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rmpv::Value;

use crate::pools::ConnectionId;
use crate::wire::codec::{CodecConfig, WireCodec};
use crate::wire::envelope::{
    EnvelopeError, PayloadMap, WireEnvelope, FORWARD_REQUEST_MESSAGE_TYPE,
    FORWARD_RESPONSE_MESSAGE_TYPE, SERVER_PUSH_REQUEST_ID,
};

/// Encoded size of a [`SourceData`] capsule. Anything else is corrupt.
pub const SOURCE_DATA_SIZE: usize = 32;

/// Room a forward envelope needs around the client frame it carries.
pub const FORWARD_OVERHEAD_BYTES: usize = 1024;

const TCP_FLAG_OFFSET: usize = 0;
const SLOT_OFFSET: usize = 1;
const GENERATION_OFFSET: usize = 5;
const FAMILY_OFFSET: usize = 13;
const IP_OFFSET: usize = 14;
const PORT_OFFSET: usize = 30;

const FAMILY_NONE: u8 = 0;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

#[derive(Debug, PartialEq)]
pub enum ForwardError {
    Envelope(EnvelopeError),
    UnexpectedMessageType { expected: i64, actual: i64 },
    SourceSizeMismatch { expected: usize, actual: usize },
    CorruptSource { reason: &'static str },
    Stale { age_secs: i64, ttl_secs: i64 },
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(source) => write!(f, "forward envelope error: {source}"),
            Self::UnexpectedMessageType { expected, actual } => write!(
                f,
                "unexpected forward message type {actual}, expected {expected}"
            ),
            Self::SourceSizeMismatch { expected, actual } => write!(
                f,
                "source capsule is {actual} bytes, expected {expected}"
            ),
            Self::CorruptSource { reason } => write!(f, "corrupt source capsule: {reason}"),
            Self::Stale { age_secs, ttl_secs } => write!(
                f,
                "forward response is {age_secs}s old, ttl is {ttl_secs}s"
            ),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<EnvelopeError> for ForwardError {
    fn from(value: EnvelopeError) -> Self {
        Self::Envelope(value)
    }
}

/// Where a forwarded response must be delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceData {
    Tcp(ConnectionId),
    Udp(SocketAddr),
}

impl SourceData {
    pub fn to_bytes(&self) -> [u8; SOURCE_DATA_SIZE] {
        let mut bytes = [0_u8; SOURCE_DATA_SIZE];
        match self {
            Self::Tcp(id) => {
                bytes[TCP_FLAG_OFFSET] = 1;
                bytes[SLOT_OFFSET..GENERATION_OFFSET].copy_from_slice(&id.slot().to_be_bytes());
                bytes[GENERATION_OFFSET..FAMILY_OFFSET]
                    .copy_from_slice(&id.generation().to_be_bytes());
            }
            Self::Udp(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        bytes[FAMILY_OFFSET] = FAMILY_V4;
                        bytes[IP_OFFSET..IP_OFFSET + 4].copy_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        bytes[FAMILY_OFFSET] = FAMILY_V6;
                        bytes[IP_OFFSET..PORT_OFFSET].copy_from_slice(&ip.octets());
                    }
                }
                bytes[PORT_OFFSET..].copy_from_slice(&addr.port().to_be_bytes());
            }
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ForwardError> {
        if bytes.len() != SOURCE_DATA_SIZE {
            return Err(ForwardError::SourceSizeMismatch {
                expected: SOURCE_DATA_SIZE,
                actual: bytes.len(),
            });
        }

        match bytes[TCP_FLAG_OFFSET] {
            1 => {
                let slot = u32::from_be_bytes(read_array(bytes, SLOT_OFFSET));
                let generation = u64::from_be_bytes(read_array(bytes, GENERATION_OFFSET));
                Ok(Self::Tcp(ConnectionId::new(slot, generation)))
            }
            0 => {
                let port = u16::from_be_bytes(read_array(bytes, PORT_OFFSET));
                let ip = match bytes[FAMILY_OFFSET] {
                    FAMILY_V4 => IpAddr::V4(Ipv4Addr::from(read_array::<4>(bytes, IP_OFFSET))),
                    FAMILY_V6 => IpAddr::V6(Ipv6Addr::from(read_array::<16>(bytes, IP_OFFSET))),
                    FAMILY_NONE => {
                        return Err(ForwardError::CorruptSource {
                            reason: "udp source without address",
                        })
                    }
                    _ => {
                        return Err(ForwardError::CorruptSource {
                            reason: "unknown address family",
                        })
                    }
                };
                Ok(Self::Udp(SocketAddr::new(ip, port)))
            }
            _ => Err(ForwardError::CorruptSource {
                reason: "invalid transport flag",
            }),
        }
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardRequest {
    pub timestamp: i64,
    pub source: Vec<u8>,
    pub data: Vec<u8>,
}

impl ForwardRequest {
    pub fn new(timestamp: i64, source: &SourceData, data: Vec<u8>) -> Self {
        Self {
            timestamp,
            source: source.to_bytes().to_vec(),
            data,
        }
    }

    pub fn from_envelope(envelope: &WireEnvelope) -> Result<Self, ForwardError> {
        let (timestamp, source, data) =
            parse_forward_payload(envelope, FORWARD_REQUEST_MESSAGE_TYPE)?;
        Ok(Self {
            timestamp,
            source,
            data,
        })
    }

    pub fn into_envelope(self) -> WireEnvelope {
        forward_envelope(FORWARD_REQUEST_MESSAGE_TYPE, self.timestamp, self.source, self.data)
    }

    /// Builds the reply; source capsule and timestamp are carried over as-is.
    pub fn answer(self, data: Vec<u8>) -> ForwardResponse {
        ForwardResponse {
            timestamp: self.timestamp,
            source: self.source,
            data,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardResponse {
    pub timestamp: i64,
    pub source: Vec<u8>,
    pub data: Vec<u8>,
}

impl ForwardResponse {
    pub fn from_envelope(envelope: &WireEnvelope) -> Result<Self, ForwardError> {
        let (timestamp, source, data) =
            parse_forward_payload(envelope, FORWARD_RESPONSE_MESSAGE_TYPE)?;
        Ok(Self {
            timestamp,
            source,
            data,
        })
    }

    pub fn into_envelope(self) -> WireEnvelope {
        forward_envelope(FORWARD_RESPONSE_MESSAGE_TYPE, self.timestamp, self.source, self.data)
    }

    /// Staleness and corruption guard. Returns the decoded destination when the
    /// response is still deliverable at `now` (unix seconds).
    pub fn destination(&self, now: i64, ttl_secs: i64) -> Result<SourceData, ForwardError> {
        let age_secs = now.saturating_sub(self.timestamp);
        if age_secs >= ttl_secs {
            return Err(ForwardError::Stale { age_secs, ttl_secs });
        }

        SourceData::from_bytes(&self.source)
    }
}

/// Codec for forward envelopes. Any frame `client` accepts still fits once
/// wrapped.
pub fn forwarding_codec(client: &WireCodec) -> WireCodec {
    WireCodec::new(CodecConfig {
        max_envelope_size_bytes: client.max_frame_size_bytes() + FORWARD_OVERHEAD_BYTES,
    })
}

fn forward_envelope(message_type: i64, timestamp: i64, source: Vec<u8>, data: Vec<u8>) -> WireEnvelope {
    let mut payload = PayloadMap::new();
    payload.insert("ts".to_owned(), Value::Integer(timestamp.into()));
    payload.insert("src".to_owned(), Value::Binary(source));
    payload.insert("data".to_owned(), Value::Binary(data));
    WireEnvelope::new(message_type, SERVER_PUSH_REQUEST_ID, payload)
}

fn parse_forward_payload(
    envelope: &WireEnvelope,
    expected_type: i64,
) -> Result<(i64, Vec<u8>, Vec<u8>), ForwardError> {
    if envelope.message_type != expected_type {
        return Err(ForwardError::UnexpectedMessageType {
            expected: expected_type,
            actual: envelope.message_type,
        });
    }

    let timestamp = envelope.payload_i64("ts")?;
    let source = envelope.payload_bytes("src")?.to_vec();
    let data = envelope.payload_bytes("data")?.to_vec();
    Ok((timestamp, source, data))
}
