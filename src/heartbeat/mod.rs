use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmpv::Value;
use uuid::Uuid;

use crate::wire::envelope::{
    EnvelopeError, PayloadMap, WireEnvelope, HEARTBEAT_MESSAGE_TYPE, SERVER_PUSH_REQUEST_ID,
};

pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum HeartbeatError {
    InvalidInterval { provided_secs: u64 },
    UnexpectedMessageType { actual: i64 },
    Envelope(EnvelopeError),
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_secs } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_SECS}s and {MAX_INTERVAL_SECS}s, got {provided_secs}s"
            ),
            Self::UnexpectedMessageType { actual } => {
                write!(f, "expected heartbeat message, got type {actual}")
            }
            Self::Envelope(source) => write!(f, "invalid heartbeat: {source}"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

impl From<EnvelopeError> for HeartbeatError {
    fn from(value: EnvelopeError) -> Self {
        Self::Envelope(value)
    }
}

/// Heartbeat as received by the leader.
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatBeat {
    pub node_id: u64,
    pub session_id: String,
    pub timestamp: i64,
}

impl HeartbeatBeat {
    pub fn from_envelope(envelope: &WireEnvelope) -> Result<Self, HeartbeatError> {
        if envelope.message_type != HEARTBEAT_MESSAGE_TYPE {
            return Err(HeartbeatError::UnexpectedMessageType {
                actual: envelope.message_type,
            });
        }

        let node_id = envelope.payload_i64("node_id")?;
        let node_id = u64::try_from(node_id).map_err(|_| EnvelopeError::IntegerOutOfRange {
            field: "node_id",
        })?;
        Ok(Self {
            node_id,
            session_id: envelope.payload_str("sid")?.to_owned(),
            timestamp: envelope.payload_i64("ts")?,
        })
    }
}

/// Outbound heartbeat state for one leader link session.
///
/// A fresh session id is drawn every time the link is re-established so the
/// leader can tell reconnects apart.
#[derive(Debug)]
pub struct Heartbeat {
    node_id: u64,
    interval: Duration,
    session_id: Uuid,
    sent: u64,
}

impl Heartbeat {
    pub fn new(node_id: u64, config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        Self::validate_interval(config.interval_secs)?;

        Ok(Self {
            node_id,
            interval: Duration::from_secs(config.interval_secs),
            session_id: Uuid::new_v4(),
            sent: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn new_session(&mut self) {
        self.session_id = Uuid::new_v4();
        self.sent = 0;
    }

    /// Builds the next heartbeat envelope and records it as sent.
    pub fn next_envelope(&mut self, now: DateTime<Utc>) -> WireEnvelope {
        self.sent += 1;

        let mut payload = PayloadMap::new();
        payload.insert("node_id".to_owned(), Value::Integer(self.node_id.into()));
        payload.insert(
            "sid".to_owned(),
            Value::String(self.session_id.to_string().into()),
        );
        payload.insert("ts".to_owned(), Value::Integer(now.timestamp().into()));
        WireEnvelope::new(HEARTBEAT_MESSAGE_TYPE, SERVER_PUSH_REQUEST_ID, payload)
    }

    fn validate_interval(interval_secs: u64) -> Result<(), HeartbeatError> {
        if (MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
            return Ok(());
        }

        Err(HeartbeatError::InvalidInterval {
            provided_secs: interval_secs,
        })
    }
}
