use std::fmt;

use chrono::Utc;
use serde_json::Value;

use crate::orchestrator::dispatcher::{fill_error, parse_request, DispatchError};
use crate::wire::envelope::{
    FrameError, WireEnvelope, ENCODING_FAILED_CODE, LEADER_UNAVAILABLE_CODE,
    PROTOCOL_VIOLATION_CODE, REQUEST_MESSAGE_TYPE,
};
use crate::wire::forward::{ForwardError, ForwardRequest, ForwardResponse, SourceData};

use super::Worker;

/// What happened to a forwarded response on its way back to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    DroppedMalformed,
    DroppedStale,
    DroppedCorrupt,
    DroppedIdentityMismatch,
    DroppedSendFailed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::DroppedMalformed => "dropped: malformed",
            Self::DroppedStale => "dropped: stale",
            Self::DroppedCorrupt => "dropped: corrupt source",
            Self::DroppedIdentityMismatch => "dropped: connection identity mismatch",
            Self::DroppedSendFailed => "dropped: send failed",
        }
    }
}

/// Reasons the leader side declines a forwarded request.
#[derive(Debug, PartialEq)]
pub enum ForwardRefusal {
    NotLeader,
    Malformed(String),
}

impl fmt::Display for ForwardRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLeader => write!(f, "this node is not the leader"),
            Self::Malformed(reason) => write!(f, "malformed forward request: {reason}"),
        }
    }
}

/// Why a follower could not hand a request to the leader.
#[derive(Debug, PartialEq)]
enum ForwardFailure {
    Unavailable(String),
    Encoding(String),
}

impl ForwardFailure {
    fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => LEADER_UNAVAILABLE_CODE,
            Self::Encoding(_) => ENCODING_FAILED_CODE,
        }
    }
}

impl fmt::Display for ForwardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(reason) => f.write_str(reason),
            Self::Encoding(reason) => write!(f, "cannot encode forward request: {reason}"),
        }
    }
}

impl From<ForwardError> for ForwardRefusal {
    fn from(value: ForwardError) -> Self {
        Self::Malformed(value.to_string())
    }
}

impl From<FrameError> for ForwardRefusal {
    fn from(value: FrameError) -> Self {
        Self::Malformed(value.to_string())
    }
}

/// Pulls the JSON request document out of a client `REQUEST` envelope.
pub(super) fn request_document(envelope: &WireEnvelope) -> Result<Value, DispatchError> {
    let raw = envelope
        .document()
        .map_err(|error| DispatchError::MalformedDocument {
            reason: error.to_string(),
        })?;
    parse_request(raw)
}

impl Worker {
    /// Serves a client request locally or forwards it to the leader.
    ///
    /// Returns the reply frame to send right away; `None` when the request went
    /// to the leader and the reply will arrive as a forward response.
    pub(super) fn handle_request(
        &mut self,
        source: SourceData,
        frame: Vec<u8>,
        envelope: &WireEnvelope,
    ) -> Option<Vec<u8>> {
        if let Err(error) = envelope.validate_client_to_server() {
            return self.encode_reply(WireEnvelope::error(
                envelope.request_id.clone(),
                PROTOCOL_VIOLATION_CODE,
                &error.to_string(),
            ));
        }

        // Queue state lives on the leader only; followers forward everything.
        if self.context.is_leader() {
            let reply = self.execute_document(&envelope.request_id, request_document(envelope));
            return self.encode_reply(reply);
        }

        match self.forward_to_leader(source, frame) {
            Ok(()) => None,
            Err(failure) => self.encode_reply(WireEnvelope::error(
                envelope.request_id.clone(),
                failure.code(),
                &failure.to_string(),
            )),
        }
    }

    /// Runs a parsed document through the dispatcher. Failures still produce a
    /// response document carrying `code` and `reason`.
    fn execute_document(
        &mut self,
        request_id: &str,
        document: Result<Value, DispatchError>,
    ) -> WireEnvelope {
        let document = match document {
            Ok(mut document) => {
                if let Err(error) = self.dispatcher.process(&mut document, &mut self.queues) {
                    self.logger
                        .debug(None, &format!("request {request_id} failed: {error}"));
                }
                document
            }
            Err(error) => {
                let mut document = Value::Null;
                fill_error(&mut document, &error);
                document
            }
        };
        WireEnvelope::response(request_id, &document.to_string())
    }

    /// Encodes a reply with the client limit. A reply that cannot be encoded
    /// is replaced by an `ENCODING_FAILED` error for the same request.
    pub(super) fn encode_reply(&self, envelope: WireEnvelope) -> Option<Vec<u8>> {
        let request_id = envelope.request_id.clone();
        let error = match envelope.encode(&self.codec) {
            Ok(frame) => return Some(frame),
            Err(error) => error,
        };
        self.logger.warn(
            None,
            &format!("reply to request {request_id} cannot be encoded: {error}"),
        );

        match WireEnvelope::error(request_id, ENCODING_FAILED_CODE, &error.to_string())
            .encode(&self.codec)
        {
            Ok(frame) => Some(frame),
            Err(error) => {
                self.logger
                    .error(None, &format!("failed to encode error reply: {error}"));
                None
            }
        }
    }

    fn forward_to_leader(
        &mut self,
        source: SourceData,
        frame: Vec<u8>,
    ) -> Result<(), ForwardFailure> {
        let Some(link) = self.leader_link.as_mut() else {
            return Err(ForwardFailure::Unavailable(
                "no connection to the leader".to_owned(),
            ));
        };
        if link.connection.is_closed() {
            return Err(ForwardFailure::Unavailable(format!(
                "connection to leader {} is closed",
                link.target
            )));
        }

        let forwarded = ForwardRequest::new(Utc::now().timestamp(), &source, frame)
            .into_envelope()
            .encode(&self.forward_codec)
            .map_err(|error| ForwardFailure::Encoding(error.to_string()))?;
        link.connection.send_frame(&forwarded).map_err(|error| {
            link.connection.mark_closed();
            ForwardFailure::Unavailable(format!("cannot reach leader {}: {error}", link.target))
        })?;

        self.logger.trace(
            None,
            &format!(
                "forwarded request from {} to leader {}",
                describe_source(&source),
                link.target
            ),
        );
        Ok(())
    }

    /// Leader side: executes a forwarded client frame and builds the
    /// `FORWARD_RESPONSE` frame echoing the request's source and timestamp.
    pub(crate) fn answer_forward_request(
        &mut self,
        envelope: &WireEnvelope,
    ) -> Result<Vec<u8>, ForwardRefusal> {
        if !self.context.is_leader() {
            return Err(ForwardRefusal::NotLeader);
        }

        let request = ForwardRequest::from_envelope(envelope)?;
        let client_envelope = WireEnvelope::decode(&self.codec, &request.data)?;
        if client_envelope.message_type != REQUEST_MESSAGE_TYPE {
            return Err(ForwardRefusal::Malformed(format!(
                "embedded message type {} is not a request",
                client_envelope.message_type
            )));
        }

        let document = request_document(&client_envelope);
        let reply = self.execute_document(&client_envelope.request_id, document);
        let reply_frame = self.encode_reply(reply).ok_or_else(|| {
            ForwardRefusal::Malformed(format!(
                "no reply could be encoded for request {}",
                client_envelope.request_id
            ))
        })?;
        Ok(request
            .answer(reply_frame)
            .into_envelope()
            .encode(&self.forward_codec)?)
    }

    pub(crate) fn route_forward_response(&mut self, envelope: &WireEnvelope) -> DeliveryOutcome {
        self.route_forward_response_at(Utc::now().timestamp(), envelope)
    }

    /// Follower side: delivers a forward response to the client named by its
    /// source capsule, as of `now` (unix seconds).
    pub(crate) fn route_forward_response_at(
        &mut self,
        now: i64,
        envelope: &WireEnvelope,
    ) -> DeliveryOutcome {
        let response = match ForwardResponse::from_envelope(envelope) {
            Ok(response) => response,
            Err(error) => {
                self.logger
                    .trace(None, &format!("dropping forward response: {error}"));
                return DeliveryOutcome::DroppedMalformed;
            }
        };

        let destination =
            match response.destination(now, self.settings.forward_response_ttl_secs) {
                Ok(destination) => destination,
                Err(error) => {
                    self.logger
                        .trace(None, &format!("dropping forward response: {error}"));
                    return match error {
                        ForwardError::Stale { .. } => DeliveryOutcome::DroppedStale,
                        _ => DeliveryOutcome::DroppedCorrupt,
                    };
                }
            };

        match destination {
            SourceData::Tcp(id) => {
                let connection = match self.clients.resolve_mut(id) {
                    Ok(connection) => connection,
                    Err(error) => {
                        self.logger
                            .trace(None, &format!("dropping forward response: {error}"));
                        return DeliveryOutcome::DroppedIdentityMismatch;
                    }
                };
                match connection.send_frame(&response.data) {
                    Ok(()) => DeliveryOutcome::Delivered,
                    Err(error) => {
                        connection.mark_closed();
                        self.logger
                            .trace(None, &format!("forward response to {id} failed: {error}"));
                        DeliveryOutcome::DroppedSendFailed
                    }
                }
            }
            SourceData::Udp(peer) => match self.udp.send_to(&response.data, peer) {
                Ok(_) => DeliveryOutcome::Delivered,
                Err(error) => {
                    self.logger
                        .trace(None, &format!("forward response to {peer} failed: {error}"));
                    DeliveryOutcome::DroppedSendFailed
                }
            },
        }
    }
}

fn describe_source(source: &SourceData) -> String {
    match source {
        SourceData::Tcp(id) => format!("tcp client {id}"),
        SourceData::Udp(peer) => format!("udp client {peer}"),
    }
}
