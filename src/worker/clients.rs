use std::net::SocketAddr;

use crate::heartbeat::HeartbeatBeat;
use crate::pools::{AcquireError, ConnectionId};
use crate::server::{ClientConnection, ServerError};
use crate::wire::codec::FRAME_HEADER_SIZE_BYTES;
use crate::wire::envelope::{
    WireEnvelope, FORWARD_REQUEST_MESSAGE_TYPE, HEARTBEAT_MESSAGE_TYPE, PROTOCOL_VIOLATION_CODE,
    REQUEST_MESSAGE_TYPE, SERVER_PUSH_REQUEST_ID, UNSUPPORTED_MESSAGE_CODE,
};
use crate::wire::forward::SourceData;

use super::forward::ForwardRefusal;
use super::{client_token, Readiness, Worker};

impl Worker {
    /// Accepts until the backlog is empty. Connections that find the pool
    /// full, or fail their setup, are dropped on the spot.
    pub(super) fn accept_clients(&mut self) {
        loop {
            let (stream, peer) = match self.acceptor.try_accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(error) => {
                    self.logger.warn(None, &format!("accept failed: {error}"));
                    return;
                }
            };

            let registry = self.poll.registry();
            let max_pending_output = self.settings.max_pending_output_bytes;
            let accepted = self.clients.acquire_with(|id| {
                let mut connection = ClientConnection::accepted(stream, peer)?
                    .with_max_pending_output(max_pending_output);
                connection.register(registry, client_token(id.slot()))?;
                Ok::<_, ServerError>(connection)
            });

            match accepted {
                Ok(id) => self
                    .logger
                    .debug(None, &format!("client {id} connected from {peer}")),
                Err(AcquireError::Pool(error)) => self
                    .logger
                    .warn(None, &format!("rejecting client {peer}: {error}")),
                Err(AcquireError::Init(error)) => self
                    .logger
                    .warn(None, &format!("rejecting client {peer}: {error}")),
            }
        }
    }

    pub(super) fn on_client_ready(&mut self, slot: u32, readiness: Readiness) {
        let Some(id) = self.clients.current_id(slot) else {
            return;
        };
        let Some(connection) = self.clients.get_mut(id) else {
            return;
        };

        if readiness.writable {
            if let Err(error) = connection.flush() {
                self.logger
                    .debug(None, &format!("client {id} write failed: {error}"));
            }
        }

        let mut frames = Vec::new();
        if (readiness.readable || readiness.closed) && !connection.is_closed() {
            let batch = connection.read_frames(&self.forward_codec);
            if let Some(error) = batch.error {
                self.logger
                    .debug(None, &format!("client {id} read failed: {error}"));
            }
            frames = batch.frames;
        }

        for frame in frames {
            self.handle_client_frame(id, frame);
        }

        if self
            .clients
            .get(id)
            .is_some_and(|connection| connection.is_closed())
        {
            self.close_client(id);
        }
    }

    fn handle_client_frame(&mut self, id: ConnectionId, frame: Vec<u8>) {
        // Framing admits forward envelopes; everything else keeps the client limit.
        let envelope = match WireEnvelope::decode(&self.forward_codec, &frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                let reply = self.encode_reply(WireEnvelope::error(
                    SERVER_PUSH_REQUEST_ID,
                    PROTOCOL_VIOLATION_CODE,
                    &error.to_string(),
                ));
                self.send_to_client(id, reply);
                return;
            }
        };

        if envelope.message_type != FORWARD_REQUEST_MESSAGE_TYPE
            && frame.len() > self.codec.max_frame_size_bytes()
        {
            let reply = self.encode_reply(WireEnvelope::error(
                envelope.request_id.clone(),
                PROTOCOL_VIOLATION_CODE,
                &format!(
                    "envelope of {} bytes exceeds limit {}",
                    frame.len() - FRAME_HEADER_SIZE_BYTES,
                    self.codec.max_envelope_size_bytes()
                ),
            ));
            self.send_to_client(id, reply);
            return;
        }

        match envelope.message_type {
            REQUEST_MESSAGE_TYPE => {
                let reply = self.handle_request(SourceData::Tcp(id), frame, &envelope);
                self.send_to_client(id, reply);
            }
            FORWARD_REQUEST_MESSAGE_TYPE => match self.answer_forward_request(&envelope) {
                Ok(answer) => self.send_to_client(id, Some(answer)),
                Err(ForwardRefusal::NotLeader) => self.logger.warn(
                    None,
                    &format!("refusing forward request from client {id}: not the leader"),
                ),
                Err(refusal) => self
                    .logger
                    .warn(None, &format!("dropping forward request from client {id}: {refusal}")),
            },
            HEARTBEAT_MESSAGE_TYPE => match HeartbeatBeat::from_envelope(&envelope) {
                Ok(beat) => {
                    if let Some(connection) = self.clients.get_mut(id) {
                        connection.set_peer_node_id(beat.node_id);
                    }
                    self.logger.trace(
                        None,
                        &format!("heartbeat from node {} (sid {}) on {id}", beat.node_id, beat.session_id),
                    );
                }
                Err(error) => self
                    .logger
                    .debug(None, &format!("bad heartbeat on client {id}: {error}")),
            },
            other => {
                let reply = self.encode_reply(WireEnvelope::error(
                    envelope.request_id.clone(),
                    UNSUPPORTED_MESSAGE_CODE,
                    &format!("message type {other} is not accepted here"),
                ));
                self.send_to_client(id, reply);
            }
        }
    }

    fn send_to_client(&mut self, id: ConnectionId, frame: Option<Vec<u8>>) {
        let Some(frame) = frame else {
            return;
        };
        let Some(connection) = self.clients.get_mut(id) else {
            return;
        };
        if let Err(error) = connection.send_frame(&frame) {
            connection.mark_closed();
            self.logger
                .debug(None, &format!("reply to client {id} failed: {error}"));
        }
    }

    /// Returns the slot to the pool; the identity is retired with it.
    pub(super) fn close_client(&mut self, id: ConnectionId) {
        let Some(mut connection) = self.clients.release(id) else {
            return;
        };
        let _ = connection.deregister(self.poll.registry());
        connection.shutdown();

        let peer_node = connection
            .peer_node_id()
            .map(|node_id| format!(" (node {node_id})"))
            .unwrap_or_default();
        self.logger.debug(
            None,
            &format!(
                "client {id} from {}{peer_node} closed",
                connection.peer_addr()
            ),
        );
    }

    pub(super) fn read_datagrams(&mut self) {
        loop {
            match self.udp.try_recv() {
                Ok(Some((datagram, peer))) => self.handle_datagram(datagram, peer),
                Ok(None) => return,
                Err(error) => {
                    self.logger
                        .warn(None, &format!("udp receive failed: {error}"));
                    return;
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Vec<u8>, peer: SocketAddr) {
        let envelope = match WireEnvelope::decode(&self.codec, &datagram) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.logger
                    .trace(None, &format!("dropping datagram from {peer}: {error}"));
                return;
            }
        };
        if envelope.message_type != REQUEST_MESSAGE_TYPE {
            self.logger.trace(
                None,
                &format!(
                    "dropping datagram from {peer}: message type {}",
                    envelope.message_type
                ),
            );
            return;
        }

        let Some(reply) = self.handle_request(SourceData::Udp(peer), datagram, &envelope) else {
            return;
        };
        if let Err(error) = self.udp.send_to(&reply, peer) {
            self.logger
                .debug(None, &format!("reply to {peer} failed: {error}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::{
        WireEnvelope, ERROR_MESSAGE_TYPE, RESPONSE_MESSAGE_TYPE, UNSUPPORTED_MESSAGE_CODE,
    };

    use crate::orchestrator::dispatcher::QueueProcessor;

    use super::super::testing::{
        loopback_identity, pump_until, start_leader, start_worker_with, test_settings,
        TestClient,
    };
    use super::super::WorkerSettings;

    fn document_of(envelope: &WireEnvelope) -> Value {
        serde_json::from_str(envelope.document().expect("document")).expect("JSON document")
    }

    #[test]
    fn exhausted_pool_rejects_without_disturbing_existing_clients() {
        let settings = WorkerSettings {
            client_pool_capacity: 1,
            ..test_settings()
        };
        let (mut worker, sink) = start_worker_with(
            1,
            Some(loopback_identity(1)),
            settings,
            Box::new(QueueProcessor::new()),
        );
        let address = worker.local_addr().expect("addr");

        let mut kept = TestClient::connect(address);
        assert!(pump_until(&mut [&mut worker], |workers| workers[0].client_count() == 1));
        let kept_id = worker.client_ids()[0];

        let mut rejected = TestClient::connect(address);
        assert!(pump_until(&mut [&mut worker], |_| rejected.is_disconnected()));
        assert!(sink.contains("rejecting client"));
        assert_eq!(worker.client_ids(), vec![kept_id]);

        kept.request("1", r#"{"action":"produce","queue":"orders","data":1}"#);
        let mut reply = None;
        assert!(pump_until(&mut [&mut worker], |_| {
            reply = kept.try_recv();
            reply.is_some()
        }));
        let reply = reply.expect("kept client should be served");
        assert_eq!(document_of(&reply)["size"], json!(1));
    }

    #[test]
    fn closed_client_returns_its_slot() {
        let (mut worker, _) = start_leader(1);
        let client = TestClient::connect(worker.local_addr().expect("addr"));
        assert!(pump_until(&mut [&mut worker], |workers| workers[0].client_count() == 1));

        drop(client);
        assert!(pump_until(&mut [&mut worker], |workers| workers[0].client_count() == 0));
    }

    #[test]
    fn leader_serves_requests_and_keeps_pipelined_order() {
        let (mut worker, _) = start_leader(1);
        let mut client = TestClient::connect(worker.local_addr().expect("addr"));
        client.request("1", r#"{"action":"produce","queue":"orders","data":"a"}"#);
        client.request("2", r#"{"action":"consume","queue":"orders"}"#);

        let mut replies = Vec::new();
        assert!(pump_until(&mut [&mut worker], |_| {
            while let Some(reply) = client.try_recv() {
                replies.push(reply);
            }
            replies.len() == 2
        }));

        assert_eq!(replies[0].request_id, "1");
        assert_eq!(replies[1].request_id, "2");
        assert_eq!(document_of(&replies[1])["data"], json!("a"));
    }

    #[test]
    fn malformed_document_gets_error_fields_in_response() {
        let (mut worker, _) = start_leader(1);
        let mut client = TestClient::connect(worker.local_addr().expect("addr"));
        client.request("4", "not json");

        let mut reply = None;
        assert!(pump_until(&mut [&mut worker], |_| {
            reply = client.try_recv();
            reply.is_some()
        }));
        let reply = reply.expect("reply should arrive");
        assert_eq!(reply.message_type, RESPONSE_MESSAGE_TYPE);
        assert_eq!(document_of(&reply)["code"], json!(1));
    }

    #[test]
    fn unsupported_message_type_is_answered_with_error() {
        let (mut worker, _) = start_leader(1);
        let mut client = TestClient::connect(worker.local_addr().expect("addr"));
        client.send(WireEnvelope::response("8", "{}"));

        let mut reply = None;
        assert!(pump_until(&mut [&mut worker], |_| {
            reply = client.try_recv();
            reply.is_some()
        }));
        let reply = reply.expect("reply should arrive");
        assert_eq!(reply.message_type, ERROR_MESSAGE_TYPE);
        assert_eq!(reply.payload_str("code"), Ok(UNSUPPORTED_MESSAGE_CODE));
    }

    #[test]
    fn leader_answers_udp_requests_directly() {
        let (mut worker, _) = start_leader(1);
        let client = UdpSocket::bind("127.0.0.1:0").expect("client udp");
        client
            .set_read_timeout(Some(Duration::from_millis(5)))
            .expect("read timeout");
        let codec = WireCodec::default();
        let datagram = WireEnvelope::request("u1", r#"{"action":"size","queue":"none"}"#)
            .encode(&codec)
            .expect("encode");
        client
            .send_to(&datagram, worker.udp_local_addr().expect("udp addr"))
            .expect("send");

        let mut buf = [0_u8; 1024];
        let mut received = None;
        assert!(pump_until(&mut [&mut worker], |_| {
            if let Ok((len, _)) = client.recv_from(&mut buf) {
                received = Some(buf[..len].to_vec());
            }
            received.is_some()
        }));
        let reply = WireEnvelope::decode(&codec, &received.expect("reply")).expect("decode");
        assert_eq!(reply.request_id, "u1");
        assert_eq!(document_of(&reply)["size"], json!(0));
    }
}
