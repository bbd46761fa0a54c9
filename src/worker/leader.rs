use chrono::{DateTime, Utc};
use serde_json::json;

use crate::cluster::VoteData;
use crate::logging::LogLevel;
use crate::server::{ClientConnection, ConnectionState};
use crate::timer::{TimerError, TimerKind};
use crate::wire::envelope::{WireEnvelope, FORWARD_RESPONSE_MESSAGE_TYPE};

use super::{Readiness, Worker, LEADER_TOKEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderLinkState {
    NoLeaderConnection,
    Connecting,
    Connected,
    Closed,
}

impl LeaderLinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoLeaderConnection => "none",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

/// Outbound connection to the node currently believed to be leader.
pub(super) struct LeaderLink {
    pub(super) target: VoteData,
    pub(super) connection: ClientConnection,
    pub(super) opened_at: DateTime<Utc>,
}

impl Worker {
    pub fn leader_link_state(&self) -> LeaderLinkState {
        match &self.leader_link {
            None => LeaderLinkState::NoLeaderConnection,
            Some(link) => match link.connection.state() {
                ConnectionState::Connecting => LeaderLinkState::Connecting,
                ConnectionState::Open => LeaderLinkState::Connected,
                ConnectionState::Closed => LeaderLinkState::Closed,
            },
        }
    }

    /// Re-evaluates the leader link against the latest vote.
    ///
    /// Does nothing on the leader itself. Otherwise any existing link is torn
    /// down and, when the leader is known and routable, a new non-blocking
    /// connection is started.
    pub fn on_leader_change(&mut self) {
        if self.context.is_leader() {
            self.logger
                .debug(None, "leader change ignored, this node is the leader");
            return;
        }

        let leader = match self.context.leader_identity() {
            Some(leader) if leader.is_routable() => leader,
            Some(leader) => {
                self.logger
                    .warn(None, &format!("leader {leader} is not routable, staying unlinked"));
                self.close_leader_link("leader not routable");
                return;
            }
            None => {
                self.logger.debug(None, "no leader known, staying unlinked");
                self.close_leader_link("leader unknown");
                return;
            }
        };

        self.close_leader_link("leader change");
        self.connect_leader(leader);
    }

    fn connect_leader(&mut self, leader: VoteData) {
        let address = match leader.socket_addr() {
            Ok(address) => address,
            Err(error) => {
                self.logger
                    .warn(None, &format!("cannot resolve leader {leader}: {error}"));
                return;
            }
        };

        let mut connection = match ClientConnection::connect(address) {
            Ok(connection) => {
                connection.with_max_pending_output(self.settings.max_pending_output_bytes)
            }
            Err(error) => {
                self.logger
                    .warn(None, &format!("cannot connect to leader {leader}: {error}"));
                return;
            }
        };
        if let Err(error) = connection.register(self.poll.registry(), LEADER_TOKEN) {
            self.logger.warn(
                None,
                &format!("cannot register leader connection to {leader}: {error}"),
            );
            return;
        }

        self.heartbeat.new_session();
        self.logger.log(
            LogLevel::Info,
            None,
            "connecting to leader",
            Some(json!({
                "leader": leader.node_id,
                "address": address.to_string(),
                "sid": self.heartbeat.session_id().to_string(),
            })),
        );
        self.leader_link = Some(LeaderLink {
            target: leader,
            connection,
            opened_at: Utc::now(),
        });

        // Heartbeat cadence starts over with each session.
        if let Err(error) = self.rearm_heartbeat() {
            self.logger
                .error(None, &format!("cannot reschedule leader heartbeat: {error}"));
        }
    }

    pub(super) fn close_leader_link(&mut self, reason: &str) {
        let Some(mut link) = self.leader_link.take() else {
            return;
        };
        let _ = link.connection.deregister(self.poll.registry());
        link.connection.shutdown();
        self.logger.debug(
            None,
            &format!(
                "leader link to {} closed ({reason}), open since {}",
                link.target, link.opened_at
            ),
        );
    }

    /// Periodic failover check: reconnect when the link is gone, otherwise
    /// heartbeat over it. Always reschedules itself.
    pub(super) fn leader_tick(&mut self) -> Result<(), TimerError> {
        match self.leader_link_state() {
            LeaderLinkState::NoLeaderConnection | LeaderLinkState::Closed => {
                self.on_leader_change()
            }
            LeaderLinkState::Connecting | LeaderLinkState::Connected => self.send_heartbeat(),
        }

        self.rearm_heartbeat()
    }

    /// Replaces the pending heartbeat timer with one a full interval away.
    fn rearm_heartbeat(&mut self) -> Result<(), TimerError> {
        if let Some(pending) = self.heartbeat_timer.take() {
            self.timers.cancel(pending);
        }
        let id = self
            .timers
            .schedule_after(TimerKind::LeaderHeartbeat, self.heartbeat.interval())?;
        self.heartbeat_timer = Some(id);
        Ok(())
    }

    fn send_heartbeat(&mut self) {
        let frame = match self.heartbeat.next_envelope(Utc::now()).encode(&self.codec) {
            Ok(frame) => frame,
            Err(error) => {
                self.logger
                    .error(None, &format!("failed to encode heartbeat: {error}"));
                return;
            }
        };
        let Some(link) = self.leader_link.as_mut() else {
            return;
        };
        match link.connection.send_frame(&frame) {
            Ok(()) => self.logger.trace(
                None,
                &format!("heartbeat #{} sent to {}", self.heartbeat.sent(), link.target),
            ),
            Err(error) => {
                link.connection.mark_closed();
                self.logger.warn(
                    None,
                    &format!("heartbeat to {} failed: {error}", link.target),
                );
            }
        }
    }

    pub(super) fn on_leader_ready(&mut self, readiness: Readiness) {
        let Some(link) = self.leader_link.as_mut() else {
            return;
        };
        if link.connection.is_closed() {
            return;
        }

        if link.connection.state() == ConnectionState::Connecting {
            match link.connection.finish_connect() {
                Ok(true) => self.logger.info(
                    None,
                    &format!("connected to leader {}", link.target),
                ),
                Ok(false) => return,
                Err(error) => {
                    self.logger.warn(
                        None,
                        &format!("connection to leader {} failed: {error}", link.target),
                    );
                }
            }
        }

        let mut frames = Vec::new();
        if !link.connection.is_closed() {
            if let Err(error) = link.connection.flush() {
                self.logger
                    .debug(None, &format!("leader link write failed: {error}"));
            }
            if readiness.readable || readiness.closed {
                let batch = link.connection.read_frames(&self.forward_codec);
                if let Some(error) = batch.error {
                    self.logger
                        .debug(None, &format!("leader link read failed: {error}"));
                }
                frames = batch.frames;
            }
        }

        for frame in frames {
            self.on_leader_frame(&frame);
        }

        if let Some(link) = self.leader_link.as_mut() {
            if link.connection.is_closed() {
                let _ = link.connection.deregister(self.poll.registry());
                self.logger.info(
                    None,
                    &format!("leader link to {} closed, reconnecting on next heartbeat", link.target),
                );
            }
        }
    }

    fn on_leader_frame(&mut self, frame: &[u8]) {
        let envelope = match WireEnvelope::decode(&self.forward_codec, frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.logger
                    .debug(None, &format!("dropping undecodable frame from leader: {error}"));
                return;
            }
        };

        if envelope.message_type == FORWARD_RESPONSE_MESSAGE_TYPE {
            let outcome = self.route_forward_response(&envelope);
            self.logger
                .trace(None, &format!("forward response {}", outcome.as_str()));
        } else {
            self.logger.trace(
                None,
                &format!("ignoring message type {} from leader", envelope.message_type),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crate::cluster::VoteData;
    use crate::wire::codec::{FrameAccumulator, WireCodec};
    use crate::wire::envelope::{WireEnvelope, HEARTBEAT_MESSAGE_TYPE};

    use super::super::testing::{pump_until, start_leader, start_worker};
    use super::LeaderLinkState;

    fn external_leader() -> (TcpListener, VoteData) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let port = listener.local_addr().expect("listener addr").port();
        (listener, VoteData::new(9, "127.0.0.1", port))
    }

    fn accept_within(listener: &TcpListener) -> std::net::TcpStream {
        listener
            .set_nonblocking(true)
            .expect("listener non-blocking");
        for _ in 0..200 {
            if let Ok((stream, _)) = listener.accept() {
                stream
                    .set_nonblocking(false)
                    .expect("accepted stream blocking");
                return stream;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("leader never received a connection");
    }

    #[test]
    fn leader_change_is_a_no_op_on_the_leader() {
        let (mut worker, sink) = start_leader(1);

        for _ in 0..3 {
            worker.on_leader_change();
        }
        worker.leader_tick().expect("tick should reschedule");

        assert_eq!(worker.leader_link_state(), LeaderLinkState::NoLeaderConnection);
        assert!(!sink.contains("connecting to leader"));
    }

    #[test]
    fn no_known_leader_means_no_connection_attempt() {
        let (mut worker, sink) = start_worker(2, None);

        worker.leader_tick().expect("tick should reschedule");
        assert_eq!(worker.leader_link_state(), LeaderLinkState::NoLeaderConnection);
        assert!(sink.contains("no leader known"));
        assert!(!sink.contains("connecting to leader"));
    }

    #[test]
    fn unroutable_leader_is_not_dialed() {
        let (mut worker, sink) = start_worker(2, Some(VoteData::new(1, "", 7400)));

        worker.on_leader_change();
        assert_eq!(worker.leader_link_state(), LeaderLinkState::NoLeaderConnection);
        assert!(sink.contains("is not routable"));
    }

    #[test]
    fn initialize_dials_known_leader_and_heartbeats_once_connected() {
        let (listener, vote) = external_leader();
        let (mut worker, _) = start_worker(2, Some(vote));
        assert_ne!(worker.leader_link_state(), LeaderLinkState::NoLeaderConnection);

        let mut accepted = accept_within(&listener);
        assert!(pump_until(&mut [&mut worker], |workers| {
            workers[0].leader_link_state() == LeaderLinkState::Connected
        }));

        worker.leader_tick().expect("tick should reschedule");
        accepted
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout");
        let codec = WireCodec::default();
        let mut inbound = FrameAccumulator::new();
        let mut chunk = [0_u8; 512];
        let frame = loop {
            let len = accepted.read(&mut chunk).expect("heartbeat bytes");
            assert!(len > 0, "link closed before heartbeat");
            inbound.extend(&chunk[..len]);
            if let Some(frame) = inbound.next_frame(&codec).expect("valid frame") {
                break frame;
            }
        };
        let envelope = WireEnvelope::decode(&codec, &frame).expect("decode heartbeat");
        assert_eq!(envelope.message_type, HEARTBEAT_MESSAGE_TYPE);
        assert_eq!(envelope.payload_i64("node_id"), Ok(2));
    }

    #[test]
    fn closed_link_is_replaced_on_next_heartbeat_tick() {
        let (listener, vote) = external_leader();
        let (mut worker, _) = start_worker(2, Some(vote));

        let first = accept_within(&listener);
        assert!(pump_until(&mut [&mut worker], |workers| {
            workers[0].leader_link_state() == LeaderLinkState::Connected
        }));

        drop(first);
        assert!(pump_until(&mut [&mut worker], |workers| {
            workers[0].leader_link_state() == LeaderLinkState::Closed
        }));

        worker.leader_tick().expect("tick should reschedule");
        assert!(matches!(
            worker.leader_link_state(),
            LeaderLinkState::Connecting | LeaderLinkState::Connected
        ));
        let _second = accept_within(&listener);
    }

    #[test]
    fn vote_notify_redials_new_leader() {
        let (listener_a, vote_a) = external_leader();
        let (listener_b, vote_b) = external_leader();
        let (mut worker, _) = start_worker(2, Some(vote_a));
        let _first = accept_within(&listener_a);

        worker.context.apply_vote(Some(vote_b));
        worker
            .notify_leader_change()
            .expect("notify should enqueue");
        worker.run_once().expect("run_once");

        let _second = accept_within(&listener_b);
        let target = worker
            .leader_link
            .as_ref()
            .map(|link| link.target.port);
        assert_eq!(target, Some(listener_b.local_addr().expect("addr").port()));
    }

    #[test]
    fn new_leader_link_restarts_heartbeat_cadence() {
        let (listener, vote) = external_leader();
        let (mut worker, _) = start_worker(2, Some(vote));
        let _first = accept_within(&listener);
        let first_deadline = worker.timers.next_deadline().expect("heartbeat armed");
        assert_eq!(worker.timers.len(), 1);

        thread::sleep(Duration::from_millis(20));
        worker
            .notify_leader_change()
            .expect("notify should enqueue");
        worker.run_once().expect("run_once");

        let _second = accept_within(&listener);
        let rearmed = worker.timers.next_deadline().expect("heartbeat armed");
        assert!(rearmed > first_deadline);
        assert_eq!(worker.timers.len(), 1);
    }
}
