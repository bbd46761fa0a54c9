//! One broker node's runtime.
//!
//! A [`Worker`] owns the reactor, the timer wheel, the client pool, the leader
//! link and the queues. Everything except the cross-thread event queue is
//! touched only from the thread calling [`Worker::run_once`].

mod clients;
mod forward;
mod leader;
mod sync;

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Poll, Token, Waker};
use serde_json::json;

use crate::cluster::ClusterContext;
use crate::config::AppConfig;
use crate::events::{EventQueue, NotifyError, WorkerNotifier};
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::logging::{LogLevel, Logger};
use crate::orchestrator::dispatcher::RequestDispatcher;
use crate::orchestrator::queues::{QueueManager, SyncQueueData};
use crate::pools::ConnectionPool;
use crate::server::{ClientConnection, TcpAcceptor, UdpEndpoint};
use crate::timer::{TimerError, TimerId, TimerKind, TimerWheel};
use crate::wire::codec::{CodecConfig, WireCodec};
use crate::wire::forward::forwarding_codec;

pub const ACCEPTOR_TOKEN: Token = Token(0);
pub const UDP_TOKEN: Token = Token(1);
pub const WAKER_TOKEN: Token = Token(2);
pub const LEADER_TOKEN: Token = Token(3);
const CLIENT_TOKEN_BASE: usize = 16;

const EVENTS_CAPACITY: usize = 1024;

fn client_token(slot: u32) -> Token {
    Token(CLIENT_TOKEN_BASE + slot as usize)
}

/// Handler kind addressed by a reactor token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handler {
    Acceptor,
    Udp,
    Waker,
    Leader,
    Client(u32),
    Unknown,
}

impl From<Token> for Handler {
    fn from(token: Token) -> Self {
        match token {
            ACCEPTOR_TOKEN => Self::Acceptor,
            UDP_TOKEN => Self::Udp,
            WAKER_TOKEN => Self::Waker,
            LEADER_TOKEN => Self::Leader,
            Token(value) if value >= CLIENT_TOKEN_BASE => {
                u32::try_from(value - CLIENT_TOKEN_BASE).map_or(Self::Unknown, Self::Client)
            }
            Token(_) => Self::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Readiness {
    handler: Handler,
    readable: bool,
    writable: bool,
    closed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            handler: Handler::from(event.token()),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed() || event.is_error(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub client_pool_capacity: usize,
    pub event_queue_capacity: usize,
    pub poll_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub forward_response_ttl_secs: i64,
    /// `None` disables the periodic status report.
    pub status_interval: Option<Duration>,
    pub max_pending_output_bytes: usize,
    pub codec: CodecConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for WorkerSettings {
    fn from(config: &AppConfig) -> Self {
        let worker = &config.worker;
        Self {
            client_pool_capacity: worker.client_pool_capacity as usize,
            event_queue_capacity: worker.event_queue_capacity as usize,
            poll_timeout: Duration::from_millis(worker.poll_timeout_ms),
            heartbeat: HeartbeatConfig {
                interval_secs: worker.heartbeat_interval_secs,
            },
            forward_response_ttl_secs: i64::try_from(worker.forward_response_ttl_secs)
                .unwrap_or(i64::MAX),
            status_interval: (worker.status_interval_secs > 0)
                .then(|| Duration::from_secs(worker.status_interval_secs)),
            max_pending_output_bytes: usize::try_from(worker.max_pending_output_bytes)
                .unwrap_or(usize::MAX),
            codec: CodecConfig::from(config.wire),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    Reactor,
    TimerEngine,
    EventQueue,
    Waker,
    UdpListener,
    TcpAcceptor,
    Heartbeat,
}

impl Subsystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reactor => "reactor",
            Self::TimerEngine => "timer engine",
            Self::EventQueue => "event queue",
            Self::Waker => "wake-up signal",
            Self::UdpListener => "udp listener",
            Self::TcpAcceptor => "tcp acceptor",
            Self::Heartbeat => "leader heartbeat",
        }
    }
}

#[derive(Debug)]
pub enum WorkerError {
    Init {
        subsystem: Subsystem,
        source: Box<dyn Error + Send + Sync>,
    },
    Poll {
        source: io::Error,
    },
    Timer(TimerError),
}

impl WorkerError {
    fn init(subsystem: Subsystem, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Init {
            subsystem,
            source: source.into(),
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init { subsystem, source } => {
                write!(f, "failed to initialize {}: {source}", subsystem.as_str())
            }
            Self::Poll { source } => write!(f, "reactor poll failed: {source}"),
            Self::Timer(source) => write!(f, "timer scheduling failed: {source}"),
        }
    }
}

impl Error for WorkerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Init { source, .. } => Some(source.as_ref()),
            Self::Poll { source } => Some(source),
            Self::Timer(source) => Some(source),
        }
    }
}

impl From<TimerError> for WorkerError {
    fn from(value: TimerError) -> Self {
        Self::Timer(value)
    }
}

pub struct Worker {
    settings: WorkerSettings,
    context: ClusterContext,
    dispatcher: Box<dyn RequestDispatcher>,
    logger: Logger,
    /// Limits client-level envelopes.
    codec: WireCodec,
    /// Limits TCP framing and forward envelopes, which wrap whole client frames.
    forward_codec: WireCodec,
    poll: Poll,
    events: Events,
    timers: TimerWheel,
    event_queue: Arc<EventQueue>,
    waker: Arc<Waker>,
    udp: UdpEndpoint,
    acceptor: TcpAcceptor,
    clients: ConnectionPool<ClientConnection>,
    leader_link: Option<leader::LeaderLink>,
    heartbeat: Heartbeat,
    heartbeat_timer: Option<TimerId>,
    queues: QueueManager,
}

impl Worker {
    /// Brings up reactor, timers, event queue, wake-up signal, UDP listener and
    /// TCP acceptor in that order, then runs the first leader heartbeat tick.
    pub fn initialize(
        settings: WorkerSettings,
        context: ClusterContext,
        dispatcher: Box<dyn RequestDispatcher>,
        logger: Logger,
    ) -> Result<Self, WorkerError> {
        let identity = context.self_identity().clone();
        let logger = logger.scoped(&format!("worker-{}", identity.node_id));

        let poll = Poll::new().map_err(|source| WorkerError::init(Subsystem::Reactor, source))?;
        logger.debug(None, "reactor ready");

        let timers = TimerWheel::new();
        logger.debug(None, "timer engine ready");

        if settings.event_queue_capacity == 0 {
            return Err(WorkerError::init(
                Subsystem::EventQueue,
                "event queue capacity must be greater than 0",
            ));
        }
        let event_queue = Arc::new(EventQueue::with_capacity(settings.event_queue_capacity));
        logger.debug(None, "event queue ready");

        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|source| WorkerError::init(Subsystem::Waker, source))?;
        logger.debug(None, "wake-up signal ready");

        let address = identity
            .socket_addr()
            .map_err(|source| WorkerError::init(Subsystem::UdpListener, source))?;
        let mut udp = UdpEndpoint::bind(address)
            .map_err(|source| WorkerError::init(Subsystem::UdpListener, source))?;
        udp.register(poll.registry(), UDP_TOKEN)
            .map_err(|source| WorkerError::init(Subsystem::UdpListener, source))?;
        // An ephemeral port resolves on the UDP bind; TCP follows it.
        let bound = udp
            .local_addr()
            .map_err(|source| WorkerError::init(Subsystem::UdpListener, source))?;

        let mut acceptor = TcpAcceptor::bind(bound)
            .map_err(|source| WorkerError::init(Subsystem::TcpAcceptor, source))?;
        acceptor
            .register(poll.registry(), ACCEPTOR_TOKEN)
            .map_err(|source| WorkerError::init(Subsystem::TcpAcceptor, source))?;

        let heartbeat = Heartbeat::new(identity.node_id, settings.heartbeat)
            .map_err(|source| WorkerError::init(Subsystem::Heartbeat, source))?;

        logger.log(
            LogLevel::Info,
            None,
            "worker listening",
            Some(json!({
                "node_id": identity.node_id,
                "address": bound.to_string(),
                "client_pool_capacity": settings.client_pool_capacity,
            })),
        );

        let codec = WireCodec::new(settings.codec);
        let mut worker = Self {
            forward_codec: forwarding_codec(&codec),
            codec,
            clients: ConnectionPool::with_capacity(settings.client_pool_capacity),
            settings,
            context,
            dispatcher,
            logger,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            timers,
            event_queue,
            waker: Arc::new(waker),
            udp,
            acceptor,
            leader_link: None,
            heartbeat,
            heartbeat_timer: None,
            queues: QueueManager::new(),
        };

        worker.leader_tick()?;
        if let Some(interval) = worker.settings.status_interval {
            worker.timers.schedule_after(TimerKind::StatusReport, interval)?;
        }

        Ok(worker)
    }

    /// Closes the UDP listener, discards queued events, closes every
    /// connection and releases the reactor.
    pub fn teardown(mut self) {
        let _ = self.udp.deregister(self.poll.registry());
        let discarded_events = self.event_queue.discard_all();

        self.close_leader_link("worker teardown");

        let drained = self.clients.drain();
        let closed_clients = drained.len();
        for (_, mut connection) in drained {
            let _ = connection.deregister(self.poll.registry());
            connection.shutdown();
        }

        let _ = self.acceptor.deregister(self.poll.registry());
        self.timers.clear();

        self.logger.log(
            LogLevel::Info,
            None,
            "worker torn down",
            Some(json!({
                "discarded_events": discarded_events,
                "closed_clients": closed_clients,
            })),
        );
    }

    /// One bounded reactor wait followed by every due timer.
    pub fn run_once(&mut self) -> Result<(), WorkerError> {
        let timeout = self
            .timers
            .poll_timeout(Instant::now(), self.settings.poll_timeout);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => return Err(WorkerError::Poll { source }),
        }

        let ready = self.events.iter().map(Readiness::from).collect::<Vec<_>>();
        for readiness in ready {
            self.dispatch(readiness);
        }
        // Events whose wake-up failed still get picked up here.
        if !self.event_queue.is_empty() {
            self.drain_events();
        }

        self.fire_due_timers()
    }

    fn dispatch(&mut self, readiness: Readiness) {
        match readiness.handler {
            Handler::Acceptor => self.accept_clients(),
            Handler::Udp => self.read_datagrams(),
            Handler::Waker => self.drain_events(),
            Handler::Leader => self.on_leader_ready(readiness),
            Handler::Client(slot) => self.on_client_ready(slot, readiness),
            Handler::Unknown => {}
        }
    }

    fn fire_due_timers(&mut self) -> Result<(), WorkerError> {
        for (_, kind) in self.timers.drain_due(Instant::now()) {
            match kind {
                TimerKind::LeaderHeartbeat => self.leader_tick()?,
                TimerKind::StatusReport => self.report_status()?,
            }
        }
        Ok(())
    }

    fn report_status(&mut self) -> Result<(), TimerError> {
        self.logger.log(
            LogLevel::Info,
            None,
            "worker status",
            Some(json!({
                "is_leader": self.context.is_leader(),
                "leader_link": self.leader_link_state().as_str(),
                "clients": {
                    "used": self.client_count(),
                    "capacity": self.clients.capacity(),
                },
                "pending_events": self.event_queue.len(),
                "queues": self.list_queues(),
            })),
        );

        if let Some(interval) = self.settings.status_interval {
            self.timers.schedule_after(TimerKind::StatusReport, interval)?;
        }
        Ok(())
    }

    pub fn node_id(&self) -> u64 {
        self.context.self_identity().node_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn udp_local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Thread-safe handle for producers outside the reactor thread.
    pub fn notifier(&self) -> WorkerNotifier {
        WorkerNotifier::new(Arc::clone(&self.event_queue), self.waker.clone())
    }

    pub fn notify_sync_request(&self, data: &SyncQueueData) -> Result<(), NotifyError> {
        self.notifier().notify_sync_request(data)
    }

    pub fn notify_leader_change(&self) -> Result<(), NotifyError> {
        self.notifier().notify_leader_change()
    }

    /// `{ name: size }` for every known queue.
    pub fn list_queues(&self) -> BTreeMap<String, usize> {
        self.queues.list().into_iter().collect()
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub fn client_ids(&self) -> Vec<crate::pools::ConnectionId> {
        self.clients.ids()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("node_id", &self.node_id())
            .field("leader_link", &self.leader_link_state())
            .field("clients", &self.clients.len())
            .field("queues", &self.queues.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cluster::{ClusterContext, VoteData};
    use crate::logging::testing::{memory_logger, MemorySink};
    use crate::logging::LogLevel;
    use crate::orchestrator::dispatcher::{QueueProcessor, RequestDispatcher};
    use crate::wire::codec::{FrameAccumulator, WireCodec};
    use crate::wire::envelope::WireEnvelope;

    use super::{Worker, WorkerSettings};

    const PUMP_ROUNDS: usize = 300;

    pub(crate) fn test_settings() -> WorkerSettings {
        WorkerSettings {
            client_pool_capacity: 8,
            event_queue_capacity: 64,
            poll_timeout: Duration::from_millis(10),
            status_interval: None,
            ..WorkerSettings::default()
        }
    }

    pub(crate) fn loopback_identity(node_id: u64) -> VoteData {
        VoteData::new(node_id, "127.0.0.1", 0)
    }

    /// Vote pointing at a running worker's bound port.
    pub(crate) fn vote_for(worker: &Worker) -> VoteData {
        let port = worker.local_addr().expect("worker should be bound").port();
        VoteData::new(worker.node_id(), "127.0.0.1", port)
    }

    pub(crate) fn start_worker_with(
        node_id: u64,
        leader: Option<VoteData>,
        settings: WorkerSettings,
        dispatcher: Box<dyn RequestDispatcher>,
    ) -> (Worker, Arc<MemorySink>) {
        let context = ClusterContext::new(loopback_identity(node_id));
        context.apply_vote(leader);
        let (logger, sink) = memory_logger(LogLevel::Trace);
        let worker = Worker::initialize(settings, context, dispatcher, logger)
            .expect("worker should initialize");
        (worker, sink)
    }

    pub(crate) fn start_worker(node_id: u64, leader: Option<VoteData>) -> (Worker, Arc<MemorySink>) {
        start_worker_with(node_id, leader, test_settings(), Box::new(QueueProcessor::new()))
    }

    pub(crate) fn start_leader(node_id: u64) -> (Worker, Arc<MemorySink>) {
        start_worker(node_id, Some(loopback_identity(node_id)))
    }

    /// Alternates `run_once` over `workers` until `done` holds.
    pub(crate) fn pump_until(
        workers: &mut [&mut Worker],
        mut done: impl FnMut(&[&mut Worker]) -> bool,
    ) -> bool {
        for _ in 0..PUMP_ROUNDS {
            for worker in workers.iter_mut() {
                worker.run_once().expect("run_once should not fail");
            }
            if done(workers) {
                return true;
            }
        }
        false
    }

    pub(crate) fn pump(workers: &mut [&mut Worker], rounds: usize) {
        for _ in 0..rounds {
            for worker in workers.iter_mut() {
                worker.run_once().expect("run_once should not fail");
            }
        }
    }

    /// Blocking-free test client speaking the framed wire protocol.
    pub(crate) struct TestClient {
        stream: TcpStream,
        inbound: FrameAccumulator,
        codec: WireCodec,
        eof: bool,
    }

    impl TestClient {
        pub(crate) fn connect(address: SocketAddr) -> Self {
            let stream = TcpStream::connect(address).expect("client should connect");
            stream
                .set_nonblocking(true)
                .expect("client should be non-blocking");
            Self {
                stream,
                inbound: FrameAccumulator::new(),
                codec: WireCodec::default(),
                eof: false,
            }
        }

        pub(crate) fn send(&mut self, envelope: WireEnvelope) {
            let frame = envelope.encode(&self.codec).expect("encode request");
            self.stream.set_nonblocking(false).expect("blocking write");
            self.stream.write_all(&frame).expect("write request");
            self.stream.set_nonblocking(true).expect("non-blocking read");
        }

        pub(crate) fn request(&mut self, request_id: &str, document: &str) {
            self.send(WireEnvelope::request(request_id, document));
        }

        /// Next complete frame, if one arrived.
        pub(crate) fn try_recv(&mut self) -> Option<WireEnvelope> {
            let mut chunk = [0_u8; 4096];
            loop {
                match self.stream.read(&mut chunk) {
                    Ok(0) => {
                        self.eof = true;
                        break;
                    }
                    Ok(len) => self.inbound.extend(&chunk[..len]),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.eof = true;
                        break;
                    }
                }
            }
            self.inbound
                .next_frame(&self.codec)
                .expect("frame should be well formed")
                .map(|frame| WireEnvelope::decode(&self.codec, &frame).expect("decode reply"))
        }

        pub(crate) fn is_disconnected(&mut self) -> bool {
            let _ = self.try_recv();
            self.eof
        }
    }
}
