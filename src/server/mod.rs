use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};

use crate::wire::codec::{CodecError, FrameAccumulator, WireCodec};

/// Largest datagram the UDP endpoint will read in one call.
pub const MAX_DATAGRAM_SIZE_BYTES: usize = 64 * 1024;
const READ_CHUNK_SIZE_BYTES: usize = 16 * 1024;
/// Unsent output a connection may hold before it is treated as dead.
pub const DEFAULT_MAX_PENDING_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: SocketAddr,
        source: io::Error,
    },
    Register {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => write!(f, "failed to bind {address}: {source}"),
            Self::Register { source } => {
                write!(f, "failed to register socket with reactor: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. }
            | Self::Register { source }
            | Self::ConfigureAcceptedStream { source } => Some(source),
        }
    }
}

fn interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn bind(address: SocketAddr) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(address).map_err(|source| ServerError::Bind { address, source })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<(), ServerError> {
        registry
            .register(&mut self.listener, token, Interest::READABLE)
            .map_err(|source| ServerError::Register { source })
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.listener)
    }

    /// `Ok(None)` once the backlog is empty.
    pub fn try_accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok(accepted) => Ok(Some(accepted)),
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(source),
        }
    }
}

/// Unconnected UDP socket shared by every datagram client.
pub struct UdpEndpoint {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl UdpEndpoint {
    pub fn bind(address: SocketAddr) -> Result<Self, ServerError> {
        let socket =
            UdpSocket::bind(address).map_err(|source| ServerError::Bind { address, source })?;
        Ok(Self {
            socket,
            buffer: vec![0_u8; MAX_DATAGRAM_SIZE_BYTES],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<(), ServerError> {
        registry
            .register(&mut self.socket, token, Interest::READABLE)
            .map_err(|source| ServerError::Register { source })
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    pub fn try_recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        match self.socket.recv_from(&mut self.buffer) {
            Ok((len, peer)) => Ok(Some((self.buffer[..len].to_vec(), peer))),
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(source),
        }
    }

    pub fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, peer)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
pub enum ConnectionError {
    Io(io::Error),
    Codec(CodecError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "connection I/O failed: {source}"),
            Self::Codec(source) => write!(f, "connection framing failed: {source}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Frames completed by one read pass. A failure part way through still
/// returns every frame decoded before it.
#[derive(Debug, Default)]
pub struct FrameBatch {
    pub frames: Vec<Vec<u8>>,
    pub error: Option<ConnectionError>,
}

/// Buffered, non-blocking TCP connection carrying length-prefixed frames.
///
/// Registered for both directions; with edge-triggered readiness every read
/// and flush runs until the socket reports `WouldBlock`.
pub struct ClientConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: ConnectionState,
    inbound: FrameAccumulator,
    outbound: Vec<u8>,
    max_pending_output: usize,
    peer_node_id: Option<u64>,
}

impl ClientConnection {
    pub fn accepted(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        Ok(Self::with_state(stream, peer_addr, ConnectionState::Open))
    }

    /// Starts a non-blocking outbound connection.
    pub fn connect(address: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        Ok(Self::with_state(stream, address, ConnectionState::Connecting))
    }

    fn with_state(stream: TcpStream, peer_addr: SocketAddr, state: ConnectionState) -> Self {
        Self {
            stream,
            peer_addr,
            state,
            inbound: FrameAccumulator::new(),
            outbound: Vec::new(),
            max_pending_output: DEFAULT_MAX_PENDING_OUTPUT_BYTES,
            peer_node_id: None,
        }
    }

    pub fn with_max_pending_output(mut self, bytes: usize) -> Self {
        self.max_pending_output = bytes;
        self
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<(), ServerError> {
        registry
            .register(&mut self.stream, token, interest())
            .map_err(|source| ServerError::Register { source })
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn peer_node_id(&self) -> Option<u64> {
        self.peer_node_id
    }

    pub fn set_peer_node_id(&mut self, node_id: u64) {
        self.peer_node_id = Some(node_id);
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Resolves a pending outbound connect after a writable/error event.
    /// Returns true once the connection is open.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if self.state != ConnectionState::Connecting {
            return Ok(self.state == ConnectionState::Open);
        }
        if let Some(error) = self.stream.take_error()? {
            self.state = ConnectionState::Closed;
            return Err(error);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.state = ConnectionState::Open;
                // Best effort; latency only.
                let _ = self.stream.set_nodelay(true);
                Ok(true)
            }
            Err(error)
                if error.kind() == io::ErrorKind::NotConnected
                    || error.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(error) => {
                self.state = ConnectionState::Closed;
                Err(error)
            }
        }
    }

    /// Reads everything currently available and splits it into frames.
    /// A clean EOF marks the connection closed, as does any error.
    pub fn read_frames(&mut self, codec: &WireCodec) -> FrameBatch {
        let mut batch = FrameBatch::default();
        let mut chunk = [0_u8; READ_CHUNK_SIZE_BYTES];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.state = ConnectionState::Closed;
                    break;
                }
                Ok(len) => self.inbound.extend(&chunk[..len]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.state = ConnectionState::Closed;
                    batch.error = Some(ConnectionError::Io(error));
                    break;
                }
            }
        }

        loop {
            match self.inbound.next_frame(codec) {
                Ok(Some(frame)) => batch.frames.push(frame),
                Ok(None) => break,
                Err(error) => {
                    self.state = ConnectionState::Closed;
                    batch.error.get_or_insert(ConnectionError::Codec(error));
                    break;
                }
            }
        }
        batch
    }

    /// Queues a frame and writes as much as the socket takes right now.
    pub fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            ));
        }
        self.outbound.extend_from_slice(frame);
        self.flush()?;

        if self.pending_output() > self.max_pending_output {
            self.state = ConnectionState::Closed;
            return Err(io::Error::other(format!(
                "peer left {} bytes unread, limit is {}",
                self.pending_output(),
                self.max_pending_output
            )));
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.state = ConnectionState::Closed;
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.state = ConnectionState::Closed;
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Closed;
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream as StdTcpStream, UdpSocket as StdUdpSocket};
    use std::thread;
    use std::time::Duration;

    use mio::{Events, Poll, Token};

    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::WireEnvelope;

    use super::{ClientConnection, ConnectionError, ConnectionState, TcpAcceptor, UdpEndpoint};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback address")
    }

    fn accept_one(acceptor: &TcpAcceptor) -> ClientConnection {
        for _ in 0..100 {
            if let Some((stream, peer)) = acceptor.try_accept().expect("accept should not fail") {
                return ClientConnection::accepted(stream, peer).expect("configure stream");
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no connection accepted");
    }

    #[test]
    fn acceptor_reports_empty_backlog_as_none() {
        let acceptor = TcpAcceptor::bind(loopback()).expect("acceptor should bind");
        assert!(acceptor.try_accept().expect("accept poll").is_none());
    }

    #[test]
    fn accepted_connection_reads_complete_frames() {
        let codec = WireCodec::default();
        let acceptor = TcpAcceptor::bind(loopback()).expect("acceptor should bind");
        let mut client =
            StdTcpStream::connect(acceptor.local_addr().expect("local addr")).expect("connect");
        let mut connection = accept_one(&acceptor);

        let frame = WireEnvelope::request("1", r#"{"action":"list"}"#)
            .encode(&codec)
            .expect("encode request");
        client.write_all(&frame[..3]).expect("write head");

        let mut frames = Vec::new();
        for attempt in 0..100 {
            if attempt == 10 {
                client.write_all(&frame[3..]).expect("write tail");
            }
            let batch = connection.read_frames(&codec);
            assert!(batch.error.is_none(), "unexpected read error: {:?}", batch.error);
            frames.extend(batch.frames);
            if !frames.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(frames, vec![frame]);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn frames_before_a_bad_header_are_still_returned() {
        let codec = WireCodec::default();
        let acceptor = TcpAcceptor::bind(loopback()).expect("acceptor should bind");
        let mut client =
            StdTcpStream::connect(acceptor.local_addr().expect("local addr")).expect("connect");
        let mut connection = accept_one(&acceptor);

        let frame = WireEnvelope::request("1", r#"{"action":"list"}"#)
            .encode(&codec)
            .expect("encode request");
        let mut bytes = frame.clone();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        client.write_all(&bytes).expect("write");

        let mut frames = Vec::new();
        let mut error = None;
        for _ in 0..100 {
            let batch = connection.read_frames(&codec);
            frames.extend(batch.frames);
            if batch.error.is_some() {
                error = batch.error;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(frames, vec![frame]);
        assert!(matches!(error, Some(ConnectionError::Codec(_))));
        assert!(connection.is_closed());
    }

    #[test]
    fn unread_output_over_the_cap_closes_the_connection() {
        let acceptor = TcpAcceptor::bind(loopback()).expect("acceptor should bind");
        // Never reads.
        let _client =
            StdTcpStream::connect(acceptor.local_addr().expect("local addr")).expect("connect");
        let mut connection = accept_one(&acceptor).with_max_pending_output(64 * 1024);

        let chunk = vec![0_u8; 64 * 1024];
        let mut failed = false;
        for _ in 0..2_048 {
            if connection.send_frame(&chunk).is_err() {
                failed = true;
                break;
            }
        }

        assert!(failed, "sending into a stalled peer should hit the cap");
        assert!(connection.is_closed());
        assert!(connection.send_frame(b"more").is_err());
    }

    #[test]
    fn peer_close_marks_connection_closed() {
        let codec = WireCodec::default();
        let acceptor = TcpAcceptor::bind(loopback()).expect("acceptor should bind");
        let client =
            StdTcpStream::connect(acceptor.local_addr().expect("local addr")).expect("connect");
        let mut connection = accept_one(&acceptor);
        drop(client);

        for _ in 0..100 {
            let _ = connection.read_frames(&codec);
            if connection.is_closed() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(connection.is_closed());
        assert!(connection.send_frame(b"late").is_err());
    }

    #[test]
    fn outbound_connect_completes_and_flushes_queued_frames() {
        let listener = std::net::TcpListener::bind(loopback()).expect("listener should bind");
        let target = listener.local_addr().expect("listener addr");

        let mut poll = Poll::new().expect("poll");
        let mut events = Events::with_capacity(8);
        let mut connection = ClientConnection::connect(target).expect("connect should start");
        connection
            .register(poll.registry(), Token(7))
            .expect("register");
        connection.send_frame(b"hello").expect("queue while connecting");

        for _ in 0..100 {
            poll.poll(&mut events, Some(Duration::from_millis(20)))
                .expect("poll");
            if connection.finish_connect().expect("connect should succeed") {
                break;
            }
        }
        assert_eq!(connection.state(), ConnectionState::Open);
        connection.flush().expect("flush");

        let (mut accepted, _) = listener.accept().expect("accept");
        let mut buf = [0_u8; 5];
        accepted.read_exact(&mut buf).expect("read queued bytes");
        assert_eq!(&buf, b"hello");
        assert_eq!(connection.pending_output(), 0);
    }

    #[test]
    fn udp_endpoint_receives_and_replies() {
        let mut endpoint = UdpEndpoint::bind(loopback()).expect("udp should bind");
        let server_addr = endpoint.local_addr().expect("udp addr");
        let client = StdUdpSocket::bind(loopback()).expect("client udp");
        client.send_to(b"ping", server_addr).expect("send");

        let mut received = None;
        for _ in 0..100 {
            if let Some(datagram) = endpoint.try_recv().expect("recv") {
                received = Some(datagram);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let (payload, peer) = received.expect("datagram should arrive");
        assert_eq!(payload, b"ping");

        endpoint.send_to(b"pong", peer).expect("reply");
        let mut buf = [0_u8; 8];
        let (len, _) = client.recv_from(&mut buf).expect("client recv");
        assert_eq!(&buf[..len], b"pong");
    }
}
