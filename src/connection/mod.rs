//! The connection state machine.
//!
//! A [`Connection`] owns one socket (a connecting or connected stream, or a
//! listener), an optional TLS session on top of it, and the framing buffers.
//! All operations are non-blocking unless the connection was configured for
//! blocking mode: anything that cannot finish reports the direction it waits
//! on, and the caller repeats the call once its poll loop says the
//! connection is ready in that direction.
//!
//! # Client path
//!
//! ```text
//! Unbound --connect()--> Connecting --resume_connect()...--> DataTransfer
//! ```
//!
//! # Server path
//!
//! ```text
//! Unbound --bind(Server)--> Idle --listen()--> IncomingConnection
//!                            ^                        |
//!                            +-------- accept() ------+--> child: Accepting
//!                                                             |
//!                                          child.accept()...  v
//!                                                        DataTransfer
//! ```
//!
//! `close()` is valid from every state and moves to [`State::Closed`].

mod client;
mod server;

use crate::complete;
use crate::config::Options;
use crate::error::{Error, ErrorKind};
use crate::framing::{Completion, Frame, FrameBuffer, Progress};
use crate::resolver::{string_to_address, HostSpec, PendingResolution};
use crate::transport::{
    set_nonblocking, CredentialSet, Link, PlainLink, TlsLink, TransportKind, Want,
};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use rustls::ClientConfig;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

// ============================================================================
// Public vocabulary
// ============================================================================

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No socket yet; `connect()` and `bind()` are valid.
    Unbound,
    /// A bound listener waiting for `listen()`, or a supplied stream.
    Idle,
    /// A client connect (TCP, tunnel, TLS handshake) is in progress.
    Connecting,
    /// A listener holds an accepted socket that `accept()` will hand out.
    IncomingConnection,
    /// An accepted connection whose handshake is in progress.
    Accepting,
    /// Messages can be exchanged.
    DataTransfer,
    Closed,
}

/// The last thing that happened on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    #[default]
    None,
    Connect,
    Data,
    Listen,
}

/// Protocol carried by a connection. It only affects the default port and the
/// scheme shown by [`Connection::address_to_string`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Z3950,
    Sr,
    Http,
}

impl Protocol {
    pub fn default_port(self, transport: TransportKind) -> u16 {
        match (self, transport) {
            (Protocol::Http, TransportKind::Tcp) => 80,
            (Protocol::Http, TransportKind::Tls) => 443,
            (Protocol::Z3950 | Protocol::Sr, _) => 210,
        }
    }
}

/// Role of a bound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Use the address as the local end of a later `connect()`.
    Client,
    /// Listen for incoming connections.
    Server,
}

/// Result of [`Connection::resolve_address`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Vec<SocketAddr>),
    /// A background lookup is running. The connection is readable once it
    /// has finished.
    Pending,
}

/// Result of [`Connection::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listen {
    /// A peer was accepted; call [`Connection::accept`] to take it over.
    Incoming(SocketAddr),
    /// Nothing to accept yet. Wait for the listener to become readable.
    NoDataYet,
}

/// Result of [`Connection::accept`].
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Accept {
    /// Returned on the listener: the new connection, in [`State::Accepting`].
    Incoming(Connection),
    /// Returned on an accepted connection: it is now in
    /// [`State::DataTransfer`].
    Done,
    /// Returned on an accepted connection: the handshake waits on the given
    /// direction.
    InProgress(Want),
}

/// Snapshot for an external poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub event: Event,
    pub want: Want,
    pub error: Option<ErrorKind>,
}

// Steps of a client connect after resolution, in order.
#[derive(Debug)]
enum ConnectPhase {
    TcpConnect,
    TunnelRequest(Vec<u8>),
    TunnelResponse,
    Handshake,
}

// ============================================================================
// Connection
// ============================================================================

/// A framed, optionally encrypted, client or server connection.
///
/// Operations that fail record the [`ErrorKind`] in the connection's error
/// slot (see [`look()`](Self::look)); the connection should then be closed.
/// The slot is informational: operations are not refused because of it.
///
/// `Connection` implements [`mio::event::Source`]. Register it with the
/// caller's `Poll` using the interest from [`Status::want`]. The underlying
/// descriptor changes while connecting (resolver notification, then one
/// socket per candidate address); `reregister` follows the change.
pub struct Connection {
    options: Options,
    protocol: Protocol,
    transport: TransportKind,
    state: State,
    event: Event,
    want: Want,
    error: Option<ErrorKind>,

    link: Option<Box<dyn Link>>,
    listener: Option<TcpListener>,
    incoming: Option<(TcpStream, SocketAddr)>,
    framing: FrameBuffer,
    completion: Completion,

    target: Option<HostSpec>,
    resolving_for: Option<String>,
    resolved: Option<Vec<SocketAddr>>,
    pending: Option<PendingResolution>,
    candidates: VecDeque<SocketAddr>,
    phase: Option<ConnectPhase>,
    local_hint: Option<SocketAddr>,

    tls_client: Option<Arc<ClientConfig>>,
    credentials: Option<CredentialSet>,

    peer: Option<SocketAddr>,
    registered: bool,
}

impl Connection {
    /// Creates an unbound connection.
    pub fn new(options: Options, protocol: Protocol) -> Self {
        let completion: Completion = match protocol {
            Protocol::Http => Arc::new(complete::http),
            Protocol::Z3950 | Protocol::Sr => Arc::new(complete::raw),
        };
        Self {
            transport: options.transport,
            options,
            protocol,
            state: State::Unbound,
            event: Event::None,
            want: Want::None,
            error: None,
            link: None,
            listener: None,
            incoming: None,
            framing: FrameBuffer::default(),
            completion,
            target: None,
            resolving_for: None,
            resolved: None,
            pending: None,
            candidates: VecDeque::new(),
            phase: None,
            local_hint: None,
            tls_client: None,
            credentials: None,
            peer: None,
            registered: false,
        }
    }

    /// Creates a connection, optionally around an already connected stream.
    ///
    /// A supplied stream starts in [`State::Idle`]. With the TCP transport it
    /// is ready for `get`/`put`; with the TLS transport the caller first picks
    /// a side with [`start_tls()`](Self::start_tls).
    #[instrument(skip(socket, options))]
    pub fn create(
        socket: Option<std::net::TcpStream>,
        options: Options,
        protocol: Protocol,
    ) -> Result<Self, Error> {
        let mut conn = Self::new(options, protocol);
        let Some(stream) = socket else {
            return Ok(conn);
        };

        stream.set_nonblocking(!conn.options.blocking)?;
        conn.peer = stream.peer_addr().ok();
        let stream = TcpStream::from_std(stream);

        conn.link = Some(Box::new(PlainLink::new(stream)));
        conn.state = State::Idle;
        debug!(peer = ?conn.peer, transport = ?conn.transport, "Created connection from socket");
        Ok(conn)
    }

    /// Starts a TLS session on a stream supplied to [`create()`](Self::create).
    ///
    /// [`BindMode::Server`] takes the server side with the configured
    /// credential set; continue with [`accept()`](Self::accept).
    /// [`BindMode::Client`] verifies the peer as `connect()` would, naming it
    /// by `tls_server_name` or else its address; continue with
    /// [`resume_connect()`](Self::resume_connect).
    #[instrument(skip(self))]
    pub fn start_tls(&mut self, role: BindMode) -> Result<Progress, Error> {
        let result = self.upgrade(role);
        self.track(result)
    }

    fn upgrade(&mut self, role: BindMode) -> Result<Progress, Error> {
        match (self.state, &self.link) {
            (State::Idle, Some(link)) if link.kind() == TransportKind::Tcp => {}
            (state, _) => return Err(Error::OutOfState { op: "start_tls", state }),
        }
        self.transport = TransportKind::Tls;

        match role {
            BindMode::Server => {
                let credentials = self.server_credentials()?;
                let Some(link) = self.link.take() else {
                    return Err(Error::OutOfState {
                        op: "start_tls",
                        state: self.state,
                    });
                };
                self.link = Some(Box::new(TlsLink::server(link.into_stream(), &credentials)?));
                self.credentials = Some(credentials);
                self.state = State::Accepting;
                match self.drive_accept()? {
                    Accept::InProgress(want) => Ok(Progress::InProgress(want)),
                    Accept::Done | Accept::Incoming(_) => Ok(Progress::Done),
                }
            }
            BindMode::Client => {
                self.wrap_tls_client()?;
                self.state = State::Connecting;
                self.drive_connect()
            }
        }
    }

    /// Replaces the completion predicate used by [`get()`](Self::get).
    ///
    /// The default is [`complete::http`] for [`Protocol::Http`] and
    /// [`complete::raw`] otherwise.
    pub fn set_completion<F>(&mut self, complete: F)
    where
        F: Fn(&[u8]) -> usize + Send + Sync + 'static,
    {
        self.completion = Arc::new(complete);
    }

    /// Uses a pre-built client configuration instead of loading `tls_ca_cert`.
    pub fn set_tls_client_config(&mut self, config: Arc<ClientConfig>) {
        self.tls_client = Some(config);
    }

    /// Uses an existing credential set instead of loading `tls_server_cert`
    /// and `tls_server_key` at `bind()`.
    pub fn set_credentials(&mut self, credentials: CredentialSet) {
        self.credentials = Some(credentials);
    }

    // ========================================================================
    // Data transfer
    // ========================================================================

    /// Reads until the completion predicate reports a whole message.
    ///
    /// On [`Frame::Message`] the bytes are available through
    /// [`message()`](Self::message) until the next call.
    #[instrument(skip(self))]
    pub fn get(&mut self) -> Result<Frame, Error> {
        let result = self.get_frame();
        match result {
            Ok(frame) => {
                self.event = Event::Data;
                self.want = match frame {
                    Frame::Incomplete(want) => want,
                    Frame::Message(_) | Frame::Closed => Want::None,
                };
                Ok(frame)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn get_frame(&mut self) -> Result<Frame, Error> {
        self.check_transfer("get")?;
        let link = active_link(&mut self.link, "get", self.state)?;
        self.framing
            .get(link, &*self.completion, self.options.max_message_bytes)
    }

    /// The message returned by the last successful [`get()`](Self::get).
    pub fn message(&self) -> &[u8] {
        self.framing.message()
    }

    /// Whether the next [`get()`](Self::get) can be served from bytes already
    /// received.
    pub fn more(&self) -> bool {
        self.framing.more(&*self.completion)
    }

    /// Writes `data`. On [`Progress::InProgress`] call again with the same
    /// buffer once the connection is ready in the reported direction.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn put(&mut self, data: &[u8]) -> Result<Progress, Error> {
        let result = self.put_frame(data);
        self.track(result)
    }

    fn put_frame(&mut self, data: &[u8]) -> Result<Progress, Error> {
        self.check_transfer("put")?;
        let link = active_link(&mut self.link, "put", self.state)?;
        self.framing.put(link, data)
    }

    fn check_transfer(&self, op: &'static str) -> Result<(), Error> {
        match self.state {
            State::DataTransfer => Ok(()),
            // A supplied stream meant for TLS waits for `start_tls()`.
            State::Idle if self.link.as_ref().is_some_and(|link| link.kind() == self.transport) => {
                Ok(())
            }
            state => Err(Error::OutOfState { op, state }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Releases everything the connection holds. Valid from every state and
    /// also run on drop.
    ///
    /// An outstanding background resolution is waited for, not abandoned.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.pending = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.listener = None;
        self.incoming = None;
        self.credentials = None;
        self.framing.reset();
        self.candidates.clear();
        self.phase = None;
        self.want = Want::None;
        self.registered = false;
        self.state = State::Closed;
        info!(peer = ?self.peer, "Connection closed");
    }

    /// Switches between blocking and non-blocking I/O.
    #[instrument(skip(self))]
    pub fn set_blocking(&mut self, blocking: bool) -> Result<(), Error> {
        if self.options.blocking == blocking {
            return Ok(());
        }
        let result = self.apply_blocking(blocking);
        result.map_err(|err| self.fail(err))
    }

    fn apply_blocking(&mut self, blocking: bool) -> Result<(), Error> {
        if let Some(link) = &self.link {
            set_nonblocking(link.stream(), !blocking)?;
        }
        if let Some(listener) = &self.listener {
            set_nonblocking(listener, !blocking)?;
        }
        self.options.blocking = blocking;
        debug!(blocking, "Changed blocking mode");
        Ok(())
    }

    /// Records that the caller's poll loop gave up waiting on this
    /// connection, and returns the error to report.
    pub fn timeout(&mut self) -> Error {
        self.fail(Error::Timeout)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn look(&self) -> Status {
        Status {
            state: self.state,
            event: self.event,
            want: self.want,
            error: self.error,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn want(&self) -> Want {
        self.want
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn is_blocking(&self) -> bool {
        self.options.blocking
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Local address of the stream or listener.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        if let Some(link) = &self.link {
            return Ok(link.stream().local_addr()?);
        }
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        Err(Error::OutOfState {
            op: "local_addr",
            state: self.state,
        })
    }

    /// DER encoding of the peer's end-entity certificate, once a TLS
    /// handshake has presented one.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.link.as_ref().and_then(|link| link.peer_certificate())
    }

    /// The peer formatted as `"<scheme>:<host>"`.
    pub fn peer_address(&self) -> Option<String> {
        self.peer.map(|addr| self.address_to_string(&addr))
    }

    /// Formats `addr` as `"<scheme>:<host>"`.
    ///
    /// The scheme is `tcp` or `ssl`, or `http`/`https` for
    /// [`Protocol::Http`]. The host is numeric unless `numeric_host` is off,
    /// in which case a reverse lookup is tried first.
    pub fn address_to_string(&self, addr: &SocketAddr) -> String {
        let scheme = match (self.protocol, self.transport) {
            (Protocol::Http, TransportKind::Tcp) => "http",
            (Protocol::Http, TransportKind::Tls) => "https",
            (_, TransportKind::Tcp) => "tcp",
            (_, TransportKind::Tls) => "ssl",
        };
        let host = if self.options.numeric_host {
            addr.ip().to_string()
        } else {
            dns_lookup::lookup_addr(&addr.ip()).unwrap_or_else(|err| {
                debug!(%addr, ?err, "Reverse lookup failed");
                addr.ip().to_string()
            })
        };
        format!("{scheme}:{host}")
    }

    /// Parses a host specification with this connection's default port.
    pub fn string_to_address(&self, spec: &str) -> Result<HostSpec, Error> {
        string_to_address(spec, self.default_port())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn default_port(&self) -> u16 {
        self.options
            .default_port
            .unwrap_or_else(|| self.protocol.default_port(self.transport))
    }

    // Parses `spec`, letting a scheme prefix pick the transport.
    fn parse_spec(&mut self, spec: &str) -> Result<HostSpec, Error> {
        let target = self.string_to_address(spec)?;
        if let Some(kind) = target.transport {
            self.transport = kind;
        }
        Ok(target)
    }

    fn server_credentials(&self) -> Result<CredentialSet, Error> {
        if let Some(credentials) = &self.credentials {
            return Ok(credentials.clone());
        }
        match (&self.options.tls_server_cert, &self.options.tls_server_key) {
            (Some(cert), Some(key)) => CredentialSet::load(cert, key),
            _ => Err(Error::TlsServerConfigMissing),
        }
    }

    // Stores the want-direction of a multi-step operation and records errors.
    fn track(&mut self, result: Result<Progress, Error>) -> Result<Progress, Error> {
        match result {
            Ok(progress) => {
                self.want = match progress {
                    Progress::Done => Want::None,
                    Progress::InProgress(want) => want,
                };
                Ok(progress)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        error!(state = ?self.state, %err, "Connection operation failed");
        self.error = Some(err.kind());
        self.want = Want::None;
        err
    }

    fn source_mut(&mut self) -> io::Result<&mut dyn Source> {
        match (&mut self.pending, &mut self.link, &mut self.listener) {
            (Some(pending), _, _) => Ok(pending as &mut dyn Source),
            (None, Some(link), _) => Ok(link.stream_mut() as &mut dyn Source),
            (None, None, Some(listener)) => Ok(listener as &mut dyn Source),
            (None, None, None) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection has no socket to poll",
            )),
        }
    }
}

fn active_link<'a>(
    link: &'a mut Option<Box<dyn Link>>,
    op: &'static str,
    state: State,
) -> Result<&'a mut dyn Link, Error> {
    match link {
        Some(link) => Ok(link.as_mut()),
        None => Err(Error::OutOfState { op, state }),
    }
}

impl Source for Connection {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.source_mut()?.register(registry, token, interests)?;
        self.registered = true;
        Ok(())
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        // The descriptor was replaced since the last registration.
        if !self.registered {
            return self.register(registry, token, interests);
        }
        self.source_mut()?.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let result = self.source_mut()?.deregister(registry);
        self.registered = false;
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("protocol", &self.protocol)
            .field("transport", &self.transport)
            .field("want", &self.want)
            .field("error", &self.error)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
