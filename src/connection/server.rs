//! Server side: bind, listen and accept.

use super::{Accept, BindMode, Connection, Event, Listen, State};
use crate::error::Error;
use crate::transport::{
    bind_listener, set_nonblocking, IoStatus, Link, PlainLink, TlsLink, TransportKind, Want,
};

use std::io::ErrorKind;
use std::net::SocketAddr;
use tracing::{debug, info, instrument, warn};

impl Connection {
    /// Binds to `spec`.
    ///
    /// In [`BindMode::Server`] the socket becomes a listener and the
    /// connection moves to [`State::Idle`]; a TLS listener loads its
    /// credential set here. In [`BindMode::Client`] the address is kept as the
    /// local end of the next `connect()`.
    #[instrument(skip(self))]
    pub fn bind(&mut self, spec: &str, mode: BindMode) -> Result<(), Error> {
        let result = self.bind_to(spec, mode);
        result.map_err(|err| self.fail(err))
    }

    fn bind_to(&mut self, spec: &str, mode: BindMode) -> Result<(), Error> {
        match self.state {
            State::Unbound => {}
            State::Idle if self.link.is_none() && self.listener.is_none() => {}
            state => return Err(Error::OutOfState { op: "bind", state }),
        }

        let target = self.parse_spec(spec)?;
        let addrs = target.resolve()?;
        let Some(&addr) = addrs.first() else {
            return Err(Error::InvalidAddress(spec.to_string()));
        };

        match mode {
            BindMode::Client => {
                debug!(%addr, "Recorded local address for connect");
                self.local_hint = Some(addr);
            }
            BindMode::Server => {
                if self.transport == TransportKind::Tls {
                    self.credentials = Some(self.server_credentials()?);
                }
                let listener = bind_listener(addr, target.ipv6_only, self.options.blocking)?;
                info!(addr = %listener.local_addr()?, transport = ?self.transport, "Listening");
                self.listener = Some(listener);
                self.registered = false;
                self.state = State::Idle;
                self.event = Event::None;
            }
        }
        Ok(())
    }

    /// Accepts a pending peer on a bound listener.
    ///
    /// Would-block is reported as [`Listen::NoDataYet`]. On
    /// [`Listen::Incoming`] the listener is in
    /// [`State::IncomingConnection`] and [`accept()`](Self::accept) hands the
    /// peer out as a new connection.
    #[instrument(skip(self))]
    pub fn listen(&mut self) -> Result<Listen, Error> {
        self.listen_filtered(|_| true)
    }

    /// Like [`listen()`](Self::listen), but asks `filter` about each peer
    /// first.
    ///
    /// A rejected peer's socket is closed at once and the call fails with
    /// [`Error::DeniedByFilter`]. The listener itself stays usable, so the
    /// denial is not recorded in its error slot.
    #[instrument(skip(self, filter))]
    pub fn listen_filtered<F>(&mut self, mut filter: F) -> Result<Listen, Error>
    where
        F: FnMut(&SocketAddr) -> bool,
    {
        match self.accept_peer(&mut filter) {
            Err(err @ Error::DeniedByFilter { .. }) => Err(err),
            Err(err) => Err(self.fail(err)),
            Ok(listen) => Ok(listen),
        }
    }

    fn accept_peer(&mut self, filter: &mut dyn FnMut(&SocketAddr) -> bool) -> Result<Listen, Error> {
        let listener = match (self.state, &self.listener) {
            (State::Idle, Some(listener)) => listener,
            (state, _) => return Err(Error::OutOfState { op: "listen", state }),
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !filter(&peer) {
                        drop(stream);
                        warn!(%peer, "Peer rejected by accept filter");
                        return Err(Error::DeniedByFilter { peer });
                    }
                    info!(%peer, "Accepted connection");
                    self.incoming = Some((stream, peer));
                    self.state = State::IncomingConnection;
                    self.event = Event::Listen;
                    self.want = Want::None;
                    return Ok(Listen::Incoming(peer));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.want = Want::Read;
                    return Ok(Listen::NoDataYet);
                }
                // The peer gave up before we got to it.
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::Interrupted
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(?err, "Retrying accept");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// On a listener in [`State::IncomingConnection`]: returns the accepted
    /// peer as a new connection in [`State::Accepting`] and puts the listener
    /// back to [`State::Idle`].
    ///
    /// On an accepted connection: drives its handshake. Call until
    /// [`Accept::Done`].
    #[instrument(skip(self))]
    pub fn accept(&mut self) -> Result<Accept, Error> {
        let result = match self.state {
            State::IncomingConnection => self.hand_out().map(Accept::Incoming),
            State::Accepting => self.drive_accept(),
            state => Err(Error::OutOfState { op: "accept", state }),
        };
        result.map_err(|err| self.fail(err))
    }

    fn hand_out(&mut self) -> Result<Connection, Error> {
        let Some((stream, peer)) = self.incoming.take() else {
            return Err(Error::OutOfState {
                op: "accept",
                state: self.state,
            });
        };
        self.state = State::Idle;
        self.event = Event::None;

        if self.options.blocking {
            set_nonblocking(&stream, false)?;
        }
        stream.set_nodelay(true)?;

        let mut child = Connection::new(self.options.clone(), self.protocol);
        child.transport = self.transport;
        child.completion = self.completion.clone();
        child.peer = Some(peer);

        let link: Box<dyn Link> = match self.transport {
            TransportKind::Tcp => {
                child.want = Want::None;
                Box::new(PlainLink::new(stream))
            }
            TransportKind::Tls => {
                let credentials = self.server_credentials()?;
                let link = TlsLink::server(stream, &credentials)?;
                child.credentials = Some(credentials);
                child.want = Want::Read;
                Box::new(link)
            }
        };
        child.link = Some(link);
        child.state = State::Accepting;
        child.event = Event::Connect;
        debug!(%peer, "Handed out accepted connection");
        Ok(child)
    }

    pub(super) fn drive_accept(&mut self) -> Result<Accept, Error> {
        let Some(link) = self.link.as_deref_mut() else {
            return Err(Error::OutOfState {
                op: "accept",
                state: self.state,
            });
        };
        match link.handshake()? {
            IoStatus::Ready(_) => {
                self.state = State::DataTransfer;
                self.event = Event::Connect;
                self.want = Want::None;
                info!(peer = ?self.peer, transport = ?self.transport, "Connection established");
                Ok(Accept::Done)
            }
            IoStatus::Blocked(want) => {
                self.want = want;
                Ok(Accept::InProgress(want))
            }
        }
    }
}
