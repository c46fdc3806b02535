//! Client side: resolution, connect and the post-connect handshake chain.

use super::{active_link, ConnectPhase, Connection, Event, Resolution, State};
use crate::complete;
use crate::error::Error;
use crate::framing::{Frame, Progress};
use crate::resolver::{string_to_address, HostSpec, PendingResolution};
use crate::transport::tunnel::{check_response, connect_request};
use crate::transport::{
    connect_status, connect_stream, load_tls_client_config, IoStatus, PlainLink, TlsLink,
    TransportKind, Want,
};

use std::io;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

impl Connection {
    /// Resolves the address `connect(spec)` would dial: the configured proxy
    /// if there is one, `spec` otherwise.
    ///
    /// In non-blocking mode with `dns_no_block`, host names are looked up on a
    /// background thread and this returns [`Resolution::Pending`] until the
    /// lookup has finished; the connection then polls readable. Calling again
    /// for the same `spec` harvests or returns the result.
    #[instrument(skip(self))]
    pub fn resolve_address(&mut self, spec: &str) -> Result<Resolution, Error> {
        let result = self.resolve(spec);
        result.map_err(|err| self.fail(err))
    }

    pub(super) fn resolve(&mut self, spec: &str) -> Result<Resolution, Error> {
        if self.resolving_for.as_deref() != Some(spec) {
            self.pending = None;
            self.resolved = None;
            self.target = Some(self.parse_spec(spec)?);
            self.resolving_for = Some(spec.to_string());
        }

        if let Some(addrs) = &self.resolved {
            return Ok(Resolution::Resolved(addrs.clone()));
        }

        if let Some(pending) = self.pending.as_mut() {
            let polled = pending.poll();
            return match polled {
                Ok(Some(addrs)) => {
                    self.pending = None;
                    self.registered = false;
                    debug!(count = addrs.len(), "Background resolution finished");
                    self.resolved = Some(addrs.clone());
                    Ok(Resolution::Resolved(addrs))
                }
                Ok(None) => {
                    self.want = Want::Read;
                    Ok(Resolution::Pending)
                }
                Err(err) => {
                    self.pending = None;
                    self.registered = false;
                    Err(err)
                }
            };
        }

        let dial = self.dial_spec()?;
        if !self.options.blocking && self.options.dns_no_block && !dial.is_literal() {
            self.pending = Some(PendingResolution::spawn(dial)?);
            self.registered = false;
            self.want = Want::Read;
            return Ok(Resolution::Pending);
        }

        let addrs = dial.resolve()?;
        self.resolved = Some(addrs.clone());
        Ok(Resolution::Resolved(addrs))
    }

    fn dial_spec(&self) -> Result<HostSpec, Error> {
        match (&self.options.proxy, &self.target) {
            (Some(proxy), _) => string_to_address(proxy, self.default_port()),
            (None, Some(target)) => Ok(target.clone()),
            (None, None) => Err(Error::InvalidAddress(String::new())),
        }
    }

    /// Starts connecting to `spec`. Valid only from [`State::Unbound`].
    ///
    /// Whatever can be done without waiting is done in this call, up to and
    /// including the TLS handshake. [`Progress::InProgress`] means the caller
    /// continues with [`resume_connect()`](Self::resume_connect) once the
    /// connection is ready in the reported direction.
    #[instrument(skip(self))]
    pub fn connect(&mut self, spec: &str) -> Result<Progress, Error> {
        let result = self.start(spec);
        self.track(result)
    }

    fn start(&mut self, spec: &str) -> Result<Progress, Error> {
        if self.state != State::Unbound {
            return Err(Error::OutOfState {
                op: "connect",
                state: self.state,
            });
        }
        self.event = Event::Connect;
        match self.resolve(spec)? {
            Resolution::Pending => Ok(Progress::InProgress(Want::Read)),
            Resolution::Resolved(addrs) => {
                self.candidates = addrs.into();
                self.try_candidates()
            }
        }
    }

    /// Continues a connect that reported [`Progress::InProgress`].
    #[instrument(skip(self))]
    pub fn resume_connect(&mut self) -> Result<Progress, Error> {
        let result = self.resume();
        self.track(result)
    }

    fn resume(&mut self) -> Result<Progress, Error> {
        let awaiting_resolution = match (&self.pending, &self.resolving_for) {
            (Some(_), Some(spec)) => Some(spec.clone()),
            _ => None,
        };
        match (self.state, awaiting_resolution) {
            (State::Connecting, _) => self.drive_connect(),
            (State::Unbound, Some(spec)) => self.start(&spec),
            (state, _) => Err(Error::OutOfState {
                op: "resume_connect",
                state,
            }),
        }
    }

    // Opens a socket to the next candidate. Failures other than refusal move
    // on to the next candidate while there is one.
    fn try_candidates(&mut self) -> Result<Progress, Error> {
        loop {
            let Some(addr) = self.candidates.pop_front() else {
                return Err(Error::InvalidAddress(
                    self.resolving_for.clone().unwrap_or_default(),
                ));
            };
            self.link = None;
            self.registered = false;

            match connect_stream(addr, self.local_hint, self.options.blocking) {
                Ok((stream, connected)) => {
                    info!(%addr, connected, "Connecting to peer");
                    self.link = Some(Box::new(PlainLink::new(stream)));
                    self.peer = Some(addr);
                    self.state = State::Connecting;
                    self.phase = Some(ConnectPhase::TcpConnect);
                    if !connected {
                        return Ok(Progress::InProgress(Want::Write));
                    }
                    return self.drive_connect();
                }
                Err(err) if self.next_candidate_after(&err) => {
                    warn!(%addr, ?err, "Connect failed, trying next address");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn next_candidate_after(&self, err: &io::Error) -> bool {
        err.kind() != io::ErrorKind::ConnectionRefused && !self.candidates.is_empty()
    }

    // Runs the connect phases until one has to wait.
    pub(super) fn drive_connect(&mut self) -> Result<Progress, Error> {
        loop {
            let Some(phase) = self.phase.take() else {
                self.state = State::DataTransfer;
                self.event = Event::Connect;
                info!(peer = ?self.peer, transport = ?self.transport, "Connected");
                return Ok(Progress::Done);
            };

            match phase {
                ConnectPhase::TcpConnect => {
                    let link = active_link(&mut self.link, "resume_connect", self.state)?;
                    match connect_status(link.stream()) {
                        Ok(true) => self.after_tcp_connect()?,
                        Ok(false) => {
                            self.phase = Some(ConnectPhase::TcpConnect);
                            return Ok(Progress::InProgress(Want::Write));
                        }
                        Err(err) if self.next_candidate_after(&err) => {
                            warn!(peer = ?self.peer, ?err, "Connect failed, trying next address");
                            return self.try_candidates();
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                ConnectPhase::TunnelRequest(request) => {
                    let link = active_link(&mut self.link, "resume_connect", self.state)?;
                    match self.framing.put(link, &request)? {
                        Progress::Done => {
                            debug!("Sent CONNECT request to proxy");
                            self.phase = Some(ConnectPhase::TunnelResponse);
                        }
                        Progress::InProgress(want) => {
                            self.phase = Some(ConnectPhase::TunnelRequest(request));
                            return Ok(Progress::InProgress(want));
                        }
                    }
                }
                ConnectPhase::TunnelResponse => {
                    let link = active_link(&mut self.link, "resume_connect", self.state)?;
                    let max = self.options.max_message_bytes;
                    match self.framing.get(link, &complete::http_head, max)? {
                        Frame::Message(_) => {
                            check_response(self.framing.message())?;
                            self.framing.reset();
                            self.wrap_tls_client()?;
                        }
                        Frame::Incomplete(want) => {
                            self.phase = Some(ConnectPhase::TunnelResponse);
                            return Ok(Progress::InProgress(want));
                        }
                        Frame::Closed => {
                            return Err(Error::TunnelRefused(
                                "proxy closed the connection".to_string(),
                            ))
                        }
                    }
                }
                ConnectPhase::Handshake => {
                    let link = active_link(&mut self.link, "resume_connect", self.state)?;
                    if let IoStatus::Blocked(want) = link.handshake()? {
                        self.phase = Some(ConnectPhase::Handshake);
                        return Ok(Progress::InProgress(want));
                    }
                }
            }
        }
    }

    fn after_tcp_connect(&mut self) -> Result<(), Error> {
        debug!(peer = ?self.peer, "TCP connection established");
        if self.transport != TransportKind::Tls {
            return Ok(());
        }
        let tunnel = match (&self.options.proxy, &self.target) {
            (Some(_), Some(target)) => Some(connect_request(&target.host, target.port)),
            _ => None,
        };
        match tunnel {
            Some(request) => {
                self.phase = Some(ConnectPhase::TunnelRequest(request));
                Ok(())
            }
            None => self.wrap_tls_client(),
        }
    }

    // Wraps the connected stream in a TLS client session.
    pub(super) fn wrap_tls_client(&mut self) -> Result<(), Error> {
        if self.transport != TransportKind::Tls {
            return Ok(());
        }
        let config = match self.tls_client.clone() {
            Some(config) => config,
            None => {
                let path = self
                    .options
                    .tls_ca_cert
                    .as_deref()
                    .ok_or(Error::TlsClientConfigMissing)?;
                let config = Arc::new(load_tls_client_config(path)?);
                self.tls_client = Some(config.clone());
                config
            }
        };
        let server_name = match (&self.options.tls_server_name, &self.target) {
            (Some(name), _) => name.clone(),
            (None, Some(target)) => target.host.clone(),
            (None, None) => match self.peer {
                Some(peer) => peer.ip().to_string(),
                None => return Err(Error::TlsInvalidServerName(String::new())),
            },
        };

        let Some(link) = self.link.take() else {
            return Err(Error::OutOfState {
                op: "resume_connect",
                state: self.state,
            });
        };
        let link = TlsLink::client(link.into_stream(), config, &server_name)?;
        self.link = Some(Box::new(link));
        self.phase = Some(ConnectPhase::Handshake);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::connection::Protocol;
    use std::collections::VecDeque;
    use std::net::{SocketAddr, TcpListener};
    use std::thread;
    use std::time::Duration;

    // Runs the candidate loop the way connect() does, then resumes until done.
    fn connect_through(conn: &mut Connection, candidates: &[SocketAddr]) -> Result<(), Error> {
        conn.candidates = candidates.iter().copied().collect::<VecDeque<_>>();
        let mut progress = conn.try_candidates()?;
        for _ in 0..5000 {
            if progress == Progress::Done {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
            progress = conn.drive_connect()?;
        }
        panic!("connect did not finish");
    }

    fn closed_port() -> SocketAddr {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
    }

    #[test]
    fn unreachable_candidate_falls_through_to_the_next() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let good = server.local_addr().unwrap();
        // TCP to a multicast group fails at once with "network unreachable".
        let unreachable = SocketAddr::from(([224, 0, 0, 1], good.port()));

        let mut conn = Connection::new(Options::default(), Protocol::Z3950);
        connect_through(&mut conn, &[unreachable, good]).unwrap();

        assert_eq!(conn.state(), State::DataTransfer);
        assert_eq!(conn.peer_addr(), Some(good));
        assert!(conn.candidates.is_empty());
        let (_, seen) = server.accept().unwrap();
        assert_eq!(seen, conn.local_addr().unwrap());
    }

    #[test]
    fn refused_candidate_ends_the_attempt() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let good = server.local_addr().unwrap();
        let refused = closed_port();

        let mut conn = Connection::new(Options::default(), Protocol::Z3950);
        let err = connect_through(&mut conn, &[refused, good]).unwrap_err();

        assert!(
            matches!(&err, Error::Io(io_err) if io_err.kind() == io::ErrorKind::ConnectionRefused),
            "{err:?}"
        );
        assert_ne!(conn.peer_addr(), Some(good));
        assert_eq!(conn.candidates, VecDeque::from([good]));
    }

    #[test]
    fn last_candidate_failure_is_reported() {
        let mut conn = Connection::new(Options::default(), Protocol::Z3950);
        let unreachable = SocketAddr::from(([224, 0, 0, 1], 210));
        let err = connect_through(&mut conn, &[unreachable]).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err:?}");
    }
}
