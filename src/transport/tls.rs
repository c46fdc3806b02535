//! TLS link.
//!
//! Wraps a TCP stream in a rustls session and drives the record layer with
//! the same non-blocking contract as a plain link: every call makes as much
//! progress as the socket allows and then reports the direction it is
//! waiting on.

use super::tcp::shutdown;
use super::{CredentialSet, IoStatus, Link, TransportKind, Want, Wire};
use crate::error::Error;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

enum TlsSession {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

pub(crate) struct TlsLink {
    stream: TcpStream,
    session: TlsSession,
}

// What a single read_tls() achieved.
enum Fill {
    Records,
    Eof,
    Blocked,
}

impl TlsLink {
    pub(crate) fn client(
        stream: TcpStream,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;
        let session = rustls::ClientConnection::new(config, name)?;
        debug!(server_name, "Created TLS client session");
        Ok(Self {
            stream,
            session: TlsSession::Client(session),
        })
    }

    pub(crate) fn server(stream: TcpStream, credentials: &CredentialSet) -> Result<Self, Error> {
        let session = rustls::ServerConnection::new(credentials.config())?;
        debug!("Created TLS server session");
        Ok(Self {
            stream,
            session: TlsSession::Server(session),
        })
    }

    fn read_tls(&mut self) -> Result<usize, std::io::Error> {
        match &mut self.session {
            TlsSession::Server(conn) => conn.read_tls(&mut self.stream),
            TlsSession::Client(conn) => conn.read_tls(&mut self.stream),
        }
    }

    fn write_tls(&mut self) -> Result<usize, std::io::Error> {
        match &mut self.session {
            TlsSession::Server(conn) => conn.write_tls(&mut self.stream),
            TlsSession::Client(conn) => conn.write_tls(&mut self.stream),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match &mut self.session {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.session {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match &mut self.session {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match &mut self.session {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match &self.session {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match &mut self.session {
            TlsSession::Server(conn) => conn.send_close_notify(),
            TlsSession::Client(conn) => conn.send_close_notify(),
        }
    }

    // Writes queued records to the socket. Returns the direction to wait on
    // if the socket would block before everything went out.
    fn write_pending(&mut self) -> Result<Option<Want>, Error> {
        while self.wants_write() {
            match self.write_tls() {
                Ok(sz) => trace!(len = sz, "Wrote encrypted data to socket"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Some(Want::Write)),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    // Reads encrypted data from the socket and decrypts it.
    fn fill(&mut self) -> Result<Fill, Error> {
        loop {
            match self.read_tls() {
                Ok(0) => return Ok(Fill::Eof),
                Ok(sz) => {
                    trace!(len = sz, "Read encrypted data from socket");
                    if let Err(err) = self.process_new_packets() {
                        // Get the alert out before reporting the failure.
                        let _ = self.write_tls();
                        return Err(err.into());
                    }
                    return Ok(Fill::Records);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Fill::Blocked),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Wire for TlsLink {
    fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus, Error> {
        loop {
            match self.reader().read(buf) {
                Ok(sz) => {
                    trace!(len = sz, "Read plaintext from TLS");
                    return Ok(IoStatus::Ready(sz));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                // Peer closed the socket without close_notify.
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    warn!("TLS stream truncated by peer");
                    return Ok(IoStatus::Ready(0));
                }
                Err(err) => return Err(err.into()),
            }

            // A renegotiation or key update may need to write before the
            // peer sends anything we can read.
            let pending_write = self.write_pending()?;

            match self.fill()? {
                Fill::Records => continue,
                Fill::Eof => return Ok(IoStatus::Ready(0)),
                Fill::Blocked => {
                    let want = match pending_write {
                        Some(_) => Want::ReadWrite,
                        None => Want::Read,
                    };
                    return Ok(IoStatus::Blocked(want));
                }
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, Error> {
        loop {
            let accepted = self.writer().write(buf)?;
            trace!(len = accepted, "Wrote plaintext to TLS");
            let pending = self.write_pending()?;
            match (accepted, pending) {
                (0, Some(want)) => return Ok(IoStatus::Blocked(want)),
                // The plaintext buffer was full; flushing made room.
                (0, None) if !buf.is_empty() => continue,
                (sz, _) => return Ok(IoStatus::Ready(sz)),
            }
        }
    }

    fn flush(&mut self) -> Result<IoStatus, Error> {
        match self.write_pending()? {
            Some(want) => Ok(IoStatus::Blocked(want)),
            None => Ok(IoStatus::Ready(0)),
        }
    }
}

impl Link for TlsLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    fn handshake(&mut self) -> Result<IoStatus, Error> {
        loop {
            if let Some(want) = self.write_pending()? {
                return Ok(IoStatus::Blocked(want));
            }
            if !self.is_handshaking() {
                info!("TLS handshake completed");
                return Ok(IoStatus::Ready(0));
            }
            match self.fill()? {
                Fill::Records => continue,
                Fill::Eof => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the connection during the TLS handshake",
                    )
                    .into())
                }
                Fill::Blocked => return Ok(IoStatus::Blocked(Want::Read)),
            }
        }
    }

    fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn into_stream(self: Box<Self>) -> TcpStream {
        self.stream
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        let certs = match &self.session {
            TlsSession::Server(conn) => conn.peer_certificates(),
            TlsSession::Client(conn) => conn.peer_certificates(),
        };
        certs.and_then(|chain| chain.first()).map(|cert| cert.as_ref().to_vec())
    }

    fn close(&mut self) {
        self.send_close_notify();
        // Best effort: the peer learns about the close either way.
        let _ = self.write_pending();
        shutdown(&self.stream);
    }
}
