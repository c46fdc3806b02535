//! Byte-stream links underneath a connection.
//!
//! A [`Link`] is either a plain TCP stream or a TLS session on top of one.
//! Both report non-blocking progress with the same [`IoStatus`] vocabulary, so
//! the connection state machine and the framing engine are written once
//! against the trait and never branch on the transport kind.

mod tcp;
mod tls;
mod tls_config;
pub(crate) mod tunnel;

pub(crate) use tcp::{bind_listener, connect_status, connect_stream, set_nonblocking, PlainLink};
pub(crate) use tls::TlsLink;
pub use tls_config::CredentialSet;
pub(crate) use tls_config::load_tls_client_config;

use crate::error::Error;
use mio::net::TcpStream;
use mio::Interest;
use std::str::FromStr;

/// Direction a non-blocking operation is waiting on before it can make
/// progress.
///
/// Under TLS the direction need not match the operation that reported it: a
/// read may have to wait for the socket to become writable and vice versa.
/// Always re-arm on the reported direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Want {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl Want {
    /// The poll interest matching this direction, if any.
    pub fn interest(self) -> Option<Interest> {
        match self {
            Want::None => None,
            Want::Read => Some(Interest::READABLE),
            Want::Write => Some(Interest::WRITABLE),
            Want::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }
}

/// The transport a connection speaks once the TCP stream is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "tls" | "ssl" => Ok(TransportKind::Tls),
            _ => Err(Error::InvalidTransportType {
                got: s.to_string(),
                valid: vec!["tcp".to_string(), "tls".to_string()],
            }),
        }
    }
}

// Outcome of a single non-blocking link operation. `Ready(0)` from `recv`
// means the peer ended the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStatus {
    Ready(usize),
    Blocked(Want),
}

// Raw byte movement. This is all the framing engine needs.
pub(crate) trait Wire {
    fn recv(&mut self, buf: &mut [u8]) -> Result<IoStatus, Error>;

    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, Error>;

    // Pushes out anything the link buffered internally.
    fn flush(&mut self) -> Result<IoStatus, Error> {
        Ok(IoStatus::Ready(0))
    }
}

// A live connection link: plain TCP or TLS over TCP.
pub(crate) trait Link: Wire + Send {
    fn kind(&self) -> TransportKind;

    // Drives one round of the link's own handshake. Plain links have none.
    fn handshake(&mut self) -> Result<IoStatus, Error> {
        Ok(IoStatus::Ready(0))
    }

    fn stream(&self) -> &TcpStream;

    fn stream_mut(&mut self) -> &mut TcpStream;

    fn into_stream(self: Box<Self>) -> TcpStream;

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    fn close(&mut self);
}
