//! HTTP CONNECT tunnel through a proxy.
//!
//! The request is written with the ordinary `put()` machinery and the
//! response is read with `get()` using the headers-only completion predicate,
//! so the exchange suspends and resumes like any other non-blocking I/O.

use crate::error::Error;
use tracing::{debug, warn};

/// Builds the CONNECT request for `host:port`.
pub(crate) fn connect_request(host: &str, port: u16) -> Vec<u8> {
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").into_bytes()
}

/// Checks the status line of the proxy's reply. Any 2xx opens the tunnel;
/// the rest of the header block is discarded.
pub(crate) fn check_response(head: &[u8]) -> Result<(), Error> {
    let text = String::from_utf8_lossy(head);
    let status_line = text.lines().next().unwrap_or_default().trim().to_string();

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().and_then(|code| code.parse::<u16>().ok());

    match code {
        Some(code) if version.starts_with("HTTP/") && (200..300).contains(&code) => {
            debug!(status = code, "Proxy tunnel established");
            Ok(())
        }
        _ => {
            warn!(%status_line, "Proxy refused tunnel");
            Err(Error::TunnelRefused(status_line))
        }
    }
}
