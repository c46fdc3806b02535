//! Host specification parsing and address resolution.
//!
//! A host specification has the form `[scheme:]host[:port][/db][?query]`.
//! Anything from the first `/` or `?` on belongs to the protocol layer above
//! and is dropped before resolution. Three sentinel hosts name passive
//! addresses:
//!
//! - `@`: any address, IPv6 socket accepting IPv4 too
//! - `@4`: any IPv4 address
//! - `@6`: any IPv6 address, IPv6 only
//!
//! Names that need DNS can be resolved on a background thread so that a
//! non-blocking connect never stalls the caller's poll loop.

use crate::error::Error;
use crate::transport::TransportKind;

use mio::event::Source;
use mio::unix::pipe;
use mio::{Interest, Registry, Token};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A parsed host specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Host name or literal address, without brackets.
    pub host: String,
    pub port: u16,
    /// `Some(true)`: IPv6 only. `Some(false)`: IPv6 socket that also accepts
    /// IPv4. `None`: system default.
    pub ipv6_only: Option<bool>,
    /// Transport implied by the scheme prefix, if any.
    pub transport: Option<TransportKind>,
    /// Whether the scheme prefix named HTTP.
    pub http: bool,
}

impl HostSpec {
    /// Whether the host is a literal address that resolves without DNS.
    pub fn is_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Resolves to candidate addresses in the order the system returns them.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, Error> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| {
                warn!(host = %self.host, ?err, "Address resolution failed");
                Error::InvalidAddress(format!("{}:{}", self.host, self.port))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::InvalidAddress(format!("{}:{}", self.host, self.port)));
        }
        debug!(host = %self.host, count = addrs.len(), "Resolved host");
        Ok(addrs)
    }
}

/// Parses a host specification.
///
/// `default_port` applies when the specification carries no `:port`, unless an
/// `http:`/`https:` scheme implies 80 or 443.
pub fn string_to_address(spec: &str, default_port: u16) -> Result<HostSpec, Error> {
    let invalid = || Error::InvalidAddress(spec.to_string());

    let mut rest = spec.trim();
    let mut transport = None;
    let mut http = false;
    let mut default_port = default_port;

    if rest.starts_with("unix:") {
        return Err(invalid());
    }
    for (prefix, kind, is_http, port) in [
        ("tcp:", TransportKind::Tcp, false, None),
        ("ssl:", TransportKind::Tls, false, None),
        ("tls:", TransportKind::Tls, false, None),
        ("http:", TransportKind::Tcp, true, Some(80)),
        ("https:", TransportKind::Tls, true, Some(443)),
    ] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped.strip_prefix("//").unwrap_or(stripped);
            transport = Some(kind);
            http = is_http;
            if let Some(port) = port {
                default_port = port;
            }
            break;
        }
    }

    if let Some(end) = rest.find(['/', '?']) {
        rest = &rest[..end];
    }

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let close = bracketed.find(']').ok_or_else(invalid)?;
        let after = &bracketed[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => return Err(invalid()),
        };
        (&bracketed[..close], port)
    } else if rest.matches(':').count() > 1 {
        // Bare IPv6 literal; no room for a port.
        (rest, None)
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };

    let (host, ipv6_only) = match host {
        "" | "@" => ("::", Some(false)),
        "@4" => ("0.0.0.0", None),
        "@6" => ("::", Some(true)),
        host => (host, None),
    };

    Ok(HostSpec {
        host: host.to_string(),
        port,
        ipv6_only,
        transport,
        http,
    })
}

/// Resolution running on a background thread.
///
/// The worker reports through a channel and then writes one byte into a
/// pipe, whose read end is what callers poll on. Dropping a pending
/// resolution joins the worker.
pub(crate) struct PendingResolution {
    spec: HostSpec,
    result: Receiver<Result<Vec<SocketAddr>, Error>>,
    notify: pipe::Receiver,
    worker: Option<JoinHandle<()>>,
}

impl PendingResolution {
    pub(crate) fn spawn(spec: HostSpec) -> Result<Self, Error> {
        let (tx, result) = sync_channel(1);
        let (notify_tx, notify) = pipe::new()?;

        let worker_spec = spec.clone();
        let worker = thread::Builder::new()
            .name("comstack-resolver".to_string())
            .spawn(move || {
                let resolved = worker_spec.resolve();
                // The receiving side may have been closed already.
                let _ = tx.send(resolved);
                let _ = (&notify_tx).write(&[1]);
            })?;

        info!(host = %spec.host, port = spec.port, "Resolving in background");
        Ok(Self {
            spec,
            result,
            notify,
            worker: Some(worker),
        })
    }

    /// Harvests the result if the worker has finished.
    pub(crate) fn poll(&mut self) -> Result<Option<Vec<SocketAddr>>, Error> {
        match self.result.try_recv() {
            Ok(resolved) => {
                self.join();
                resolved.map(Some)
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.join();
                Err(Error::ResolverTerminated)
            }
        }
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(host = %self.spec.host, "Resolver thread panicked");
            }
        }
    }
}

impl Drop for PendingResolution {
    fn drop(&mut self) {
        self.join();
    }
}

impl Source for PendingResolution {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.notify.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.notify.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.notify.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_and_trailing_material() {
        let spec = string_to_address("tcp:z3950.example.org:2100/Default?x-pquery", 210).unwrap();
        assert_eq!(spec.host, "z3950.example.org");
        assert_eq!(spec.port, 2100);
        assert_eq!(spec.transport, Some(TransportKind::Tcp));
        assert_eq!(spec.ipv6_only, None);

        let spec = string_to_address("z3950.example.org/Default", 210).unwrap();
        assert_eq!((spec.host.as_str(), spec.port), ("z3950.example.org", 210));
        assert_eq!(spec.transport, None);
    }

    #[test]
    fn schemes_pick_transport_and_port() {
        let spec = string_to_address("ssl:[::1]:9999", 210).unwrap();
        assert_eq!((spec.host.as_str(), spec.port), ("::1", 9999));
        assert_eq!(spec.transport, Some(TransportKind::Tls));

        let spec = string_to_address("http:example.org", 210).unwrap();
        assert_eq!(spec.port, 80);
        assert!(spec.http);

        let spec = string_to_address("https://example.org/sru", 210).unwrap();
        assert_eq!((spec.host.as_str(), spec.port), ("example.org", 443));
        assert_eq!(spec.transport, Some(TransportKind::Tls));

        let spec = string_to_address("http://example.org:8080", 210).unwrap();
        assert_eq!(spec.port, 8080);
    }

    #[test]
    fn passive_sentinels() {
        let any = string_to_address("@", 210).unwrap();
        assert_eq!((any.host.as_str(), any.ipv6_only), ("::", Some(false)));

        let v4 = string_to_address("@4:9000", 210).unwrap();
        assert_eq!((v4.host.as_str(), v4.port, v4.ipv6_only), ("0.0.0.0", 9000, None));

        let v6 = string_to_address("tcp:@6", 210).unwrap();
        assert_eq!((v6.host.as_str(), v6.ipv6_only), ("::", Some(true)));

        let empty = string_to_address(":2100", 210).unwrap();
        assert_eq!((empty.host.as_str(), empty.port), ("::", 2100));
    }

    #[test]
    fn bare_ipv6_literal_keeps_default_port() {
        let spec = string_to_address("fe80::1", 210).unwrap();
        assert_eq!((spec.host.as_str(), spec.port), ("fe80::1", 210));
        assert!(spec.is_literal());
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for bad in ["unix:/tmp/socket", "host:port", "host:70000", "[::1", "[::1]x"] {
            assert!(
                matches!(string_to_address(bad, 210), Err(Error::InvalidAddress(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn literal_resolution_needs_no_lookup() {
        let spec = string_to_address("127.0.0.1:210", 0).unwrap();
        assert!(spec.is_literal());
        assert_eq!(spec.resolve().unwrap(), vec!["127.0.0.1:210".parse().unwrap()]);
    }

    #[test]
    fn background_resolution_reports_through_channel() {
        let spec = string_to_address("localhost:210", 0).unwrap();
        let mut pending = PendingResolution::spawn(spec).unwrap();
        let addrs = loop {
            if let Some(addrs) = pending.poll().unwrap() {
                break addrs;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        };
        assert!(addrs.iter().all(|addr| addr.ip().is_loopback() && addr.port() == 210));
    }
}
