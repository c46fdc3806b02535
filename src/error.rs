use crate::connection::State;
use std::net::SocketAddr;
use thiserror::Error;

/// The error type for comstack operations.
///
/// Every operation on a [`Connection`](crate::Connection) that fails records
/// the [`ErrorKind`] of the returned error on the connection. Apart from
/// [`Error::DeniedByFilter`], which concerns the rejected peer rather than the
/// listener, a recorded error leaves the connection unusable; the caller is
/// expected to [`close()`](crate::Connection::close) it.
///
/// "Would block" outcomes are not errors. They are reported through
/// [`Progress::InProgress`](crate::Progress::InProgress),
/// [`Frame::Incomplete`](crate::Frame::Incomplete) and
/// [`Listen::NoDataYet`](crate::Listen::NoDataYet).
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host specification could not be parsed or resolved.
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    /// The background resolver thread went away without reporting a result.
    #[error("Address resolution worker terminated unexpectedly")]
    ResolverTerminated,

    // ============================================================================
    // Contract Errors
    // ============================================================================

    /// The operation is not valid in the connection's current state.
    #[error("Operation {op} not valid in state {state:?}")]
    OutOfState { op: &'static str, state: State },

    /// The accept filter rejected the peer. The raw socket has been closed.
    #[error("Peer {peer} rejected by accept filter")]
    DeniedByFilter { peer: SocketAddr },

    /// A `put()` was retried with a buffer of a different size than the one
    /// that started the partial write.
    #[error("put() retried with {got} bytes, but the partial write started with {expected}")]
    WrongBuffer { expected: usize, got: usize },

    /// An incoming message grew beyond `max_message_bytes`.
    #[error("Incoming message exceeds the maximum of {max} bytes")]
    BufferSizeExceeded { max: usize },

    /// The caller's poll loop gave up waiting on this connection.
    #[error("Operation timed out")]
    Timeout,

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// The TLS handshake or record layer failed.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A TLS listener was bound without `tls_server_cert`/`tls_server_key`
    /// and without a credential set.
    #[error("TLS server configuration not provided - required for bind()")]
    TlsServerConfigMissing,

    /// A TLS client connect was attempted without `tls_ca_cert` and without a
    /// pre-built client configuration.
    #[error("TLS client configuration not provided - required for connect()")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    // ============================================================================
    // Proxy Errors
    // ============================================================================

    /// The proxy did not accept the CONNECT request.
    #[error("Proxy refused tunnel: {0}")]
    TunnelRefused(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `transport` configuration key.
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },
}

/// Classification of an [`Error`], as recorded in a connection's error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operating system socket or I/O failure, including address problems.
    System,
    /// Operation invalid in the current state.
    OutOfState,
    /// Accept filter rejected the peer.
    DeniedByFilter,
    /// Mismatched retried `put()`.
    WrongBuffer,
    /// Message larger than `max_message_bytes`.
    BufferSizeExceeded,
    /// TLS configuration, handshake or record failure.
    Tls,
    /// Proxy tunnel negotiation failed.
    Tunnel,
    /// Caller-detected timeout.
    Timeout,
    /// Invalid options.
    Config,
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::InvalidAddress(_) | Error::ResolverTerminated => {
                ErrorKind::System
            }
            Error::OutOfState { .. } => ErrorKind::OutOfState,
            Error::DeniedByFilter { .. } => ErrorKind::DeniedByFilter,
            Error::WrongBuffer { .. } => ErrorKind::WrongBuffer,
            Error::BufferSizeExceeded { .. } => ErrorKind::BufferSizeExceeded,
            Error::Timeout => ErrorKind::Timeout,
            Error::TlsCertificateLoad { .. }
            | Error::TlsKeyLoad { .. }
            | Error::TlsInvalidCertificate(_)
            | Error::TlsInvalidKey(_)
            | Error::TlsInvalidServerName(_)
            | Error::Tls(_)
            | Error::TlsServerConfigMissing
            | Error::TlsClientConfigMissing
            | Error::TlsServerConfigBuild(_) => ErrorKind::Tls,
            Error::TunnelRefused(_) => ErrorKind::Tunnel,
            Error::Config(_) | Error::InvalidTransportType { .. } => ErrorKind::Config,
        }
    }
}
