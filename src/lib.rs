//! comstack - A non-blocking, message-framed TCP/TLS connection layer
//!
//! comstack moves whole protocol messages over TCP and TLS, as client or
//! server, in blocking or non-blocking mode. Message boundaries are found by a
//! caller-supplied completion predicate; partially received messages and
//! partially flushed writes are carried across calls, so a single-threaded
//! poll loop can drive any number of connections.
//!
//! ```no_run
//! use comstack::prelude::*;
//!
//! # fn main() -> Result<(), Error> {
//! let options = Options {
//!     blocking: true,
//!     ..Options::default()
//! };
//! let mut conn = Connection::new(options, Protocol::Http);
//! conn.connect("http:example.org")?;
//! conn.put(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")?;
//! if let Frame::Message(len) = conn.get()? {
//!     println!("{len} byte response");
//! }
//! # Ok(())
//! # }
//! ```

// Internal-only modules
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod framing;
pub(crate) mod transport;

pub mod complete;
pub mod config;
pub mod resolver;

// These are the intended public API
pub use config::Options;
pub use connection::{
    Accept, BindMode, Connection, Event, Listen, Protocol, Resolution, State, Status,
};
pub use error::{Error, ErrorKind};
pub use framing::{next_capacity, surplus_capacity, Completion, Frame, Progress, CHUNK};
pub use resolver::{string_to_address, HostSpec};
pub use transport::{CredentialSet, TransportKind, Want};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::Options;
    pub use crate::connection::{
        Accept, BindMode, Connection, Event, Listen, Protocol, Resolution, State, Status,
    };
    pub use crate::error::{Error, ErrorKind};
    pub use crate::framing::{Frame, Progress};
    pub use crate::transport::{CredentialSet, TransportKind, Want};
}
