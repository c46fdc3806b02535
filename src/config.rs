//! Connection options and their namespaced configuration lookup.

use crate::error::Error;
use crate::transport::TransportKind;
use ::config::Config;

/// Default upper bound for a single incoming message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 128 * 1024 * 1024;

/// Options recognized by a [`Connection`](crate::Connection).
///
/// Build them programmatically or read them from a [`Config`] with
/// [`Options::from_config`] / [`Options::from_config_named`].
///
/// # Configuration Keys
///
/// - `blocking`: let connect/get/put block the calling thread (default `false`)
/// - `numeric_host`: skip reverse DNS in `address_to_string()` (default `true`)
/// - `dns_no_block`: resolve host names on a background thread when the
///   connection is non-blocking (default `true`)
/// - `max_message_bytes`: hard cap enforced by `get()` (default 128 MiB)
/// - `default_port`: overrides the port derived from the protocol tag
/// - `transport`: either "tcp" or "tls" (default "tcp")
/// - `proxy`: host of an HTTP proxy to dial instead of the target
/// - `tls_server_cert`, `tls_server_key`: PEM files for TLS listeners
/// - `tls_ca_cert`: PEM file with the roots TLS clients trust
/// - `tls_server_name`: SNI/verification name, defaults to the target host
///
/// # Example
///
/// ```toml
/// transport = "tls"
/// tls_ca_cert = "/etc/comstack/ca.pem"
///
/// [catalog]
/// proxy = "proxy.example.org:3128"
/// max_message_bytes = 1048576
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    pub blocking: bool,
    pub numeric_host: bool,
    pub dns_no_block: bool,
    pub max_message_bytes: usize,
    pub default_port: Option<u16>,
    pub transport: TransportKind,
    pub proxy: Option<String>,
    pub tls_server_cert: Option<String>,
    pub tls_server_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    pub tls_server_name: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            blocking: false,
            numeric_host: true,
            dns_no_block: true,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            default_port: None,
            transport: TransportKind::Tcp,
            proxy: None,
            tls_server_cert: None,
            tls_server_key: None,
            tls_ca_cert: None,
            tls_server_name: None,
        }
    }
}

impl Options {
    /// Reads options from the un-namespaced keys of `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads options with configuration namespacing.
    ///
    /// Lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `catalog.transport`)
    /// 2. `{key}` (e.g., `transport`)
    /// 3. The value from [`Options::default`]
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let transport = match optional(get_namespaced_string(config, name, "transport"))? {
            Some(value) => value.parse()?,
            None => defaults.transport,
        };

        let default_port = optional(get_namespaced_usize(config, name, "default_port"))?
            .map(|port| {
                u16::try_from(port).map_err(|_| {
                    config::ConfigError::Message(format!("default_port {port} out of range"))
                })
            })
            .transpose()?;

        Ok(Self {
            blocking: optional(get_namespaced_bool(config, name, "blocking"))?
                .unwrap_or(defaults.blocking),
            numeric_host: optional(get_namespaced_bool(config, name, "numeric_host"))?
                .unwrap_or(defaults.numeric_host),
            dns_no_block: optional(get_namespaced_bool(config, name, "dns_no_block"))?
                .unwrap_or(defaults.dns_no_block),
            max_message_bytes: optional(get_namespaced_usize(config, name, "max_message_bytes"))?
                .unwrap_or(defaults.max_message_bytes),
            default_port,
            transport,
            proxy: optional(get_namespaced_string(config, name, "proxy"))?,
            tls_server_cert: optional(get_namespaced_string(config, name, "tls_server_cert"))?,
            tls_server_key: optional(get_namespaced_string(config, name, "tls_server_key"))?,
            tls_ca_cert: optional(get_namespaced_string(config, name, "tls_ca_cert"))?,
            tls_server_name: optional(get_namespaced_string(config, name, "tls_server_name"))?,
        })
    }
}

// A missing key falls back to the default; any other lookup failure (e.g. a
// type mismatch) is reported.
fn optional<T>(result: Result<T, config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}
