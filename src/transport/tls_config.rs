use crate::error::Error;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Weak};
use tracing::info;

/// Certificate and private key material backing a TLS listener.
///
/// A listener loads its credential set once, at `bind()`, and every
/// connection it accepts holds another reference to the same set. The
/// material is released when the last of them closes.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    config: Arc<ServerConfig>,
}

impl CredentialSet {
    /// Loads a PEM certificate chain and private key.
    pub fn load(cert_path: &str, key_path: &str) -> Result<Self, Error> {
        let config = load_tls_server_config(cert_path, key_path)?;
        info!(cert_path, "Loaded TLS credentials");
        Ok(Self::from_config(Arc::new(config)))
    }

    /// Wraps an already built server configuration.
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// A weak handle that observes when the credential set is released.
    pub fn downgrade(&self) -> Weak<ServerConfig> {
        Arc::downgrade(&self.config)
    }

    pub(crate) fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

// Reads every certificate in a PEM file. `role` names the file in errors.
fn read_certificates(path: &str, role: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|source| Error::TlsCertificateLoad {
        path: path.to_string(),
        source,
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("{role} {path} is not valid PEM: {e}")))?;
    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "{role} {path} holds no certificate"
        )));
    }
    Ok(chain)
}

pub(crate) fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<ServerConfig, Error> {
    let chain = read_certificates(cert_path, "credential certificate")?;

    let key_file = File::open(key_path).map_err(|source| Error::TlsKeyLoad {
        path: key_path.to_string(),
        source,
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidKey(format!("credential key {key_path} is not valid PEM: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("credential key {key_path} holds no private key")))?;

    // Fails when the key does not belong to the leaf certificate.
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(format!("{cert_path} with {key_path}: {e}")))
}

/// Trust roots for TLS clients, read from `tls_ca_cert`.
pub(crate) fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in read_certificates(ca_cert_path, "trust root file")? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(format!("trust root in {ca_cert_path}: {e}")))?;
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
