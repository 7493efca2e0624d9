//! TLS configuration for stream transports.
//!
//! Certificates and keys come from a [`Security`] store keyed by the domain a
//! transport serves. [`TlsContext`] turns that into rustls client and server
//! configurations and creates per-connection sessions; the transport itself
//! drives them sans-IO over its non-blocking sockets.

use std::collections::HashMap;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::events::FailureReason;

/// A certificate chain with its private key
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_chain: Vec<Certificate>,
    pub key: PrivateKey,
}

/// Source of certificates, keys and trust anchors
pub trait Security: Send + Sync {
    /// Identity presented for `domain`. An empty domain asks for the default identity.
    fn identity(&self, domain: &str) -> Result<TlsIdentity>;

    /// Trust anchors for validating peers
    fn root_store(&self) -> Result<RootCertStore>;
}

/// [`Security`] backed by PEM material, loaded from files or memory
#[derive(Default)]
pub struct PemSecurity {
    identities: RwLock<HashMap<String, TlsIdentity>>,
    roots: RwLock<Vec<Certificate>>,
}

impl PemSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain_pem(&self, domain: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        let cert_chain = parse_certs(cert_pem)?;
        if cert_chain.is_empty() {
            return Err(TransportError::TlsConfig(format!(
                "no certificate found for {}",
                domain
            )));
        }
        let key = parse_key(key_pem)?;
        self.identities
            .write()
            .insert(domain.to_ascii_lowercase(), TlsIdentity { cert_chain, key });
        Ok(())
    }

    pub fn add_domain_files(&self, domain: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            TransportError::TlsConfig(format!("reading {}: {}", cert_path.display(), e))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            TransportError::TlsConfig(format!("reading {}: {}", key_path.display(), e))
        })?;
        self.add_domain_pem(domain, &cert_pem, &key_pem)
    }

    /// Adds an already DER-encoded identity
    pub fn add_domain_der(&self, domain: &str, cert_chain: Vec<Vec<u8>>, key: Vec<u8>) {
        self.identities.write().insert(
            domain.to_ascii_lowercase(),
            TlsIdentity {
                cert_chain: cert_chain.into_iter().map(Certificate).collect(),
                key: PrivateKey(key),
            },
        );
    }

    pub fn add_root_pem(&self, pem: &[u8]) -> Result<()> {
        let certs = parse_certs(pem)?;
        self.roots.write().extend(certs);
        Ok(())
    }

    pub fn add_root_file(&self, path: &Path) -> Result<()> {
        let pem = std::fs::read(path)
            .map_err(|e| TransportError::TlsConfig(format!("reading {}: {}", path.display(), e)))?;
        self.add_root_pem(&pem)
    }

    pub fn add_root_der(&self, der: Vec<u8>) {
        self.roots.write().push(Certificate(der));
    }
}

impl Security for PemSecurity {
    fn identity(&self, domain: &str) -> Result<TlsIdentity> {
        let identities = self.identities.read();
        if domain.is_empty() && identities.len() == 1 {
            if let Some(identity) = identities.values().next() {
                return Ok(identity.clone());
            }
        }
        identities
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TransportError::TlsConfig(format!("no identity for domain '{}'", domain)))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        for cert in self.roots.read().iter() {
            store
                .add(cert)
                .map_err(|e| TransportError::TlsConfig(format!("bad trust anchor: {}", e)))?;
        }
        Ok(store)
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| TransportError::TlsConfig(format!("bad certificate PEM: {}", e)))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn parse_key(pem: &[u8]) -> Result<PrivateKey> {
    let mut reader = BufReader::new(pem);
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| TransportError::TlsConfig(format!("bad key PEM: {}", e)))?
        {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => return Err(TransportError::TlsConfig("no private key found".to_string())),
        }
    }
}

/// Client and server configurations for one TLS transport
#[derive(Clone)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Arc<ClientConfig>,
}

impl TlsContext {
    /// Builds the configurations for a transport serving `domain`.
    ///
    /// With an empty domain and no default identity the transport can only
    /// connect out; inbound handshakes are refused.
    pub fn new(security: &dyn Security, domain: &str) -> Result<Self> {
        let server = match security.identity(domain) {
            Ok(identity) => {
                let config = ServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_single_cert(identity.cert_chain, identity.key)
                    .map_err(|e| TransportError::TlsConfig(e.to_string()))?;
                Some(Arc::new(config))
            }
            Err(e) if domain.is_empty() => {
                warn!("no default TLS identity, transport is outbound only: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(security.root_store()?)
            .with_no_client_auth();

        Ok(TlsContext {
            server,
            client: Arc::new(client),
        })
    }

    pub fn can_accept(&self) -> bool {
        self.server.is_some()
    }

    pub fn accept(&self) -> Option<rustls::Connection> {
        let config = self.server.clone()?;
        match rustls::ServerConnection::new(config) {
            Ok(conn) => Some(conn.into()),
            Err(e) => {
                warn!("failed to create TLS server session: {}", e);
                None
            }
        }
    }

    /// Client session verifying the peer against `domain`, or against its IP
    /// address when no domain is known
    pub fn connect(&self, domain: &str, ip: IpAddr) -> std::result::Result<rustls::Connection, FailureReason> {
        let name = if domain.is_empty() {
            ServerName::IpAddress(ip)
        } else {
            ServerName::try_from(domain).map_err(|_| {
                debug!(domain, "target domain is not a valid server name");
                FailureReason::CertNameMismatch
            })?
        };
        rustls::ClientConnection::new(self.client.clone(), name)
            .map(Into::into)
            .map_err(|e| {
                warn!("failed to create TLS client session: {}", e);
                FailureReason::Failure
            })
    }
}

/// Maps a handshake error to the failure reported for pending sends
pub fn classify_tls_error(err: &rustls::Error) -> FailureReason {
    match err {
        rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName) => {
            FailureReason::CertNameMismatch
        }
        rustls::Error::InvalidCertificate(_) => FailureReason::CertValidationFailure,
        _ => FailureReason::ConnectionException,
    }
}


#[cfg(test)]
mod tests {
    use super::test_certs::security_for;
    use super::*;

    #[test]
    fn test_context_from_generated_identity() {
        let security = security_for("sip.example.com");
        let ctx = TlsContext::new(security.as_ref(), "sip.example.com").unwrap();
        assert!(ctx.can_accept());
        assert!(ctx.accept().is_some());
        assert!(ctx.connect("sip.example.com", "127.0.0.1".parse().unwrap()).is_ok());
    }

    #[test]
    fn test_default_identity_and_missing_domain() {
        let security = security_for("sip.example.com");
        assert!(security.identity("").is_ok());
        assert!(security.identity("other.example.com").is_err());
        assert!(TlsContext::new(security.as_ref(), "other.example.com").is_err());

        let empty = PemSecurity::new();
        let ctx = TlsContext::new(&empty, "").unwrap();
        assert!(!ctx.can_accept());
    }

    #[test]
    fn test_pem_parsing_rejects_garbage() {
        let security = PemSecurity::new();
        assert!(security.add_domain_pem("x", b"not pem", b"not pem").is_err());
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_tls_error(&rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName
            )),
            FailureReason::CertNameMismatch
        );
        assert_eq!(
            classify_tls_error(&rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer
            )),
            FailureReason::CertValidationFailure
        );
    }
}
