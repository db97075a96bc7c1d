//! TLS termination for the SMTP listener.
//!
//! Certificates come from a [`CertificateManager`]. The default manager reads
//! the PEM files an external ACME client keeps renewed under
//! `<cert dir>/<domain>/` and re-reads them periodically; the self-signed
//! manager exists for local testing.

use crate::config::ServerConfig;
use log::{error, info, warn};
use rcgen::generate_simple_self_signed;
use rustls::crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// ALPN identifiers offered during the handshake.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"smtp", b"smtps"];

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Installs the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = aws_lc_rs::default_provider().install_default();
}

/// Produces a ready-to-use TLS server configuration for a domain.
pub trait CertificateManager {
    fn obtain_tls_config(
        &self,
        domain: &str,
        admin_email: &str,
    ) -> Result<Arc<rustls::ServerConfig>, CertificateError>;
}

/// Holds the certificate served on every handshake. Renewal swaps it out
/// without rebuilding the TLS configuration.
pub struct CertificateStore {
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertificateStore {
    pub fn new(key: CertifiedKey) -> Self {
        CertificateStore {
            current: RwLock::new(Arc::new(key)),
        }
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, key: CertifiedKey) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(key);
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

/// Asks for a client certificate without requiring one. A presented
/// certificate is not checked against any trust store, only its handshake
/// signature is verified.
#[derive(Debug)]
pub struct AcceptAnyClientCert(Arc<CryptoProvider>);

impl AcceptAnyClientCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Builds the server configuration around a certificate store: optional
/// client certificates and `smtp`/`smtps` ALPN.
pub fn build_server_config(
    store: Arc<CertificateStore>,
) -> Result<Arc<rustls::ServerConfig>, CertificateError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new(provider)))
        .with_cert_resolver(store);
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, CertificateError> {
    let signing_key = aws_lc_rs::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Loads the certificate files an external ACME client maintains.
pub struct FileCertificates {
    cert_dir: PathBuf,
    reload_interval: Duration,
}

impl FileCertificates {
    pub fn new(cert_dir: impl Into<PathBuf>, reload_interval: Duration) -> Self {
        FileCertificates {
            cert_dir: cert_dir.into(),
            reload_interval,
        }
    }

    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(domain)
    }

    /// Reads `fullchain.pem` and `privkey.pem` from `dir`.
    pub fn load(dir: &Path) -> Result<CertifiedKey, CertificateError> {
        let chain_path = dir.join("fullchain.pem");
        let key_path = dir.join("privkey.pem");

        let chain_pem = read_file(&chain_path)?;
        let chain = rustls_pemfile::certs(&mut chain_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CertificateError::Io {
                path: chain_path.clone(),
                source,
            })?;
        if chain.is_empty() {
            return Err(CertificateError::NoCertificates(chain_path));
        }

        let key_pem = read_file(&key_path)?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|source| CertificateError::Io {
                path: key_path.clone(),
                source,
            })?
            .ok_or_else(|| CertificateError::NoPrivateKey(key_path.clone()))?;

        certified_key(chain, key)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertificateError> {
    std::fs::read(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl CertificateManager for FileCertificates {
    /// Must be called inside a Tokio runtime: it spawns the reload task,
    /// which stops once the returned configuration is dropped.
    fn obtain_tls_config(
        &self,
        domain: &str,
        admin_email: &str,
    ) -> Result<Arc<rustls::ServerConfig>, CertificateError> {
        let dir = self.domain_dir(domain);
        info!(
            "Loading TLS certificate for {} from {} (ACME contact: {})",
            domain,
            dir.display(),
            admin_email
        );
        let store = Arc::new(CertificateStore::new(Self::load(&dir)?));
        spawn_reload(Arc::downgrade(&store), dir, self.reload_interval);
        build_server_config(store)
    }
}

fn spawn_reload(store: Weak<CertificateStore>, dir: PathBuf, period: Duration) {
    if period.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            match FileCertificates::load(&dir) {
                Ok(key) => {
                    store.replace(key);
                    info!("Reloaded TLS certificate from {}", dir.display());
                }
                Err(e) => warn!("Keeping current TLS certificate, reload failed: {}", e),
            }
        }
    });
}

/// Generates a throwaway self-signed certificate at startup.
pub struct SelfSignedCertificates;

impl SelfSignedCertificates {
    pub fn generate(
        domain: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CertificateError> {
        let certified_key = generate_simple_self_signed(vec![domain.to_string()])?;

        let cert_der = certified_key.cert.der().to_vec();
        let key_der = certified_key.signing_key.serialize_der();

        Ok((
            CertificateDer::from(cert_der),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        ))
    }
}

impl CertificateManager for SelfSignedCertificates {
    fn obtain_tls_config(
        &self,
        domain: &str,
        _admin_email: &str,
    ) -> Result<Arc<rustls::ServerConfig>, CertificateError> {
        warn!("Using a self-signed TLS certificate for {}", domain);
        let (cert, key) = Self::generate(domain)?;
        let store = Arc::new(CertificateStore::new(certified_key(vec![cert], key)?));
        build_server_config(store)
    }
}

/// Picks the certificate source from the configuration.
pub fn manager_from_config(config: &ServerConfig) -> Box<dyn CertificateManager> {
    if config.tls_self_signed {
        Box::new(SelfSignedCertificates)
    } else {
        Box::new(FileCertificates::new(
            config.tls_cert_dir.clone(),
            config.tls_reload_interval,
        ))
    }
}

/// Obtains the TLS configuration for the configured domain. Failure is fatal
/// for TLS mode.
pub fn acceptor_from_config(config: &ServerConfig) -> Result<TlsAcceptor, CertificateError> {
    let manager = manager_from_config(config);
    match manager.obtain_tls_config(&config.domain, &config.admin_email) {
        Ok(tls_config) => Ok(TlsAcceptor::from(tls_config)),
        Err(e) => {
            error!("Could not obtain a TLS certificate for {}: {}", config.domain, e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cert_dir(domain: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("girouette-certs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join(domain)).unwrap();
        root
    }

    fn write_pem_pair(dir: &Path, domain: &str) -> Vec<u8> {
        let generated = generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        std::fs::write(dir.join("fullchain.pem"), generated.cert.pem()).unwrap();
        std::fs::write(dir.join("privkey.pem"), generated.signing_key.serialize_pem()).unwrap();
        generated.cert.der().to_vec()
    }

    #[test]
    fn test_self_signed_config_offers_optional_client_auth_and_alpn() {
        install_crypto_provider();
        let config = SelfSignedCertificates
            .obtain_tls_config("mx.example.com", "ops@example.com")
            .unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"smtp".to_vec(), b"smtps".to_vec()]
        );
    }

    #[test]
    fn test_accept_any_client_cert_is_optional() {
        let verifier = AcceptAnyClientCert::new(Arc::new(aws_lc_rs::default_provider()));
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn test_file_certificates_load_from_domain_dir() {
        install_crypto_provider();
        let root = temp_cert_dir("mx.example.com");
        let expected = write_pem_pair(&root.join("mx.example.com"), "mx.example.com");

        let manager = FileCertificates::new(&root, Duration::from_secs(3600));
        manager
            .obtain_tls_config("mx.example.com", "ops@example.com")
            .unwrap();
        let key = FileCertificates::load(&manager.domain_dir("mx.example.com")).unwrap();
        assert_eq!(key.cert[0].as_ref(), expected.as_slice());

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_missing_certificate_files_are_fatal() {
        let root = temp_cert_dir("other.example.com");
        let manager = FileCertificates::new(&root, Duration::ZERO);
        let err = manager
            .obtain_tls_config("missing.example.com", "ops@example.com")
            .unwrap_err();
        assert!(matches!(err, CertificateError::Io { .. }), "got {:?}", err);
        assert!(err.to_string().contains("fullchain.pem"));

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_empty_pem_files_are_rejected() {
        let root = temp_cert_dir("mx.example.com");
        let dir = root.join("mx.example.com");
        std::fs::write(dir.join("fullchain.pem"), b"").unwrap();
        std::fs::write(dir.join("privkey.pem"), b"").unwrap();

        let err = FileCertificates::load(&dir).unwrap_err();
        assert!(matches!(err, CertificateError::NoCertificates(_)));

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_store_replace_swaps_served_certificate() {
        let (cert_a, key_a) = SelfSignedCertificates::generate("a.example.com").unwrap();
        let (cert_b, key_b) = SelfSignedCertificates::generate("b.example.com").unwrap();

        let store = CertificateStore::new(certified_key(vec![cert_a.clone()], key_a).unwrap());
        assert_eq!(store.current().cert[0], cert_a);

        store.replace(certified_key(vec![cert_b.clone()], key_b).unwrap());
        assert_eq!(store.current().cert[0], cert_b);
    }

    #[tokio::test]
    async fn test_reload_task_picks_up_renewed_files() {
        install_crypto_provider();
        let root = temp_cert_dir("mx.example.com");
        let dir = root.join("mx.example.com");
        write_pem_pair(&dir, "mx.example.com");

        let store = Arc::new(CertificateStore::new(FileCertificates::load(&dir).unwrap()));
        spawn_reload(Arc::downgrade(&store), dir.clone(), Duration::from_millis(50));

        let renewed = write_pem_pair(&dir, "mx.example.com");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.current().cert[0].as_ref(), renewed.as_slice());

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_manager_selection() {
        install_crypto_provider();
        let config = ServerConfig {
            tls_self_signed: true,
            ..ServerConfig::default()
        };
        assert!(acceptor_from_config(&config).is_ok());
    }
}
