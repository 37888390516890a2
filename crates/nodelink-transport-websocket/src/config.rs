//! WebSocket transport configuration

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::frame::DEFAULT_MAX_PAYLOAD;
use crate::{TransportError, TransportResult};

/// Client-side WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Gateway URL (`ws://` or `wss://`)
    pub url: Url,

    /// Budget for TCP connect, TLS and the upgrade handshake, each
    pub connect_timeout: Duration,

    /// Silence on the read side longer than this is treated as a dead peer
    pub read_timeout: Duration,

    /// Maximum inbound frame payload
    pub max_frame_size: usize,

    /// Extra headers sent with the upgrade request
    pub headers: Vec<(String, String)>,

    /// Verify the server certificate chain against the webpki roots
    /// (disable for local testing only)
    pub verify_server_cert: bool,
}

impl WebSocketConfig {
    /// Create a configuration with defaults for the given gateway URL
    pub fn new(url: &str) -> TransportResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL {}: {}", url, e)))?;

        let config = Self {
            url,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(90),
            max_frame_size: DEFAULT_MAX_PAYLOAD,
            headers: Vec::new(),
            verify_server_cert: true,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    pub fn host(&self) -> TransportResult<&str> {
        self.url
            .host_str()
            .ok_or_else(|| TransportError::ConfigurationError("URL has no host".to_string()))
    }

    /// Explicit port, or 80/443 by scheme
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// Value for the `Host` header; the port is omitted when it is the default
    pub fn host_header(&self) -> TransportResult<String> {
        let host = self.host()?;
        Ok(match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// Request target: path plus query, `/` when empty
    pub fn request_path(&self) -> String {
        let path = match self.url.path() {
            "" => "/",
            p => p,
        };
        match self.url.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }

    pub fn validate(&self) -> TransportResult<()> {
        match self.url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported scheme: {}",
                    other
                )))
            }
        }
        self.host()?;
        if self.max_frame_size == 0 {
            return Err(TransportError::ConfigurationError(
                "max_frame_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector for client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let client_crypto = if self.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
