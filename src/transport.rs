use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{ClientTlsConfig, ServerTlsConfig, TargetConfig};

/// A byte stream on either leg of the proxy, plain TCP or TLS.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Capability to open a stream to the target endpoint.
#[async_trait]
pub trait TargetDialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

/// Dials the target over TCP, wrapping the stream in TLS when configured.
pub struct TcpDialer {
    hostname: String,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(target: &TargetConfig, connect_timeout: Duration) -> anyhow::Result<Self> {
        let tls = match &target.tls {
            Some(tls) => {
                let name = tls.server_name.as_deref().unwrap_or(&target.hostname);
                let server_name = ServerName::try_from(name.to_string())
                    .with_context(|| format!("Invalid TLS server name '{}'", name))?;
                let connector = TlsConnector::from(Arc::new(client_config(tls)?));
                Some((connector, server_name))
            }
            None => None,
        };

        Ok(Self {
            hostname: target.hostname.clone(),
            port: target.port,
            tls,
            connect_timeout,
        })
    }

    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((self.hostname.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        match &self.tls {
            Some((connector, server_name)) => {
                let stream = connector.connect(server_name.clone(), stream).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

#[async_trait]
impl TargetDialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        match tokio::time::timeout(self.connect_timeout, self.connect()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "Connecting to {}:{} timed out after {:?}",
                    self.hostname, self.port, self.connect_timeout
                ),
            )),
        }
    }
}

/// Accept side of the proxy: plain TCP, or a TLS handshake on top of it.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl Acceptor {
    pub fn new(tls: Option<&ServerTlsConfig>) -> anyhow::Result<Self> {
        match tls {
            Some(tls) => {
                ensure_crypto_provider();
                let certs = load_certs(&tls.cert_path)?;
                let key = load_private_key(&tls.key_path)?;
                let config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .with_context(|| "Invalid TLS certificate/key pair")?;
                Ok(Acceptor::Tls(TlsAcceptor::from(Arc::new(config))))
            }
            None => Ok(Acceptor::Plain),
        }
    }

    pub async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        match self {
            Acceptor::Plain => Ok(Box::new(stream)),
            Acceptor::Tls(acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Acceptor::Tls(_))
    }
}

fn client_config(tls: &ClientTlsConfig) -> anyhow::Result<ClientConfig> {
    ensure_crypto_provider();

    if tls.insecure_skip_verify {
        warn!("Certificate verification of the target is disabled");
        return Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    match &tls.ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .with_context(|| format!("Invalid CA certificate in {}", path.display()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse key in {}", path.display()))?
        .with_context(|| format!("No private key found in {}", path.display()))
}

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Fails only when another provider is already installed, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
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
