use crate::config::ServerConfig;
use crate::error::{Result, TetherError};
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::ClientConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Anything that can carry the protocol: TCP, TLS over TCP, or an in-memory pipe.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Duplex for T {}

pub type BoxedStream = Box<dyn Duplex>;

/// One established byte stream, opened per connection attempt.
pub struct Transport {
    stream: BoxedStream,
    tls: bool,
    peer: String,
}

impl Transport {
    pub fn new(stream: impl Duplex, tls: bool, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            tls,
            peer: peer.into(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn into_split(self) -> (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>) {
        tokio::io::split(self.stream)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Source of fresh transports for the client and its reconnect supervisor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport>;
}

pub struct TcpConnector {
    address: String,
    tls: Option<TlsOptions>,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, tls: Option<TlsOptions>) -> Self {
        Self {
            address: address.into(),
            tls,
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        let tls = server.tls.then(|| TlsOptions {
            client_cert: server.client_cert.clone(),
            client_key: server.client_key.clone(),
        });
        Self::new(server.address.clone(), tls)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Transport> {
        open(&self.address, self.tls.as_ref()).await
    }
}

pub async fn open(address: &str, tls: Option<&TlsOptions>) -> Result<Transport> {
    info!("Connecting to {} ({})", address, if tls.is_some() { "TLS" } else { "plain" });

    let tcp_stream = TcpStream::connect(address)
        .await
        .map_err(|e| TetherError::Connection(format!("Failed to connect to {}: {}", address, e)))?;

    tcp_stream
        .set_nodelay(true)
        .map_err(|e| TetherError::Connection(format!("Failed to set nodelay: {}", e)))?;

    let Some(options) = tls else {
        return Ok(Transport::new(tcp_stream, false, address));
    };

    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TetherError::Tls(format!("Invalid server name '{}': {}", host, e)))?;

    let connector = TlsConnector::from(Arc::new(client_config(options)?));
    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| TetherError::Tls(format!("TLS handshake failed: {}", e)))?;

    debug!("TLS handshake with {} complete", address);
    Ok(Transport::new(tls_stream, true, address))
}

fn client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let identity = match (&options.client_cert, &options.client_key) {
        (Some(cert), Some(key)) => match load_client_identity(cert, key) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Client certificate unusable, continuing without it: {}", e);
                None
            }
        },
        (Some(_), None) | (None, Some(_)) => {
            warn!("Client certificate and key must both be set, continuing without them");
            None
        }
        (None, None) => None,
    };

    if let Some((certs, key)) = identity {
        match permissive_builder(&provider)?.with_client_auth_cert(certs, key) {
            Ok(config) => return Ok(config),
            Err(e) => warn!("Client certificate rejected, continuing without it: {}", e),
        }
    }

    Ok(permissive_builder(&provider)?.with_no_client_auth())
}

/// Server certificates are not verified: self-hosted networks commonly run
/// self-signed or mismatched certificates.
fn permissive_builder(
    provider: &Arc<CryptoProvider>,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>> {
    Ok(ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TetherError::Tls(format!("Unsupported protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification {
            provider: provider.clone(),
        })))
}

fn load_client_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(TetherError::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| TetherError::Tls(format!("No private key found in {}", key_path.display())))?;

    Ok((certs, key))
}

#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use rustls::pki_types::PrivatePkcs8KeyDer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn self_signed_acceptor(names: &[&str]) -> TlsAcceptor {
        let names = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key.into())
        .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    /// Serves one TLS greeting with a self-signed certificate for `cert_names`
    /// and connects to it through `host`.
    async fn greet_over_tls(cert_names: &[&str], host: &str) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = self_signed_acceptor(cert_names);

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(socket).await.unwrap();
            stream.write_all(b"secure\r\n").await.unwrap();
            stream.flush().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ok\r\n");
        });

        let transport = open(&format!("{}:{}", host, port), Some(&TlsOptions::default()))
            .await
            .unwrap();
        assert!(transport.is_tls());

        let (mut reader, mut writer) = transport.into_split();
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secure\r\n");
        writer.write_all(b"ok\r\n").await.unwrap();
        writer.flush().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_accepts_self_signed_certificate() {
        greet_over_tls(&["localhost"], "localhost").await;
    }

    #[tokio::test]
    async fn test_tls_accepts_mismatched_server_name() {
        greet_over_tls(&["irc.example.org"], "127.0.0.1").await;
    }

    #[tokio::test]
    async fn test_open_plain_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello\r\n").await.unwrap();
        });

        let transport = open(&address, None).await.unwrap();
        assert!(!transport.is_tls());
        assert_eq!(transport.peer(), address);

        let (mut reader, _writer) = transport.into_split();
        let mut buf = vec![0u8; 7];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = open(&address, None).await;
        assert!(matches!(result, Err(TetherError::Connection(_))));
    }

    #[test]
    fn test_unreadable_client_cert_falls_back() {
        let options = TlsOptions {
            client_cert: Some(PathBuf::from("/nonexistent/cert.pem")),
            client_key: Some(PathBuf::from("/nonexistent/key.pem")),
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_garbage_client_cert_falls_back() {
        let mut cert = NamedTempFile::new().unwrap();
        cert.write_all(b"not a certificate").unwrap();
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(b"not a key").unwrap();

        let options = TlsOptions {
            client_cert: Some(cert.path().to_path_buf()),
            client_key: Some(key.path().to_path_buf()),
        };
        assert!(load_client_identity(cert.path(), key.path()).is_err());
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_from_config_respects_tls_toggle() {
        let mut server = ServerConfig::default();
        server.tls = false;
        let connector = TcpConnector::from_config(&server);
        assert!(connector.tls.is_none());

        server.tls = true;
        let connector = TcpConnector::from_config(&server);
        assert!(connector.tls.is_some());
    }
}
