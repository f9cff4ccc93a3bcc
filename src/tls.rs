//! TLS configuration and transport wrapping
//!
//! Builds rustls contexts for `wss` endpoints and wraps the TCP stream so
//! the rest of the crate stays generic over plain and TLS transports.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// TLS context for one side of a connection
#[derive(Clone)]
pub enum TlsConfig {
    /// Client context used when dialing `wss` URLs
    Client(Arc<rustls::ClientConfig>),
    /// Server context used when terminating `wss` listeners
    Server(Arc<rustls::ServerConfig>),
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfig::Client(_) => f.write_str("TlsConfig::Client"),
            TlsConfig::Server(_) => f.write_str("TlsConfig::Server"),
        }
    }
}

/// Client configuration trusting the bundled web PKI roots.
pub fn default_client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

impl TlsConfig {
    /// Client context trusting the bundled web PKI roots.
    pub fn client_default() -> Self {
        TlsConfig::Client(default_client_config())
    }

    /// Client context from a prepared rustls configuration.
    pub fn client(config: Arc<rustls::ClientConfig>) -> Self {
        TlsConfig::Client(config)
    }

    /// Server context from a prepared rustls configuration.
    pub fn server(config: Arc<rustls::ServerConfig>) -> Self {
        TlsConfig::Server(config)
    }

    /// Server context from PEM-encoded certificate chain and private key
    /// files.
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsInitializationFailed(e.to_string()))?;

        Ok(TlsConfig::Server(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::TlsInitializationFailed(format!("certificate file: {}", e)))?;
    let certs: io::Result<Vec<CertificateDer<'static>>> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| Error::TlsInitializationFailed(format!("certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::TlsInitializationFailed(
            "no certificates in PEM file".into(),
        ));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::TlsInitializationFailed(format!("key file: {}", e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInitializationFailed(format!("private key: {}", e)))?
        .ok_or_else(|| Error::TlsInitializationFailed("no private key in PEM file".into()))
}

/// Wrap a dialed stream in client TLS.
pub async fn connect_tls<S>(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::InvalidUrl("host is not a valid TLS server name"))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::TlsInitializationFailed(e.to_string()))
}

/// Terminate TLS on an accepted stream.
pub async fn accept_tls<S>(
    config: Arc<rustls::ServerConfig>,
    stream: S,
) -> Result<tokio_rustls::server::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    TlsAcceptor::from(config)
        .accept(stream)
        .await
        .map_err(|e| Error::TlsInitializationFailed(e.to_string()))
}

/// A transport that is either plain TCP or TLS-wrapped
pub enum MaybeTlsStream<S> {
    /// No TLS
    Plain(S),
    /// Client-side TLS session
    ClientTls(Box<tokio_rustls::client::TlsStream<S>>),
    /// Server-side TLS session
    ServerTls(Box<tokio_rustls::server::TlsStream<S>>),
}

impl<S> AsyncRead for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            MaybeTlsStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for MaybeTlsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            MaybeTlsStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            MaybeTlsStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            MaybeTlsStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
