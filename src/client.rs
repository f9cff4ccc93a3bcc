//! WebSocket client endpoint
//!
//! Dials `ws`/`wss` URLs, applies the socket options from the
//! configuration, runs the upgrade handshake and then drives the
//! connection, dispatching events to the registered callbacks. `connect`
//! resolves once the connection has closed.

use std::sync::Arc;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

use crate::connection::{
    drive, EventHandlers, OnBinary, OnClosed, OnClosing, OnError, OnOpen, OnPing, OnPong, OnText,
    WebSocket,
};
use crate::error::{Error, Result};
use crate::extension::{DeflateOptions, Extension};
use crate::handshake::client_handshake;
use crate::protocol::{Protocol, Role};
use crate::stream::WebSocketStream;
use crate::tls::{connect_tls, MaybeTlsStream, TlsConfig};
use crate::{Config, LeftoverBytes};

/// A parsed `ws`/`wss` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// TLS requested (`wss`)
    pub secure: bool,
    /// Host name or address
    pub host: String,
    /// Port, defaulted from the scheme when absent
    pub port: u16,
    /// Request target including query
    pub path: String,
}

impl WsUrl {
    /// Parse a WebSocket URL. Schemes `ws` (port 80) and `wss` (port 443)
    /// are accepted.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or(Error::InvalidUrl("missing scheme"))?;

        let secure = match scheme {
            "ws" => false,
            "wss" => true,
            _ => return Err(Error::InvalidUrl("scheme must be ws or wss")),
        };
        let default_port = if secure { 443 } else { 80 };

        let (host_port, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let (host, port) = match host_port.rfind(':') {
            Some(i) => {
                let port = host_port[i + 1..]
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidUrl("invalid port"))?;
                (&host_port[..i], port)
            }
            None => (host_port, default_port),
        };

        if host.is_empty() {
            return Err(Error::InvalidUrl("missing host"));
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Host header value, with the port when it differs from the default.
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Builder for [`WebSocketClient`]
pub struct WebSocketClientBuilder {
    config: Config,
    handlers: EventHandlers,
    deflate: Option<DeflateOptions>,
    protocol: Option<String>,
}

impl WebSocketClientBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
            handlers: EventHandlers::default(),
            deflate: None,
            protocol: None,
        }
    }

    /// Use the given configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Offer permessage-deflate with the given options.
    pub fn deflate(mut self, options: DeflateOptions) -> Self {
        self.deflate = Some(options);
        self
    }

    /// Request a subprotocol (echoed, not negotiated).
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Register the open callback.
    pub fn on_open(mut self, f: impl Fn(&WebSocket) + Send + Sync + 'static) -> Self {
        self.handlers.on_open = Some(Arc::new(f) as OnOpen);
        self
    }

    /// Register the text message callback.
    pub fn on_text(mut self, f: impl Fn(&WebSocket, &str) + Send + Sync + 'static) -> Self {
        self.handlers.on_text = Some(Arc::new(f) as OnText);
        self
    }

    /// Register the binary message callback.
    pub fn on_binary(
        mut self,
        f: impl Fn(&WebSocket, &bytes::Bytes) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.on_binary = Some(Arc::new(f) as OnBinary);
        self
    }

    /// Register the ping callback.
    pub fn on_ping(mut self, f: impl Fn(&WebSocket, &bytes::Bytes) + Send + Sync + 'static) -> Self {
        self.handlers.on_ping = Some(Arc::new(f) as OnPing);
        self
    }

    /// Register the pong callback.
    pub fn on_pong(mut self, f: impl Fn(&WebSocket, &bytes::Bytes) + Send + Sync + 'static) -> Self {
        self.handlers.on_pong = Some(Arc::new(f) as OnPong);
        self
    }

    /// Register the closing callback.
    pub fn on_closing(
        mut self,
        f: impl Fn(Option<&crate::error::CloseReason>) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.on_closing = Some(Arc::new(f) as OnClosing);
        self
    }

    /// Register the closed callback.
    pub fn on_closed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_closed = Some(Arc::new(f) as OnClosed);
        self
    }

    /// Register the error callback.
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.handlers.on_error = Some(Arc::new(f) as OnError);
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<WebSocketClient> {
        self.config.validate()?;
        if let Some(options) = &self.deflate {
            options.validate()?;
        }
        Ok(WebSocketClient {
            config: self.config,
            handlers: Arc::new(self.handlers),
            deflate: self.deflate,
            protocol: self.protocol,
        })
    }
}

/// Client-initiator endpoint
pub struct WebSocketClient {
    config: Config,
    handlers: Arc<EventHandlers>,
    deflate: Option<DeflateOptions>,
    protocol: Option<String>,
}

impl WebSocketClient {
    /// Start building a client.
    pub fn builder() -> WebSocketClientBuilder {
        WebSocketClientBuilder::new()
    }

    /// Connect to `url`, run the connection and resolve once it closed.
    ///
    /// `headers` are merged into the upgrade request without overwriting
    /// the upgrade machinery. The bootstrap (TCP connect, TLS and upgrade)
    /// is bounded by `connection_timeout`.
    pub async fn connect(&self, url: &str, headers: &[(String, String)]) -> Result<()> {
        let url = WsUrl::parse(url)?;

        let bootstrap = self.bootstrap(&url, headers);
        let (stream, outcome) = tokio::time::timeout(self.config.connection_timeout, bootstrap)
            .await
            .map_err(|_| Error::Timeout)??;

        let mut extensions: Vec<Box<dyn Extension>> = Vec::new();
        if let Some(negotiated) = &outcome.deflate {
            extensions.push(Box::new(crate::deflate::DeflateExtension::new(
                Role::Client,
                negotiated,
            )));
        }

        let leftover = match self.config.leftover_bytes {
            LeftoverBytes::Forward => outcome.leftover,
            LeftoverBytes::Drop => None,
        };

        let protocol = Protocol::new(Role::Client, &self.config, extensions)?;
        let ws = WebSocketStream::from_parts(stream, protocol, &self.config, leftover);

        debug!(host = %url.host, path = %url.path, "connection open");
        drive(ws, Arc::clone(&self.handlers), self.config.clone()).await;
        Ok(())
    }

    /// Dial, wrap in TLS when required, and upgrade.
    async fn bootstrap(
        &self,
        url: &WsUrl,
        headers: &[(String, String)],
    ) -> Result<(MaybeTlsStream<TcpStream>, crate::handshake::HandshakeOutcome)> {
        let tcp = self.open_tcp(&url.host, url.port).await?;

        let mut stream = if url.secure {
            let tls_config = match &self.config.tls {
                Some(TlsConfig::Client(config)) => Arc::clone(config),
                Some(TlsConfig::Server(_)) => {
                    return Err(Error::TlsInitializationFailed(
                        "client context required for wss".into(),
                    ));
                }
                None => crate::tls::default_client_config(),
            };
            let tls = connect_tls(tls_config, &url.host, tcp).await?;
            MaybeTlsStream::ClientTls(Box::new(tls))
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let outcome = client_handshake(
            &mut stream,
            &url.host_header(),
            &url.path,
            self.protocol.as_deref(),
            headers,
            self.deflate.as_ref(),
        )
        .await?;

        Ok((stream, outcome))
    }

    /// Open and tune the TCP connection per the configuration.
    async fn open_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or(Error::InvalidUrl("host resolved to no addresses"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if self.config.socket_reuse_address {
            socket.set_reuseaddr(true)?;
        }
        if let Some(size) = self.config.tcp_send_buffer_size {
            socket.set_send_buffer_size(size as u32)?;
        }
        if let Some(size) = self.config.tcp_receive_buffer_size {
            socket.set_recv_buffer_size(size as u32)?;
        }

        if let Some(device) = &self.config.device {
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            socket
                .bind_device(Some(device.as_bytes()))
                .map_err(|_| Error::InvalidDevice(device.clone()))?;

            #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
            return Err(Error::InvalidDevice(device.clone()));
        }

        let stream = socket.connect(addr).await?;
        stream.set_nodelay(self.config.tcp_nodelay)?;
        Ok(stream)
    }
}
