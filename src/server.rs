//! WebSocket server endpoint
//!
//! Binds a listener with the configured socket options, upgrades inbound
//! connections through the acceptance predicate, and drives each committed
//! connection on its own task. Shutdown is idempotent and cancels the
//! accept loop plus every live connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{
    drive, EventHandlers, OnBinary, OnClosed, OnClosing, OnError, OnOpen, OnPing, OnPong, OnText,
    WebSocket,
};
use crate::error::{Error, Result};
use crate::extension::{DeflateOptions, Extension};
use crate::handshake::{server_handshake, AcceptAction, UpgradeRequest};
use crate::protocol::{Protocol, Role};
use crate::stream::WebSocketStream;
use crate::tls::{accept_tls, MaybeTlsStream, TlsConfig};
use crate::{Config, LeftoverBytes};

/// Predicate deciding whether to accept an upgrade request
pub type AcceptPredicate = Arc<dyn Fn(&UpgradeRequest<'_>) -> AcceptAction + Send + Sync>;

/// Builder for [`WebSocketServer`]
pub struct WebSocketServerBuilder {
    config: Config,
    handlers: EventHandlers,
    deflate: Option<DeflateOptions>,
    accept: Option<AcceptPredicate>,
}

impl WebSocketServerBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
            handlers: EventHandlers::default(),
            deflate: None,
            accept: None,
        }
    }

    /// Use the given configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Enable permessage-deflate negotiation with the given options.
    pub fn deflate(mut self, options: DeflateOptions) -> Self {
        self.deflate = Some(options);
        self
    }

    /// Install the upgrade acceptance predicate. Without one, every
    /// well-formed upgrade is accepted.
    pub fn accept_with(
        mut self,
        f: impl Fn(&UpgradeRequest<'_>) -> AcceptAction + Send + Sync + 'static,
    ) -> Self {
        self.accept = Some(Arc::new(f));
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

    /// Validate the configuration and build the server.
    pub fn build(self) -> Result<WebSocketServer> {
        self.config.validate()?;
        if let Some(options) = &self.deflate {
            options.validate()?;
        }
        Ok(WebSocketServer {
            config: self.config,
            handlers: Arc::new(self.handlers),
            deflate: self.deflate,
            accept: self.accept,
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            connections: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// Server-acceptor endpoint
#[derive(Clone)]
pub struct WebSocketServer {
    config: Config,
    handlers: Arc<EventHandlers>,
    deflate: Option<DeflateOptions>,
    accept: Option<AcceptPredicate>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WebSocketServer {
    /// Start building a server.
    pub fn builder() -> WebSocketServerBuilder {
        WebSocketServerBuilder::new()
    }

    /// Bind a listener with the configured socket options.
    pub async fn bind(&self, host: &str, port: u16) -> Result<TcpListener> {
        let addr: SocketAddr = lookup_host((host, port))
            .await?
            .next()
            .ok_or(Error::InvalidUrl("host resolved to no addresses"))?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;

        if self.config.socket_reuse_address {
            socket.set_reuse_address(true)?;
        }
        if let Some(size) = self.config.tcp_send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.tcp_receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        if let Some(device) = &self.config.device {
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            socket
                .bind_device(Some(device.as_bytes()))
                .map_err(|_| Error::InvalidDevice(device.clone()))?;

            #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
            return Err(Error::InvalidDevice(device.clone()));
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!(%addr, "listening");
        Ok(listener)
    }

    /// Bind and serve. Resolves once the server is shut down.
    pub async fn listen(&self, host: &str, port: u16) -> Result<()> {
        let listener = self.bind(host, port).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                _ = self.notify.notified() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    stream.set_nodelay(self.config.tcp_nodelay).ok();
                    debug!(%peer, "connection accepted");

                    let server = self.clone();
                    let handle = tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });

                    let mut connections = self.connections.lock();
                    connections.retain(|h| !h.is_finished());
                    connections.push(handle);
                }
            }
        }

        // Tear down live connections; their ping timers die with the tasks
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
        info!("server stopped");
        Ok(())
    }

    /// Request shutdown. Idempotent: the first call wins, later calls are
    /// no-ops.
    pub fn shutdown(&self) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Upgrade and drive one accepted connection.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut stream = match &self.config.tls {
            Some(TlsConfig::Server(tls)) => {
                match accept_tls(Arc::clone(tls), stream).await {
                    Ok(tls_stream) => MaybeTlsStream::ServerTls(Box::new(tls_stream)),
                    Err(e) => {
                        warn!(%peer, error = %e, "TLS accept failed");
                        return;
                    }
                }
            }
            Some(TlsConfig::Client(_)) | None => MaybeTlsStream::Plain(stream),
        };

        let accept = self.accept.clone();
        let upgrade = server_handshake(&mut stream, self.deflate.as_ref(), move |req| {
            match &accept {
                Some(predicate) => predicate(req),
                None => AcceptAction::Accept(Vec::new()),
            }
        });

        let outcome = match tokio::time::timeout(self.config.connection_timeout, upgrade).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "upgrade failed");
                return;
            }
            Err(_) => {
                debug!(%peer, "upgrade timed out");
                return;
            }
        };

        let mut extensions: Vec<Box<dyn Extension>> = Vec::new();
        if let Some(negotiated) = &outcome.deflate {
            extensions.push(Box::new(crate::deflate::DeflateExtension::new(
                Role::Server,
                negotiated,
            )));
        }

        let leftover = match self.config.leftover_bytes {
            LeftoverBytes::Forward => outcome.leftover,
            LeftoverBytes::Drop => None,
        };

        let protocol = match Protocol::new(Role::Server, &self.config, extensions) {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(%peer, error = %e, "protocol setup failed");
                return;
            }
        };

        let ws = WebSocketStream::from_parts(stream, protocol, &self.config, leftover);
        drive(ws, Arc::clone(&self.handlers), self.config.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let server = WebSocketServer::builder().build().unwrap();
        assert!(!server.is_shutdown());
        server.shutdown();
        assert!(server.is_shutdown());
        // Second call must be a harmless no-op
        server.shutdown();
        assert!(server.is_shutdown());
    }

    #[test]
    fn test_builder_validates() {
        let bad = Config {
            write_buffer_low_watermark: 1024,
            write_buffer_high_watermark: 512,
            ..Config::default()
        };
        assert!(WebSocketServer::builder().config(bad).build().is_err());
        assert!(WebSocketServer::builder().build().is_ok());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = WebSocketServer::builder().build().unwrap();
        let listener = server.bind("127.0.0.1", 0).await.unwrap();

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        server.shutdown();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = WebSocketServer::builder().build().unwrap();
        let listener = server.bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
