//! # rift-ws: event-driven WebSocket endpoints
//!
//! An RFC 6455 WebSocket library with both client-initiator and
//! server-acceptor roles sharing a single frame-processing core, plus the
//! permessage-deflate extension (RFC 7692) with full parameter
//! negotiation.
//!
//! Applications embed the library by registering event callbacks and
//! letting the endpoint drive I/O:
//!
//! ```ignore
//! use rift_ws::{WebSocketServer, Config};
//!
//! let server = WebSocketServer::builder()
//!     .config(Config::default())
//!     .on_text(|ws, text| {
//!         ws.send_text(text).ok();
//!     })
//!     .build()?;
//! server.listen("0.0.0.0", 8080).await?;
//! ```
//!
//! The lower layers are usable on their own: [`WebSocketStream`] speaks
//! frames over any `AsyncRead + AsyncWrite` transport and implements
//! `Stream`/`Sink`, while [`protocol::Protocol`] is the synchronous state
//! machine underneath.

pub mod client;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod tls;
pub mod utf8;

use std::time::Duration;

pub use client::{WebSocketClient, WebSocketClientBuilder, WsUrl};
pub use connection::{EventHandlers, WebSocket};
pub use error::{CloseReason, Error, Result};
pub use extension::DeflateOptions;
pub use frame::{Frame, OpCode};
pub use protocol::{Message, Role};
pub use server::{WebSocketServer, WebSocketServerBuilder};
pub use stream::WebSocketStream;
pub use tls::TlsConfig;

/// WebSocket GUID for the accept-key computation
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload that fits the 7-bit length form
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit length form
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Maximum frame header size (2 + 8 + 4 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Read buffer size for the transport
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Length of the correlation id carried by auto-generated pings
pub const PING_CORRELATION_LEN: usize = 36;

/// Keep-alive ping settings
#[derive(Debug, Clone)]
pub struct AutoPing {
    /// Delay between pings
    pub interval: Duration,
    /// Window after each ping in which the matching pong must arrive
    pub timeout: Duration,
}

/// What to do with bytes the transport delivered after the upgrade head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeftoverBytes {
    /// Feed them into the frame decoder
    #[default]
    Forward,
    /// Discard them
    Drop,
}

/// Configuration for WebSocket endpoints
///
/// # Example
///
/// ```
/// use rift_ws::Config;
/// use std::time::Duration;
///
/// let config = Config::builder()
///     .max_frame_size(64 * 1024)
///     .auto_ping(Duration::from_secs(30), Duration::from_secs(10))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload length of a single frame (default: 16 KiB)
    pub max_frame_size: usize,
    /// Minimum payload length of a non-final fragment (default: 0)
    pub min_non_final_fragment_size: usize,
    /// Maximum number of frames in one fragmented message (default: unbounded)
    pub max_accumulated_frame_count: usize,
    /// Maximum accumulated payload of one fragmented message (default: unbounded)
    pub max_accumulated_frame_size: usize,
    /// Write buffer level at which writes resume (default: 32 KiB)
    pub write_buffer_low_watermark: usize,
    /// Write buffer level at which writes pause (default: 64 KiB)
    pub write_buffer_high_watermark: usize,
    /// Bound on connect + TLS + upgrade (default: 10 s)
    pub connection_timeout: Duration,
    /// Keep-alive ping settings (default: disabled)
    pub auto_ping: Option<AutoPing>,
    /// Strategy for bytes received after the upgrade head (default: forward)
    pub leftover_bytes: LeftoverBytes,
    /// TLS context for `wss` endpoints (default: none; clients fall back to
    /// the web PKI roots)
    pub tls: Option<TlsConfig>,
    /// Network device to bind sockets to (default: none)
    pub device: Option<String>,
    /// SO_SNDBUF for created sockets (default: system)
    pub tcp_send_buffer_size: Option<usize>,
    /// SO_RCVBUF for created sockets (default: system)
    pub tcp_receive_buffer_size: Option<usize>,
    /// SO_REUSEADDR on created sockets (default: false)
    pub socket_reuse_address: bool,
    /// TCP_NODELAY on created sockets (default: true)
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024,
            min_non_final_fragment_size: 0,
            max_accumulated_frame_count: usize::MAX,
            max_accumulated_frame_size: usize::MAX,
            write_buffer_low_watermark: 32 * 1024,
            write_buffer_high_watermark: 64 * 1024,
            connection_timeout: Duration::from_secs(10),
            auto_ping: None,
            leftover_bytes: LeftoverBytes::Forward,
            tls: None,
            device: None,
            tcp_send_buffer_size: None,
            tcp_receive_buffer_size: None,
            socket_reuse_address: false,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Create a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check the bounds this configuration must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be nonzero"));
        }
        if self.write_buffer_low_watermark > self.write_buffer_high_watermark {
            return Err(Error::Config(
                "write_buffer_low_watermark must not exceed the high watermark",
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::Config("connection_timeout must be nonzero"));
        }
        if let Some(auto_ping) = &self.auto_ping {
            if auto_ping.interval.is_zero() || auto_ping.timeout.is_zero() {
                return Err(Error::Config("auto_ping interval and timeout must be nonzero"));
            }
        }
        Ok(())
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the maximum frame payload length.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the minimum non-final fragment payload length.
    pub fn min_non_final_fragment_size(mut self, size: usize) -> Self {
        self.config.min_non_final_fragment_size = size;
        self
    }

    /// Bound the number of frames in one fragmented message.
    pub fn max_accumulated_frame_count(mut self, count: usize) -> Self {
        self.config.max_accumulated_frame_count = count;
        self
    }

    /// Bound the accumulated payload of one fragmented message.
    pub fn max_accumulated_frame_size(mut self, size: usize) -> Self {
        self.config.max_accumulated_frame_size = size;
        self
    }

    /// Set the write-buffer watermarks.
    pub fn write_buffer_watermarks(mut self, low: usize, high: usize) -> Self {
        self.config.write_buffer_low_watermark = low;
        self.config.write_buffer_high_watermark = high;
        self
    }

    /// Bound the connect/upgrade bootstrap.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Enable keep-alive pings.
    pub fn auto_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.auto_ping = Some(AutoPing { interval, timeout });
        self
    }

    /// Choose what happens to bytes received after the upgrade head.
    pub fn leftover_bytes(mut self, strategy: LeftoverBytes) -> Self {
        self.config.leftover_bytes = strategy;
        self
    }

    /// Install a TLS context.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Bind sockets to a network device.
    pub fn device(mut self, name: impl Into<String>) -> Self {
        self.config.device = Some(name.into());
        self
    }

    /// Set SO_SNDBUF for created sockets.
    pub fn tcp_send_buffer_size(mut self, size: usize) -> Self {
        self.config.tcp_send_buffer_size = Some(size);
        self
    }

    /// Set SO_RCVBUF for created sockets.
    pub fn tcp_receive_buffer_size(mut self, size: usize) -> Self {
        self.config.tcp_receive_buffer_size = Some(size);
        self
    }

    /// Set SO_REUSEADDR on created sockets.
    pub fn socket_reuse_address(mut self, enabled: bool) -> Self {
        self.config.socket_reuse_address = enabled;
        self
    }

    /// Set TCP_NODELAY on created sockets.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::WebSocketClient;
    pub use crate::connection::WebSocket;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::extension::DeflateOptions;
    pub use crate::frame::{Frame, OpCode};
    pub use crate::protocol::{Message, Role};
    pub use crate::server::WebSocketServer;
    pub use crate::stream::WebSocketStream;
    pub use crate::Config;
}
