//! Error types for the WebSocket library

use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// Connection closed by the peer or the transport
    #[error("connection closed")]
    ConnectionClosed,
    /// Handshake failed before the connection was committed
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    /// The server did not answer 101 Switching Protocols
    #[error("server did not upgrade the connection")]
    NotUpgraded,
    /// An upgrade was attempted with a method other than GET
    #[error("method not allowed")]
    MethodNotAllowed,
    /// The connect URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(&'static str),
    /// The configured network device could not be bound
    #[error("invalid device: {0}")]
    InvalidDevice(String),
    /// TLS context construction or the TLS handshake failed
    #[error("TLS initialization failed: {0}")]
    TlsInitializationFailed(String),
    /// The bootstrap (connect/upgrade) timed out
    #[error("operation timed out")]
    Timeout,
    /// A keep-alive ping went unanswered
    #[error("WebSocket timeout")]
    WebSocketTimeout,
    /// An operation was attempted while the connection is not open
    #[error("WebSocket is not connected")]
    WebSocketNotConnected,
    /// The underlying channel is no longer active
    #[error("channel is not active")]
    ChannelNotActive,

    /// Generic framing violation
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// An opcode outside the ranges defined by RFC 6455
    #[error("unknown opcode: {0:#x}")]
    UnknownOpCode(u8),
    /// A control frame arrived with the fin bit clear
    #[error("control frames must not be fragmented")]
    ControlFrameShouldNotBeFragmented,
    /// A frame or message exceeded the configured maximum size
    #[error("message exceeds the configured size limit")]
    MessageTooLarge,
    /// A data frame arrived while a fragmented message was still open
    #[error("received a new data frame before the previous message completed")]
    ReceivedNewFrameWithoutFinishingPreviousOne,
    /// A continuation frame arrived with no fragmented message in progress
    #[error("received a continuation frame without a previous fragment frame")]
    ReceivedContinuationFrameWithoutPreviousFragmentFrame,
    /// A non-final fragment was smaller than the configured minimum
    #[error("non-final fragment is below the configured minimum size")]
    NonFinalFragmentSizeIsTooSmall,
    /// A fragmented message used more frames than allowed
    #[error("too many frame fragments")]
    TooManyFrameFragments,
    /// A fragmented message grew past the configured accumulated size
    #[error("accumulated frame size is too large")]
    AccumulatedFrameSizeIsTooLarge,
    /// Reserved bits were set without a matching negotiated extension
    #[error("invalid reserved bits")]
    InvalidReservedBits,
    /// A text message or close reason was not well-formed UTF-8
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    /// A close frame carried a code outside the allowed ranges
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// A locally requested close reason exceeded 123 bytes
    #[error("close reason too long")]
    CloseReasonTooLong,

    /// An extension offer repeated a parameter
    #[error("duplicate extension parameter: {0}")]
    DuplicateParameter(String),
    /// An extension parameter carried an out-of-range or malformed value
    #[error("invalid extension parameter value: {0}")]
    InvalidParameterValue(String),
    /// An extension offer carried a parameter this library does not know
    #[error("unknown extension parameter: {0}")]
    UnknownExtensionParameter(String),
    /// The server's extension response violated the client's offer
    #[error("invalid extension response from server")]
    InvalidServerResponse,
    /// Two negotiated extensions claimed the same reserved bit
    #[error("extensions claim conflicting reserved bits")]
    IncompatibleExtensions,
    /// Decompression output exceeded the configured limit
    #[error("decompressed size exceeds the configured limit")]
    LimitExceeded,
    /// DEFLATE stream error
    #[error("compression error: {0}")]
    Compression(String),

    /// Configuration rejected at construction time
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl Error {
    /// Close code this error maps to when it tears down an open connection.
    pub(crate) fn close_code(&self) -> u16 {
        match self {
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge
            | Error::AccumulatedFrameSizeIsTooLarge
            | Error::LimitExceeded => CloseReason::TOO_BIG,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }
}

/// Close frame code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g. server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received (never on the wire)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (never on the wire)
    pub const ABNORMAL: u16 = 1006;
    /// Payload inconsistent with message type
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Maximum close reason length in UTF-8 bytes (2-byte code + reason ≤ 125)
    pub const MAX_REASON_LEN: usize = 123;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check whether a close code may appear on the wire
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    /// Rewrite codes that are meaningful locally but forbidden on the wire.
    ///
    /// 1005 and 1006 are reporting codes only; a local request to close with
    /// either is sent as 1000.
    pub fn wire_code(code: u16) -> u16 {
        match code {
            Self::NO_STATUS | Self::ABNORMAL => Self::NORMAL,
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
