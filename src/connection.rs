//! Connection controller
//!
//! Owns a committed connection end to end: dispatches events to the
//! registered callbacks, services send requests from `WebSocket` handles,
//! runs the keep-alive ping scheduler and finishes or aborts the closing
//! handshake. Every piece of per-connection state lives on one task, so no
//! locking guards the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, Interval};
use tracing::{debug, warn};

use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::protocol::{Message, Role};
use crate::stream::WebSocketStream;
use crate::{AutoPing, Config, PING_CORRELATION_LEN};

/// Callback invoked when the connection opens
pub type OnOpen = Arc<dyn Fn(&WebSocket) + Send + Sync>;
/// Callback invoked per delivered text message
pub type OnText = Arc<dyn Fn(&WebSocket, &str) + Send + Sync>;
/// Callback invoked per delivered binary message
pub type OnBinary = Arc<dyn Fn(&WebSocket, &Bytes) + Send + Sync>;
/// Callback invoked per inbound ping (the pong is answered automatically)
pub type OnPing = Arc<dyn Fn(&WebSocket, &Bytes) + Send + Sync>;
/// Callback invoked per inbound pong
pub type OnPong = Arc<dyn Fn(&WebSocket, &Bytes) + Send + Sync>;
/// Callback invoked when the peer initiates the closing handshake
pub type OnClosing = Arc<dyn Fn(Option<&CloseReason>) + Send + Sync>;
/// Callback invoked once the connection reaches its final state
pub type OnClosed = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked on connection-fatal errors
pub type OnError = Arc<dyn Fn(&Error) + Send + Sync>;

/// Event callbacks registered on an endpoint.
///
/// All callbacks run on the connection's task and must not block it.
#[derive(Clone, Default)]
pub struct EventHandlers {
    /// Connection committed
    pub on_open: Option<OnOpen>,
    /// Text message delivered
    pub on_text: Option<OnText>,
    /// Binary message delivered
    pub on_binary: Option<OnBinary>,
    /// Ping received
    pub on_ping: Option<OnPing>,
    /// Pong received
    pub on_pong: Option<OnPong>,
    /// Peer started the closing handshake
    pub on_closing: Option<OnClosing>,
    /// Connection closed
    pub on_closed: Option<OnClosed>,
    /// Fatal error surfaced
    pub on_error: Option<OnError>,
}

impl EventHandlers {
    fn error(&self, err: &Error) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }
}

enum Command {
    Frame {
        opcode: OpCode,
        payload: Bytes,
        fin: bool,
    },
    Message(Message),
    Ping,
    Pong(Bytes),
    Close {
        code: u16,
        reason: String,
    },
}

/// Handle to a live connection, usable from callbacks and other tasks.
///
/// Cheap to clone; all operations enqueue work onto the connection's task.
#[derive(Clone)]
pub struct WebSocket {
    cmd: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
}

impl WebSocket {
    fn check_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::WebSocketNotConnected);
        }
        Ok(())
    }

    fn enqueue(&self, cmd: Command) -> Result<()> {
        self.cmd.send(cmd).map_err(|_| Error::ChannelNotActive)
    }

    /// Send one frame with an explicit opcode and fin flag.
    ///
    /// Callers fragmenting by hand issue text/binary with `fin = false`
    /// followed by continuation frames in order.
    pub fn send(&self, payload: impl Into<Bytes>, opcode: OpCode, fin: bool) -> Result<()> {
        self.check_open()?;
        self.enqueue(Command::Frame {
            opcode,
            payload: payload.into(),
            fin,
        })
    }

    /// Send a whole text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.check_open()?;
        self.enqueue(Command::Message(Message::text(text)))
    }

    /// Send a whole binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.check_open()?;
        self.enqueue(Command::Message(Message::binary(data)))
    }

    /// Send a ping carrying a fresh correlation id.
    pub fn ping(&self) -> Result<()> {
        self.check_open()?;
        self.enqueue(Command::Ping)
    }

    /// Send an unsolicited pong.
    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.check_open()?;
        self.enqueue(Command::Pong(payload.into()))
    }

    /// Start the closing handshake.
    ///
    /// The reason must fit in the 123 bytes a close payload leaves after
    /// the status code; violations fail here and nothing is sent.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if reason.len() > CloseReason::MAX_REASON_LEN {
            return Err(Error::CloseReasonTooLong);
        }
        self.check_open()?;
        self.enqueue(Command::Close {
            code,
            reason: reason.to_string(),
        })
    }

    /// Bytes queued for the transport but not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Whether the connection still accepts sends.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Outstanding keep-alive pings keyed by correlation id.
///
/// Owned by the connection task; expirations surface through the earliest
/// deadline, matched pongs cancel their entry.
struct PingTracker {
    pending: HashMap<[u8; PING_CORRELATION_LEN], Instant>,
}

impl PingTracker {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    fn track(&mut self, id: [u8; PING_CORRELATION_LEN], deadline: Instant) {
        self.pending.insert(id, deadline);
    }

    /// Cancel the timer whose id matches a 36-byte pong payload.
    fn cancel(&mut self, pong_payload: &[u8]) -> bool {
        if pong_payload.len() != PING_CORRELATION_LEN {
            return false;
        }
        let mut id = [0u8; PING_CORRELATION_LEN];
        id.copy_from_slice(pong_payload);
        self.pending.remove(&id).is_some()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Generate a fresh ping correlation id.
fn new_correlation_id() -> [u8; PING_CORRELATION_LEN] {
    let mut id = [0u8; PING_CORRELATION_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Drive one committed connection until it closes.
///
/// Returns once the connection reached CLOSED; every outcome, clean or
/// not, has invoked `on_closed` by then.
pub(crate) async fn drive<S>(
    mut stream: WebSocketStream<S>,
    handlers: Arc<EventHandlers>,
    config: Config,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    let buffered = Arc::new(AtomicUsize::new(0));
    let handle = WebSocket {
        cmd: cmd_tx,
        open: Arc::clone(&open),
        buffered: Arc::clone(&buffered),
    };

    let role = stream.role();
    let mut tracker = PingTracker::new();
    let auto_ping = config.auto_ping;
    let mut ping_interval = auto_ping.as_ref().map(|ap| {
        tokio::time::interval_at(Instant::now() + ap.interval, ap.interval)
    });
    let mut local_close_sent = false;

    if let Some(cb) = &handlers.on_open {
        cb(&handle);
    }

    loop {
        let ping_deadline = tracker.next_deadline();

        tokio::select! {
            incoming = stream.next_message() => {
                match incoming {
                    Some(Ok(message)) => {
                        dispatch_message(
                            &handlers,
                            &handle,
                            &mut tracker,
                            &mut stream,
                            message,
                            local_close_sent,
                        )
                        .await;
                        if stream.is_closed() {
                            if role == Role::Server {
                                let _ = stream.shutdown().await;
                            }
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        handlers.error(&err);
                        teardown_on_error(&mut stream, &err).await;
                        break;
                    }
                    None => break,
                }
            }

            command = cmd_rx.recv() => {
                let Some(command) = command else { continue };
                if let Err(err) = apply_command(&mut stream, command, &mut tracker, &auto_ping, &mut local_close_sent).await {
                    match err {
                        Error::Io(_) | Error::ConnectionClosed => {
                            handlers.error(&err);
                            stream.protocol_mut().abort();
                            break;
                        }
                        err => handlers.error(&err),
                    }
                }
            }

            _ = next_tick(&mut ping_interval) => {
                let id = new_correlation_id();
                let payload = Bytes::copy_from_slice(&id);
                let queued = match stream.queue_message(&Message::Ping(payload)) {
                    Ok(()) => stream.flush().await,
                    Err(e) => Err(e),
                };
                match queued {
                    Ok(()) => {
                        if let Some(ap) = &auto_ping {
                            tracker.track(id, Instant::now() + ap.timeout);
                        }
                    }
                    Err(err) => {
                        handlers.error(&err);
                        stream.protocol_mut().abort();
                        break;
                    }
                }
            }

            _ = deadline_elapsed(ping_deadline) => {
                // No pong inside the window: close 1006 and tear down
                warn!("keep-alive pong overdue, closing");
                let err = Error::WebSocketTimeout;
                handlers.error(&err);
                let _ = stream.queue_close(CloseReason::ABNORMAL, "WebSocket timeout");
                let _ = stream.flush().await;
                stream.protocol_mut().abort();
                let _ = stream.shutdown().await;
                break;
            }
        }

        buffered.store(stream.buffered_amount(), Ordering::Release);
        if !stream.protocol_mut().is_open() {
            open.store(false, Ordering::Release);
        }
    }

    open.store(false, Ordering::Release);
    tracker.clear();
    debug!("connection finished");
    if let Some(cb) = &handlers.on_closed {
        cb();
    }
}

async fn dispatch_message<S>(
    handlers: &EventHandlers,
    handle: &WebSocket,
    tracker: &mut PingTracker,
    stream: &mut WebSocketStream<S>,
    message: Message,
    local_close_sent: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match message {
        Message::Text(payload) => {
            if let Some(cb) = &handlers.on_text {
                // Validated when the message was assembled
                let text = unsafe { std::str::from_utf8_unchecked(&payload) };
                cb(handle, text);
            }
        }
        Message::Binary(payload) => {
            if let Some(cb) = &handlers.on_binary {
                cb(handle, &payload);
            }
        }
        Message::Ping(payload) => {
            // The pong is already queued; push it out
            let _ = stream.flush().await;
            if let Some(cb) = &handlers.on_ping {
                cb(handle, &payload);
            }
        }
        Message::Pong(payload) => {
            if tracker.cancel(&payload) {
                debug!("keep-alive pong matched");
            }
            if let Some(cb) = &handlers.on_pong {
                cb(handle, &payload);
            }
        }
        Message::Close(reason) => {
            // Peer-initiated close only; the reply to our own close needs
            // no callback beyond on_closed
            if !local_close_sent {
                if let Some(cb) = &handlers.on_closing {
                    cb(reason.as_ref());
                }
            }
            // The echo was queued by the stream
            let _ = stream.flush().await;
        }
    }
}

async fn apply_command<S>(
    stream: &mut WebSocketStream<S>,
    command: Command,
    tracker: &mut PingTracker,
    auto_ping: &Option<AutoPing>,
    local_close_sent: &mut bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match command {
        Command::Frame {
            opcode,
            payload,
            fin,
        } => {
            stream.queue_frame(opcode, payload, fin)?;
        }
        Command::Message(msg) => {
            stream.queue_message(&msg)?;
        }
        Command::Ping => {
            let id = new_correlation_id();
            stream.queue_message(&Message::Ping(Bytes::copy_from_slice(&id)))?;
            if let Some(ap) = auto_ping {
                tracker.track(id, Instant::now() + ap.timeout);
            }
        }
        Command::Pong(payload) => {
            stream.queue_message(&Message::Pong(payload))?;
        }
        Command::Close { code, reason } => {
            stream.queue_close(code, &reason)?;
            *local_close_sent = true;
        }
    }
    stream.flush().await
}

async fn teardown_on_error<S>(stream: &mut WebSocketStream<S>, err: &Error)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Protocol violations get a close frame with the mapped code when the
    // state machine still allows one; transport loss skips the handshake.
    if !matches!(err, Error::Io(_) | Error::ConnectionClosed) {
        let _ = stream.queue_close(err.close_code(), "");
        let _ = stream.flush().await;
    }
    stream.protocol_mut().abort();
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn stream_pair(
        config: &Config,
    ) -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_parts(
            client_io,
            Protocol::new(Role::Client, config, Vec::new()).unwrap(),
            config,
            None,
        );
        let server = WebSocketStream::from_parts(
            server_io,
            Protocol::new(Role::Server, config, Vec::new()).unwrap(),
            config,
            None,
        );
        (client, server)
    }

    #[test]
    fn test_ping_tracker_correlation() {
        let mut tracker = PingTracker::new();
        let id = new_correlation_id();
        tracker.track(id, Instant::now() + Duration::from_secs(5));

        // Wrong length and wrong id do not cancel
        assert!(!tracker.cancel(b"short"));
        assert!(!tracker.cancel(&new_correlation_id()));
        assert!(tracker.next_deadline().is_some());

        assert!(tracker.cancel(&id));
        assert!(tracker.next_deadline().is_none());
    }

    #[test]
    fn test_ping_tracker_earliest_deadline() {
        let mut tracker = PingTracker::new();
        let near = Instant::now() + Duration::from_secs(1);
        let far = Instant::now() + Duration::from_secs(9);
        tracker.track(new_correlation_id(), far);
        tracker.track(new_correlation_id(), near);
        assert_eq!(tracker.next_deadline(), Some(near));
    }

    #[test]
    fn test_correlation_ids_are_36_bytes_and_random() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_eq!(a.len(), PING_CORRELATION_LEN);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_driver_dispatches_and_echoes() {
        let config = Config::default();
        let (mut client, server) = stream_pair(&config);

        let texts = Arc::new(AtomicU32::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let texts_cb = Arc::clone(&texts);
        let closed_cb = Arc::clone(&closed);
        let handlers = Arc::new(EventHandlers {
            on_text: Some(Arc::new(move |ws: &WebSocket, text: &str| {
                texts_cb.fetch_add(1, Ordering::SeqCst);
                ws.send_text(format!("echo:{}", text)).unwrap();
            })),
            on_closed: Some(Arc::new(move || {
                closed_cb.store(true, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        let driver = tokio::spawn(drive(server, handlers, config.clone()));

        client.send(Message::text("hi")).await.unwrap();
        let reply = client.next_message().await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("echo:hi"));

        client.queue_close(1000, "done").unwrap();
        client.flush().await.unwrap();
        // Server echoes the close and shuts the transport
        let close = client.next_message().await.unwrap().unwrap();
        assert!(matches!(close, Message::Close(Some(ref r)) if r.code == 1000));

        driver.await.unwrap();
        assert_eq!(texts.load(Ordering::SeqCst), 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_keepalive_timeout_closes_with_1006() {
        let mut config = Config::default();
        config.auto_ping = Some(AutoPing {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(40),
        });

        let (mut client, server) = stream_pair(&config);

        let errors: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors_cb = Arc::clone(&errors);
        let handlers = Arc::new(EventHandlers {
            on_error: Some(Arc::new(move |e: &Error| {
                errors_cb.lock().push(e.to_string());
            })),
            ..Default::default()
        });

        let driver = tokio::spawn(drive(server, handlers, config.clone()));

        // Swallow the ping without answering; the server must give up
        let msg = client.next_message().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Ping(ref p) if p.len() == PING_CORRELATION_LEN));

        driver.await.unwrap();
        let errors = errors.lock();
        assert!(errors.iter().any(|e| e.contains("timeout")), "{:?}", errors);
    }

    #[tokio::test]
    async fn test_keepalive_pong_cancels_timeout() {
        let mut config = Config::default();
        config.auto_ping = Some(AutoPing {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(60),
        });

        let (mut client, server) = stream_pair(&config);
        let handlers = Arc::new(EventHandlers::default());
        let driver = tokio::spawn(drive(server, handlers, config.clone()));

        // Answer three pings, then close cleanly
        for _ in 0..3 {
            let msg = client.next_message().await.unwrap().unwrap();
            match msg {
                // The stream queues the pong answer automatically
                Message::Ping(_) => client.flush().await.unwrap(),
                other => panic!("unexpected message {:?}", other),
            }
        }

        client.queue_close(1000, "").unwrap();
        client.flush().await.unwrap();
        // Pings may still be in flight ahead of the close echo
        loop {
            match client.next_message().await.unwrap().unwrap() {
                Message::Close(_) => break,
                _ => client.flush().await.unwrap(),
            }
        }
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_reason_too_long_fails_fast() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ws = WebSocket {
            cmd: tx,
            open: Arc::new(AtomicBool::new(true)),
            buffered: Arc::new(AtomicUsize::new(0)),
        };

        let reason = "r".repeat(124);
        assert!(matches!(
            ws.close(1000, &reason),
            Err(Error::CloseReasonTooLong)
        ));
        // Handle still usable for a valid close
        assert!(ws.close(1000, "ok").is_ok());
    }

    #[tokio::test]
    async fn test_send_rejected_when_not_open() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ws = WebSocket {
            cmd: tx,
            open: Arc::new(AtomicBool::new(false)),
            buffered: Arc::new(AtomicUsize::new(0)),
        };
        assert!(matches!(
            ws.send_text("nope"),
            Err(Error::WebSocketNotConnected)
        ));
    }
}
