//! WebSocket stream over an async transport
//!
//! `WebSocketStream` wraps an upgraded byte stream and speaks frames. It
//! implements `Stream<Item = Result<Message>>` for receiving and
//! `Sink<Message>` for sending, answers pings and close frames
//! automatically, and tracks write-buffer watermarks for back-pressure.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_core::Stream;
use futures_sink::Sink;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::protocol::{Message, Protocol};
use crate::{Config, RECV_BUFFER_SIZE};

pin_project! {
    /// A WebSocket connection over an async byte transport
    pub struct WebSocketStream<S> {
        #[pin]
        inner: S,
        protocol: Protocol,
        read_buf: BytesMut,
        write_buf: BytesMut,
        pending: VecDeque<Message>,
        // EOF observed or connection torn down
        terminated: bool,
        high_watermark: usize,
        low_watermark: usize,
    }
}

impl<S> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an upgraded transport.
    ///
    /// `leftover` carries bytes the transport received after the HTTP head;
    /// pass `None` when the leftover strategy is to drop them.
    pub fn from_parts(
        inner: S,
        protocol: Protocol,
        config: &Config,
        leftover: Option<Bytes>,
    ) -> Self {
        let mut read_buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        if let Some(bytes) = leftover {
            read_buf.extend_from_slice(&bytes);
        }

        Self {
            inner,
            protocol,
            read_buf,
            write_buf: BytesMut::with_capacity(config.write_buffer_high_watermark.min(64 * 1024)),
            pending: VecDeque::new(),
            terminated: false,
            high_watermark: config.write_buffer_high_watermark,
            low_watermark: config.write_buffer_low_watermark,
        }
    }

    /// Bytes queued for the transport but not yet written.
    #[inline]
    pub fn buffered_amount(&self) -> usize {
        self.write_buf.len()
    }

    /// Whether the write buffer sits above the high watermark.
    #[inline]
    pub fn is_backpressured(&self) -> bool {
        self.write_buf.len() > self.high_watermark
    }

    /// Whether the connection is closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.terminated || self.protocol.is_closed()
    }

    /// Access the protocol state machine.
    pub(crate) fn protocol_mut(&mut self) -> &mut Protocol {
        &mut self.protocol
    }

    /// The endpoint role of this connection.
    pub fn role(&self) -> crate::protocol::Role {
        self.protocol.role()
    }

    /// Queue a whole message without flushing.
    pub fn queue_message(&mut self, msg: &Message) -> Result<()> {
        self.protocol.encode_message(msg, &mut self.write_buf)
    }

    /// Queue a single data frame without flushing (manual fragmentation).
    pub fn queue_frame(&mut self, opcode: OpCode, payload: Bytes, fin: bool) -> Result<()> {
        self.protocol
            .encode_data_frame(opcode, payload, fin, &mut self.write_buf)
    }

    /// Queue a close frame without flushing.
    pub fn queue_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.protocol.encode_close(code, reason, &mut self.write_buf)
    }

    /// Read into the spare capacity of the read buffer.
    fn poll_read_more(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let this = self.project();

        if this.read_buf.capacity() - this.read_buf.len() < 4096 {
            this.read_buf.reserve(8192);
        }

        let len = this.read_buf.len();
        let cap = this.read_buf.capacity();
        // SAFETY: the length is restored to the initialised prefix on every
        // branch below; only bytes the read filled are kept.
        unsafe {
            this.read_buf.set_len(cap);
        }
        let mut read_buf = ReadBuf::new(&mut this.read_buf[len..]);

        match this.inner.poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                unsafe {
                    this.read_buf.set_len(len + n);
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                unsafe {
                    this.read_buf.set_len(len);
                }
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                unsafe {
                    this.read_buf.set_len(len);
                }
                Poll::Pending
            }
        }
    }

    /// Drain the write buffer into the transport.
    fn poll_flush_buffer(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut this = self.project();

        while !this.write_buf.is_empty() {
            match this.inner.as_mut().poll_write(cx, this.write_buf.as_ref()) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(Error::ConnectionClosed)),
                Poll::Ready(Ok(n)) => this.write_buf.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.inner.poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Poll for the next message, answering control frames as a side
    /// effect.
    pub fn poll_next_message(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Message>>> {
        loop {
            if self.terminated {
                return Poll::Ready(None);
            }

            if let Some(msg) = self.as_mut().get_mut().pending.pop_front() {
                let this = self.as_mut().get_mut();
                match &msg {
                    Message::Ping(payload) => {
                        let payload = payload.clone();
                        // Answered automatically; the encode only fails once
                        // the connection is closed
                        let _ = this.protocol.encode_pong(&payload, &mut this.write_buf);
                    }
                    Message::Close(_) => {
                        if this.protocol.is_closing() {
                            let _ = this.protocol.encode_close_echo(&mut this.write_buf);
                        }
                        if this.protocol.is_closed() {
                            this.terminated = true;
                        }
                    }
                    _ => {}
                }

                // Push queued control answers toward the peer; back-pressure
                // here is resolved on the next flush
                let _ = self.as_mut().poll_flush_buffer(cx);
                return Poll::Ready(Some(Ok(msg)));
            }

            match self.as_mut().poll_read_more(cx) {
                Poll::Ready(Ok(0)) => {
                    let this = self.as_mut().get_mut();
                    this.terminated = true;
                    if this.protocol.is_closed() {
                        return Poll::Ready(None);
                    }
                    // Transport loss without a closing handshake
                    this.protocol.abort();
                    return Poll::Ready(Some(Err(Error::ConnectionClosed)));
                }
                Poll::Ready(Ok(_)) => {
                    let this = self.as_mut().get_mut();
                    let mut messages = Vec::new();
                    let result = this.protocol.process_into(&mut this.read_buf, &mut messages);
                    this.pending.extend(messages);
                    if let Err(e) = result {
                        this.terminated = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                }
                Poll::Ready(Err(e)) => {
                    let this = self.as_mut().get_mut();
                    this.terminated = true;
                    this.protocol.abort();
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Receive the next message.
    pub async fn next_message(&mut self) -> Option<Result<Message>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_next_message(cx)).await
    }

    /// Flush all queued bytes to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        poll_fn(|cx| Pin::new(&mut *self).poll_flush_buffer(cx)).await
    }

    /// Send a whole message and flush.
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.queue_message(&msg)?;
        self.flush().await
    }

    /// Shut down the transport after draining queued bytes.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        poll_fn(|cx| Pin::new(&mut self.inner).poll_shutdown(cx)).await?;
        self.terminated = true;
        Ok(())
    }
}

impl<S> Stream for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_next_message(cx)
    }
}

impl<S> Sink<Message> for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.terminated {
            return Poll::Ready(Err(Error::WebSocketNotConnected));
        }
        // Above the high watermark writes pause until the buffer drains to
        // the low watermark
        if self.write_buf.len() > self.high_watermark {
            match self.as_mut().poll_flush_buffer(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending if self.write_buf.len() <= self.low_watermark => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<()> {
        let this = self.get_mut();
        this.queue_message(&item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.poll_flush_buffer(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.protocol.is_open() {
            let this = self.as_mut().get_mut();
            let _ = this.protocol.encode_close(CloseReason::NORMAL, "", &mut this.write_buf);
        }

        match self.as_mut().poll_flush_buffer(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                this.terminated = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;

    fn pair(config: &Config) -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let client_protocol = Protocol::new(Role::Client, config, Vec::new()).unwrap();
        let server_protocol = Protocol::new(Role::Server, config, Vec::new()).unwrap();
        (
            WebSocketStream::from_parts(client_io, client_protocol, config, None),
            WebSocketStream::from_parts(server_io, server_protocol, config, None),
        )
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let config = Config::default();
        let (mut client, mut server) = pair(&config);

        client.send(Message::text("hello")).await.unwrap();
        let msg = server.next_message().await.unwrap().unwrap();
        assert_eq!(msg.as_text(), Some("hello"));

        server.send(Message::binary(&b"pong"[..])).await.unwrap();
        let msg = client.next_message().await.unwrap().unwrap();
        assert_eq!(msg.as_bytes(), b"pong");
    }

    #[tokio::test]
    async fn test_ping_answered_automatically() {
        let config = Config::default();
        let (mut client, mut server) = pair(&config);

        client
            .send(Message::Ping(Bytes::from_static(b"probe")))
            .await
            .unwrap();

        // Server surfaces the ping and queues the pong
        let msg = server.next_message().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Ping(ref p) if p.as_ref() == b"probe"));
        server.flush().await.unwrap();

        let msg = client.next_message().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Pong(ref p) if p.as_ref() == b"probe"));
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let config = Config::default();
        let (mut client, mut server) = pair(&config);

        client.queue_close(1000, "bye").unwrap();
        client.flush().await.unwrap();

        // Server sees the close and echoes it
        let msg = server.next_message().await.unwrap().unwrap();
        assert!(matches!(
            msg,
            Message::Close(Some(ref r)) if r.code == 1000 && r.reason == "bye"
        ));
        server.flush().await.unwrap();
        assert!(server.is_closed());

        let msg = client.next_message().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Close(Some(ref r)) if r.code == 1000));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_buffered_amount() {
        let config = Config::default();
        let (mut client, _server) = pair(&config);

        assert_eq!(client.buffered_amount(), 0);
        client.queue_message(&Message::text("hello")).unwrap();
        // 2-byte header + 4-byte mask + 5-byte payload
        assert_eq!(client.buffered_amount(), 11);
        client.flush().await.unwrap();
        assert_eq!(client.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_manual_fragmentation() {
        let config = Config::default();
        let (mut client, mut server) = pair(&config);

        client
            .queue_frame(OpCode::Binary, Bytes::from_static(b"abc"), false)
            .unwrap();
        client
            .queue_frame(OpCode::Continuation, Bytes::from_static(b"def"), true)
            .unwrap();
        client.flush().await.unwrap();

        let msg = server.next_message().await.unwrap().unwrap();
        assert_eq!(msg.as_bytes(), b"abcdef");
    }

    #[tokio::test]
    async fn test_transport_loss_reported() {
        let config = Config::default();
        let (client, mut server) = pair(&config);

        drop(client);
        let result = server.next_message().await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(server.is_closed());
    }
}
