//! Per-connection stream wrapper and I/O task
//!
//! Every admitted socket is owned by one task. The task drives the TLS
//! handshake when there is one, then settles into a readiness loop:
//! outbound chunks arrive on a queue from the broker, inbound bytes are
//! forwarded to the broker as events. All socket I/O is non-blocking;
//! a would-block parks the task on the matching readiness future.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::registry::ConnId;
use crate::server::broker::Event;
use crate::tls::{HandshakeStatus, TlsChannel};

/// A peer socket, plaintext or TLS
///
/// TLS sessions are driven in place: reads pull ciphertext off the socket
/// and hand back plaintext, writes buffer plaintext and flush records.
pub struct PeerStream {
    stream: TcpStream,
    tls: Option<TlsChannel>,
}

impl PeerStream {
    pub(crate) fn plain(stream: TcpStream) -> Self {
        Self { stream, tls: None }
    }

    pub(crate) fn with_tls(stream: TcpStream, channel: TlsChannel) -> Self {
        Self {
            stream,
            tls: Some(channel),
        }
    }

    /// Remote address of the underlying socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Whether this stream carries a TLS session
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Drive the TLS handshake to a terminal state
    ///
    /// Waits on socket readiness between steps instead of spinning.
    /// Returns `true` once the session is established; `false` if the
    /// negotiation failed or the socket went away. Plaintext streams
    /// complete immediately.
    pub(crate) async fn complete_handshake(&mut self) -> bool {
        let Some(tls) = self.tls.as_mut() else {
            return true;
        };
        loop {
            match tls.advance(&self.stream) {
                HandshakeStatus::Established => return true,
                HandshakeStatus::Failed => return false,
                HandshakeStatus::PendingRead => {
                    if self.stream.ready(Interest::READABLE).await.is_err() {
                        return false;
                    }
                }
                HandshakeStatus::PendingWrite => {
                    if self.stream.ready(Interest::WRITABLE).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Non-blocking read of application bytes
    ///
    /// Returns `(bytes_read, more_pending)`. `more_pending` means decrypted
    /// plaintext is still buffered in the TLS session and must be drained
    /// before waiting on socket readiness again. `(0, false)` is end of
    /// stream; `WouldBlock` means no data right now.
    pub(crate) fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, bool)> {
        match self.tls.as_mut() {
            Some(tls) => tls.recv(&self.stream, buf),
            None => self.stream.try_read(buf).map(|n| (n, false)),
        }
    }

    /// Read application bytes, waiting for the socket when necessary
    ///
    /// Returns 0 at end of stream. This is the entry point for exec-hook
    /// handlers that own the stream.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.try_recv(buf) {
                Ok((n, _)) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stream.ready(Interest::READABLE).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a whole buffer, waiting for the socket when necessary
    pub async fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.tls.as_mut() {
            Some(tls) => {
                let mut flushed = tls.send(&self.stream, data)?;
                while !flushed {
                    self.stream.ready(Interest::WRITABLE).await?;
                    flushed = tls.flush(&self.stream)?;
                }
                Ok(())
            }
            None => {
                let mut offset = 0;
                while offset < data.len() {
                    match self.stream.try_write(&data[offset..]) {
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.stream.ready(Interest::WRITABLE).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }

    /// Wait until the socket is readable
    pub(crate) async fn readable(&self) -> io::Result<()> {
        self.stream.ready(Interest::READABLE).await.map(|_| ())
    }

    /// Close the write side, sending close_notify first on TLS sessions
    pub(crate) async fn close(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify(&self.stream);
        }
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer", &self.stream.peer_addr().ok())
            .field("tls", &self.tls)
            .finish()
    }
}

/// The task owning one relayed connection
pub(crate) struct ConnectionTask {
    pub(crate) id: ConnId,
    pub(crate) stream: PeerStream,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) outbound: mpsc::Receiver<Bytes>,
    pub(crate) read_enabled: bool,
    pub(crate) read_buffer_size: usize,
}

impl ConnectionTask {
    pub(crate) async fn run(mut self) {
        let id = self.id;

        if self.stream.is_tls() {
            if !self.stream.complete_handshake().await {
                let _ = self.events.send(Event::HandshakeFailed { id }).await;
                return;
            }
            // Tell the broker this peer is now eligible for relay.
            if self.events.send(Event::Promoted { id }).await.is_err() {
                return;
            }
        }

        let mut buf = vec![0u8; self.read_buffer_size];
        loop {
            tokio::select! {
                maybe = self.outbound.recv() => match maybe {
                    Some(data) => {
                        if let Err(e) = self.stream.send_all(&data).await {
                            debug!(conn = %id, error = %e, "Write to peer failed");
                            let _ = self.events.send(Event::Closed { id, clean: false }).await;
                            return;
                        }
                    }
                    // The broker dropped us from the registry.
                    None => {
                        self.stream.close().await;
                        return;
                    }
                },
                ready = self.stream.readable(), if self.read_enabled => {
                    if ready.is_err() {
                        let _ = self.events.send(Event::Closed { id, clean: false }).await;
                        return;
                    }
                    if !self.drain_readable(&mut buf).await {
                        return;
                    }
                }
            }
        }
    }

    /// Read until the socket would block, forwarding each chunk upstream
    ///
    /// Returns `false` once the connection is finished and a `Closed`
    /// event has been sent.
    async fn drain_readable(&mut self, buf: &mut [u8]) -> bool {
        loop {
            match self.stream.try_recv(buf) {
                Ok((0, _)) => {
                    trace!(conn = %self.id, "Peer reached end of stream");
                    let _ = self
                        .events
                        .send(Event::Closed { id: self.id, clean: true })
                        .await;
                    return false;
                }
                Ok((n, _pending)) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if self
                        .events
                        .send(Event::Data { id: self.id, data })
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "Read from peer failed");
                    let _ = self
                        .events
                        .send(Event::Closed { id: self.id, clean: false })
                        .await;
                    return false;
                }
            }
        }
    }
}
