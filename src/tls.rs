//! TLS context and the per-connection handshake state machine
//!
//! The broker drives TLS itself rather than handing the socket to an
//! acceptor, because a pending handshake must share the event loop with
//! ordinary traffic: each step performs only non-blocking I/O and reports
//! whether it next needs the socket readable or writable. After the
//! handshake the same session object is the record-layer send/receive
//! primitive, including the "more plaintext buffered" signal the read loop
//! uses to drain bursts.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConnection;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// TLS sub-state of a connection, as tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsState {
    /// Plaintext connection; no negotiation ever happens
    #[default]
    None,
    /// Handshake wants more bytes from the peer
    PendingRead,
    /// Handshake has output to flush
    PendingWrite,
    /// Negotiation finished; eligible for relay I/O
    Established,
    /// Negotiation failed; terminal
    Failed,
}

/// Outcome of one handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Established,
    PendingRead,
    PendingWrite,
    Failed,
}

/// Server-side TLS configuration, shared across connections
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ServerConfig>,
}

impl TlsContext {
    /// Load a certificate chain and private key from PEM files
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            Error::Setup(format!("cannot read certificate {}: {}", cert_path.display(), e))
        })?;
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::Setup(format!("bad certificate PEM: {}", e)))?;
        if certs.is_empty() {
            return Err(Error::Setup(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let key_pem = std::fs::read(key_path).map_err(|e| {
            Error::Setup(format!("cannot read key {}: {}", key_path.display(), e))
        })?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| Error::Setup(format!("bad key PEM: {}", e)))?
            .ok_or_else(|| Error::Setup(format!("no private key found in {}", key_path.display())))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Setup(format!("invalid certificate/key pair: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wrap an already-built rustls server configuration
    pub fn from_server_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self { config }
    }

    /// Begin a negotiation for one accepted connection
    pub fn begin(&self) -> Result<TlsChannel> {
        let conn = ServerConnection::new(Arc::clone(&self.config))?;
        Ok(TlsChannel {
            conn,
            state: TlsState::PendingRead,
        })
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Adapts tokio's non-blocking `try_read`/`try_write` to the blocking-style
/// `io::Read`/`io::Write` rustls drives records through. `WouldBlock`
/// surfaces unchanged, which is exactly what the stepper wants.
struct SyncStream<'a>(&'a TcpStream);

impl Read for SyncStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SyncStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One connection's TLS session: handshake stepper, then record-layer
/// send/receive primitive
pub struct TlsChannel {
    conn: ServerConnection,
    state: TlsState,
}

impl TlsChannel {
    /// Current sub-state
    pub fn state(&self) -> TlsState {
        self.state
    }

    /// Advance the handshake by whatever work the socket allows right now
    ///
    /// Never blocks: a read or write that would block yields the matching
    /// pending status instead. Terminal states are sticky; calling
    /// `advance` on an established or failed session does nothing.
    pub fn advance(&mut self, stream: &TcpStream) -> HandshakeStatus {
        match self.state {
            TlsState::Established => return HandshakeStatus::Established,
            TlsState::Failed => return HandshakeStatus::Failed,
            _ => {}
        }

        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut SyncStream(stream)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state = TlsState::PendingWrite;
                        return HandshakeStatus::PendingWrite;
                    }
                    Err(_) => return self.fail(),
                }
            }

            if !self.conn.is_handshaking() {
                self.state = TlsState::Established;
                return HandshakeStatus::Established;
            }

            match self.conn.read_tls(&mut SyncStream(stream)) {
                // Peer hung up mid-negotiation.
                Ok(0) => return self.fail(),
                Ok(_) => match self.conn.process_new_packets() {
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "TLS handshake failed");
                        // Best effort: flush the alert rustls queued.
                        let _ = self.conn.write_tls(&mut SyncStream(stream));
                        return self.fail();
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.state = TlsState::PendingRead;
                    return HandshakeStatus::PendingRead;
                }
                Err(_) => return self.fail(),
            }
        }
    }

    fn fail(&mut self) -> HandshakeStatus {
        self.state = TlsState::Failed;
        HandshakeStatus::Failed
    }

    /// Non-blocking receive of decrypted bytes
    ///
    /// Returns `(bytes_read, more_pending)`; `more_pending` reports
    /// plaintext still buffered in the session beyond what fit in `buf`,
    /// so the caller drains it before waiting on the socket again.
    /// `(0, false)` is end of stream. `WouldBlock` means nothing is
    /// available at all.
    pub(crate) fn recv(&mut self, stream: &TcpStream, buf: &mut [u8]) -> io::Result<(usize, bool)> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => {
                    let pending = self
                        .conn
                        .process_new_packets()
                        .map(|state| state.plaintext_bytes_to_read() > 0)
                        .unwrap_or(false);
                    return Ok((n, pending));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.conn.read_tls(&mut SyncStream(stream)) {
                        // TCP end of stream, with or without close_notify.
                        Ok(0) => return Ok((0, false)),
                        Ok(_) => {
                            self.conn
                                .process_new_packets()
                                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue plaintext for encryption and flush what the socket will take
    ///
    /// Returns `true` when everything reached the socket; `false` means
    /// records remain buffered and the caller should retry `flush` once
    /// the socket is writable.
    pub(crate) fn send(&mut self, stream: &TcpStream, data: &[u8]) -> io::Result<bool> {
        self.conn.writer().write_all(data)?;
        self.flush(stream)
    }

    /// Flush buffered TLS records; `Ok(false)` on a would-block
    pub(crate) fn flush(&mut self, stream: &TcpStream) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SyncStream(stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Queue a close_notify alert and flush it best-effort
    pub(crate) fn send_close_notify(&mut self, stream: &TcpStream) {
        self.conn.send_close_notify();
        let _ = self.flush(stream);
    }
}

impl std::fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannel").field("state", &self.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tokio::io::Interest;
    use tokio::net::TcpListener;

    use super::*;

    fn fixture_context() -> TlsContext {
        let base = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs");
        TlsContext::from_pem_files(&base.join("cert.pem"), &base.join("key.pem")).unwrap()
    }

    #[test]
    fn test_missing_cert_is_setup_error() {
        let missing = std::path::Path::new("/nonexistent/cert.pem");
        let err = TlsContext::from_pem_files(missing, missing).unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }

    #[test]
    fn test_fixture_certificates_load() {
        let _ctx = fixture_context();
    }

    #[tokio::test]
    async fn test_garbage_client_hello_fails_and_is_sticky() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut sock = std::net::TcpStream::connect(addr).unwrap();
            sock.write_all(b"this is definitely not a ClientHello").unwrap();
            // Hold the socket open so the server sees garbage, not EOF.
            std::thread::sleep(std::time::Duration::from_millis(500));
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut channel = fixture_context().begin().unwrap();

        let mut status = channel.advance(&stream);
        while matches!(
            status,
            HandshakeStatus::PendingRead | HandshakeStatus::PendingWrite
        ) {
            let interest = if status == HandshakeStatus::PendingRead {
                Interest::READABLE
            } else {
                Interest::WRITABLE
            };
            stream.ready(interest).await.unwrap();
            status = channel.advance(&stream);
        }

        assert_eq!(status, HandshakeStatus::Failed);
        assert_eq!(channel.state(), TlsState::Failed);

        // Terminal state is sticky.
        assert_eq!(channel.advance(&stream), HandshakeStatus::Failed);

        client.join().unwrap();
    }
}
