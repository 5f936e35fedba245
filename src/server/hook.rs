//! Per-connection exec hook
//!
//! Instead of joining the relay, an admitted connection can be handed to a
//! user-supplied handler that owns the socket for the rest of its life.
//! The broker keeps counting it against the connection limit until the
//! handler's future resolves.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use crate::server::connection::PeerStream;

/// Future returned by a connection hook
pub type HookFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Handler that takes ownership of an admitted connection
///
/// For TLS listeners the stream handed over has already completed its
/// handshake, so the handler only ever sees application data.
pub trait ConnectionHook: Send + Sync {
    /// Serve one connection to completion
    fn serve(&self, stream: PeerStream, peer: SocketAddr) -> HookFuture;
}

impl<F, Fut> ConnectionHook for F
where
    F: Fn(PeerStream, SocketAddr) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    fn serve(&self, stream: PeerStream, peer: SocketAddr) -> HookFuture {
        Box::pin(self(stream, peer))
    }
}
