//! Broker configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Transport the broker listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// TCP stream listeners
    #[default]
    Tcp,
    /// Connected-UDP, one client at a time
    Udp,
    /// Accepted for completeness; reported as a setup error at run time
    Sctp,
}

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Addresses to listen on
    pub listen_addrs: Vec<SocketAddr>,

    /// Transport protocol
    pub protocol: Protocol,

    /// Maximum concurrent connections
    pub conn_limit: usize,

    /// Keep accepting after the first connection ends
    pub keep_open: bool,

    /// Fan data from any peer out to all other peers (vs. relay to stdout)
    pub broker: bool,

    /// Chat personality: per-connection tags, escaping, announcements.
    /// Implies broker mode.
    pub chat: bool,

    /// Never read from peers; only push stdin at them
    pub send_only: bool,

    /// Never send to peers; only consume what they send
    pub recv_only: bool,

    /// Rewrite bare LF as CRLF on data read from stdin
    pub crlf: bool,

    /// Delay applied before each chunk of stdin is relayed
    pub line_delay: Option<Duration>,

    /// Wire the process's standard input into the relay
    pub stdin: bool,

    /// Read buffer size for peer sockets
    pub read_buffer_size: usize,

    /// Per-peer outbound queue depth (the backpressure allowance)
    pub outbound_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["0.0.0.0:31337".parse().unwrap()],
            protocol: Protocol::Tcp,
            conn_limit: 100,
            keep_open: false,
            broker: false,
            chat: false,
            send_only: false,
            recv_only: false,
            crlf: false,
            line_delay: None,
            stdin: true,
            read_buffer_size: 8 * 1024,
            outbound_queue: 128,
        }
    }
}

impl BrokerConfig {
    /// Create a config listening on a single address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            listen_addrs: vec![addr],
            ..Default::default()
        }
    }

    /// Replace the listen addresses
    pub fn listen(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.listen_addrs = addrs;
        self
    }

    /// Set the transport protocol
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the connection limit
    pub fn conn_limit(mut self, limit: usize) -> Self {
        self.conn_limit = limit;
        self
    }

    /// Keep accepting connections after the first one ends
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    /// Enable many-to-many fan-out between peers
    pub fn broker(mut self) -> Self {
        self.broker = true;
        self
    }

    /// Enable chat mode (implies broker mode)
    pub fn chat(mut self) -> Self {
        self.chat = true;
        self.broker = true;
        self
    }

    /// Never read from peers
    pub fn send_only(mut self) -> Self {
        self.send_only = true;
        self
    }

    /// Never send to peers
    pub fn recv_only(mut self) -> Self {
        self.recv_only = true;
        self
    }

    /// Normalize stdin line endings to CRLF
    pub fn crlf(mut self) -> Self {
        self.crlf = true;
        self
    }

    /// Delay each chunk of stdin before relaying it
    pub fn line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = Some(delay);
        self
    }

    /// Do not wire the process's stdin into the relay
    pub fn no_stdin(mut self) -> Self {
        self.stdin = false;
        self
    }

    /// Validate cross-field constraints before the broker starts
    pub fn validate(&self) -> Result<()> {
        if self.listen_addrs.is_empty() {
            return Err(Error::Setup("no listen addresses configured".to_string()));
        }
        if self.chat && !self.broker {
            return Err(Error::Setup("chat mode requires broker mode".to_string()));
        }
        if self.send_only && self.recv_only {
            return Err(Error::Setup(
                "send-only and receive-only are mutually exclusive".to_string(),
            ));
        }
        if self.read_buffer_size == 0 || self.outbound_queue == 0 {
            return Err(Error::Setup("buffer sizes must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Registry capacity: the connection limit plus a reserve that stands
    /// in for the listening sockets and standard input
    pub(crate) fn registry_capacity(&self) -> usize {
        self.conn_limit
            .saturating_add(self.listen_addrs.len())
            .saturating_add(1)
    }

    /// Single-shot operation: stop after the first connection
    pub(crate) fn single_shot(&self) -> bool {
        !self.keep_open && !self.broker
    }
}

/// How a broker run ended
///
/// Fatal setup problems are reported as errors instead and never produce
/// an exit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerExit {
    /// A peer reached end of stream and single-shot mode finished cleanly
    CleanEof,
    /// Send-only operation completed (nothing more will ever be sent)
    Completed,
    /// TLS negotiation failed in single-shot mode
    HandshakeFailed,
    /// The peer connection failed mid-stream in single-shot mode
    PeerError,
    /// An external shutdown signal (idle/host timer) fired
    TimedOut,
}

impl BrokerExit {
    /// Whether this exit maps to a zero process status
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BrokerExit::CleanEof | BrokerExit::Completed | BrokerExit::TimedOut
        )
    }
}

impl std::fmt::Display for BrokerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerExit::CleanEof => write!(f, "clean end of stream"),
            BrokerExit::Completed => write!(f, "completed"),
            BrokerExit::HandshakeFailed => write!(f, "TLS handshake failed"),
            BrokerExit::PeerError => write!(f, "peer connection failed"),
            BrokerExit::TimedOut => write!(f, "timed out"),
        }
    }
}
