//! Broker front end
//!
//! Owns the listening sockets and wires the worker tasks to the engine:
//! one accept task per listener, an optional stdin pump, and the engine
//! itself on the receiving end of the event channel.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::accounting::ConnectionAccounting;
use crate::admission::{AddressPolicy, AdmissionController, AllowAll};
use crate::error::{Error, Result};
use crate::server::broker::{Engine, Event};
use crate::server::config::{BrokerConfig, BrokerExit, Protocol};
use crate::server::datagram;
use crate::server::hook::ConnectionHook;
use crate::tls::TlsContext;

const EVENT_QUEUE: usize = 256;

/// A listening connection broker
///
/// Constructed from a [`BrokerConfig`], optionally decorated with an
/// address policy, a TLS context, or an exec hook, then driven to
/// completion with [`run`](Broker::run).
pub struct Broker {
    config: BrokerConfig,
    policy: Arc<dyn AddressPolicy>,
    hook: Option<Arc<dyn ConnectionHook>>,
    tls: Option<TlsContext>,
    accounting: Arc<ConnectionAccounting>,
    listeners: Option<Vec<TcpListener>>,
}

impl Broker {
    /// Create a broker with the default allow-everything policy
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            policy: Arc::new(AllowAll),
            hook: None,
            tls: None,
            accounting: Arc::new(ConnectionAccounting::new()),
            listeners: None,
        }
    }

    /// Set the address admission policy
    pub fn with_policy(mut self, policy: impl AddressPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Hand every admitted connection to `hook` instead of relaying it
    pub fn with_hook(mut self, hook: impl ConnectionHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Terminate TLS on every accepted connection
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Shared view of the connection counters
    pub fn accounting(&self) -> Arc<ConnectionAccounting> {
        Arc::clone(&self.accounting)
    }

    /// Bind the listening sockets and report their local addresses
    ///
    /// Useful with port 0 to learn the ephemeral port before `run`.
    /// `run` binds implicitly when this was not called.
    pub async fn bind(&mut self) -> Result<Vec<SocketAddr>> {
        if self.config.protocol != Protocol::Tcp {
            return Err(Error::Setup(
                "explicit bind is only supported for TCP".to_string(),
            ));
        }
        let mut listeners = Vec::with_capacity(self.config.listen_addrs.len());
        let mut local = Vec::with_capacity(self.config.listen_addrs.len());
        for addr in &self.config.listen_addrs {
            let listener = TcpListener::bind(addr).await?;
            local.push(listener.local_addr()?);
            listeners.push(listener);
        }
        self.listeners = Some(listeners);
        Ok(local)
    }

    /// Run the broker until it reaches an exit condition
    pub async fn run(self) -> Result<BrokerExit> {
        self.config.validate()?;
        match self.config.protocol {
            Protocol::Tcp => self.run_tcp().await,
            Protocol::Udp => {
                if self.tls.is_some() {
                    return Err(Error::Setup("TLS is not supported over UDP".to_string()));
                }
                if self.hook.is_some() {
                    return Err(Error::Setup(
                        "exec hooks are not supported over UDP".to_string(),
                    ));
                }
                let admission =
                    AdmissionController::new(self.config.conn_limit, Arc::clone(&self.policy));
                datagram::run(self.config, admission, self.accounting).await
            }
            Protocol::Sctp => Err(Error::Setup("SCTP is not supported".to_string())),
        }
    }

    /// Run the broker until it exits on its own or `signal` resolves
    ///
    /// A resolved signal reports [`BrokerExit::TimedOut`]; use it for idle
    /// timers or process shutdown.
    pub async fn run_until<F>(self, signal: F) -> Result<BrokerExit>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            exit = self.run() => exit,
            _ = signal => Ok(BrokerExit::TimedOut),
        }
    }

    async fn run_tcp(mut self) -> Result<BrokerExit> {
        let listeners = match self.listeners.take() {
            Some(listeners) => listeners,
            None => {
                self.bind().await?;
                self.listeners.take().unwrap_or_default()
            }
        };
        for listener in &listeners {
            info!(addr = %listener.local_addr()?, "Listening");
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (accept_gate, _) = watch::channel(true);
        let (stdin_gate, _) = watch::channel(false);

        for listener in listeners {
            tokio::spawn(accept_loop(
                listener,
                events_tx.clone(),
                accept_gate.subscribe(),
            ));
        }
        if self.config.stdin && !self.config.recv_only {
            tokio::spawn(stdin_pump(events_tx.clone(), stdin_gate.subscribe()));
        }

        let admission = AdmissionController::new(self.config.conn_limit, self.policy);
        let engine = Engine::new(
            self.config,
            self.tls,
            self.hook,
            admission,
            self.accounting,
            events_rx,
            events_tx,
            accept_gate,
            stdin_gate,
        );
        Ok(engine.run().await)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("tls", &self.tls.is_some())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Accept connections and hand them to the engine until the gate drops
async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    mut gate: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    if events.send(Event::Incoming { stream, peer }).await.is_err() {
                        return;
                    }
                }
                // Transient accept failures (EMFILE, resets) are survivable.
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            changed = gate.changed() => {
                if changed.is_err() || !*gate.borrow() {
                    debug!(addr = ?listener.local_addr().ok(), "Listener closed");
                    return;
                }
            }
        }
    }
}

/// Forward stdin to the engine
///
/// Reads are held off while no peer can receive, so bytes are never pulled
/// off stdin just to be dropped.
async fn stdin_pump(events: mpsc::Sender<Event>, mut gate: watch::Receiver<bool>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                return;
            }
        }
        match stdin.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(Event::StdinEof).await;
                return;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(Event::Stdin { data }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "Read from stdin failed");
                let _ = events.send(Event::StdinEof).await;
                return;
            }
        }
    }
}
