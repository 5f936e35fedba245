//! Central event loop
//!
//! One task owns all shared state: the connection registry, the admission
//! controller, and the accounting counters. Listener tasks, connection
//! tasks, and the stdin pump never touch that state; they report what
//! happened on an event channel and the engine serializes every decision.
//!
//! ```text
//!   accept tasks ----\
//!   connection tasks --+--> Event channel --> Engine --> registry/relay
//!   stdin pump -------/
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::accounting::ConnectionAccounting;
use crate::admission::{AdmissionController, AdmissionDecision};
use crate::chat;
use crate::crlf::LineNormalizer;
use crate::registry::{ConnEntry, ConnId, ConnectionRegistry};
use crate::relay;
use crate::server::config::{BrokerConfig, BrokerExit};
use crate::server::connection::{ConnectionTask, PeerStream};
use crate::server::hook::ConnectionHook;
use crate::tls::{TlsContext, TlsState};

/// Everything that can happen to the broker, reported by its worker tasks
#[derive(Debug)]
pub(crate) enum Event {
    /// A listener accepted a socket
    Incoming { stream: TcpStream, peer: SocketAddr },
    /// A TLS connection finished its handshake
    Promoted { id: ConnId },
    /// A TLS connection failed its handshake
    HandshakeFailed { id: ConnId },
    /// A connection produced application bytes
    Data { id: ConnId, data: Bytes },
    /// A connection ended; `clean` distinguishes EOF from failure
    Closed { id: ConnId, clean: bool },
    /// Standard input produced bytes
    Stdin { data: Bytes },
    /// Standard input reached end of stream
    StdinEof,
}

/// The state-owning event loop
pub(crate) struct Engine {
    config: BrokerConfig,
    registry: ConnectionRegistry,
    accounting: Arc<ConnectionAccounting>,
    admission: AdmissionController,
    tls: Option<TlsContext>,
    hook: Option<Arc<dyn ConnectionHook>>,
    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    /// Lowered to stop the accept tasks in single-shot operation
    accept_gate: watch::Sender<bool>,
    /// Raised while at least one peer can receive stdin data
    stdin_gate: watch::Sender<bool>,
    next_id: u64,
    stdin_crlf: LineNormalizer,
    stdout: Stdout,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: BrokerConfig,
        tls: Option<TlsContext>,
        hook: Option<Arc<dyn ConnectionHook>>,
        admission: AdmissionController,
        accounting: Arc<ConnectionAccounting>,
        events_rx: mpsc::Receiver<Event>,
        events_tx: mpsc::Sender<Event>,
        accept_gate: watch::Sender<bool>,
        stdin_gate: watch::Sender<bool>,
    ) -> Self {
        let registry = ConnectionRegistry::with_capacity(config.registry_capacity());
        Self {
            config,
            registry,
            accounting,
            admission,
            tls,
            hook,
            events_rx,
            events_tx,
            accept_gate,
            stdin_gate,
            next_id: 1,
            stdin_crlf: LineNormalizer::new(),
            stdout: tokio::io::stdout(),
        }
    }

    /// Run until an exit condition is reached
    pub(crate) async fn run(mut self) -> BrokerExit {
        while let Some(event) = self.events_rx.recv().await {
            if let Some(exit) = self.dispatch(event).await {
                self.shutdown();
                return exit;
            }
        }
        // Every event source hung up; nothing more can happen.
        BrokerExit::Completed
    }

    async fn dispatch(&mut self, event: Event) -> Option<BrokerExit> {
        match event {
            Event::Incoming { stream, peer } => {
                self.on_incoming(stream, peer);
                None
            }
            Event::Promoted { id } => {
                self.on_promoted(id);
                None
            }
            Event::HandshakeFailed { id } => self.on_handshake_failed(id),
            Event::Data { id, data } => self.on_data(id, data).await,
            Event::Closed { id, clean } => self.reap(id, clean),
            Event::Stdin { data } => self.on_stdin(data).await,
            Event::StdinEof => self.on_stdin_eof(),
        }
    }

    fn on_incoming(&mut self, stream: TcpStream, peer: SocketAddr) {
        // The accept gate closes asynchronously, so a second connection can
        // already be queued behind the first. Single shot means exactly one.
        if self.config.single_shot() && self.accounting.total_established() > 0 {
            debug!(peer = %peer, "Already serving a connection, dropping");
            drop(stream);
            return;
        }

        match self.admission.decide(peer, self.accounting.active()) {
            AdmissionDecision::Allow => {}
            AdmissionDecision::DenyLimit => {
                warn!(peer = %peer, limit = self.admission.limit(), "Connection denied, limit reached");
                return;
            }
            AdmissionDecision::DenyPolicy => {
                warn!(peer = %peer, "Connection denied by address policy");
                return;
            }
        }

        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.accounting.on_established();
        info!(conn = %id, peer = %peer, "Connection established");

        let peer_stream = match &self.tls {
            Some(ctx) => match ctx.begin() {
                Ok(channel) => PeerStream::with_tls(stream, channel),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Cannot start TLS session");
                    self.accounting.on_reaped();
                    return;
                }
            },
            None => PeerStream::plain(stream),
        };

        if self.config.single_shot() {
            // One shot: nothing else gets accepted after this one.
            let _ = self.accept_gate.send(false);
        }

        if let Some(hook) = &self.hook {
            self.spawn_hook(id, peer_stream, peer, Arc::clone(hook));
            return;
        }
        self.spawn_relay(id, peer_stream, peer);
    }

    /// Hand the connection to the exec hook once its handshake is done
    ///
    /// Hook connections occupy a registry slot so the connection limit and
    /// teardown work the same way, but they never join the broadcast set.
    fn spawn_hook(
        &mut self,
        id: ConnId,
        mut stream: PeerStream,
        peer: SocketAddr,
        hook: Arc<dyn ConnectionHook>,
    ) {
        let (tx, _discard) = mpsc::channel(1);
        let mut entry = ConnEntry::new(peer, tx);
        entry.may_read = false;
        entry.may_write = false;
        if self.registry.add(id, entry).is_err() {
            debug!(conn = %id, "Registry full, dropping connection");
            self.accounting.on_reaped();
            return;
        }

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if !stream.complete_handshake().await {
                let _ = events.send(Event::HandshakeFailed { id }).await;
                return;
            }
            let result = hook.serve(stream, peer).await;
            if let Err(e) = &result {
                warn!(conn = %id, error = %e, "Connection handler failed");
            }
            let _ = events
                .send(Event::Closed { id, clean: result.is_ok() })
                .await;
        });
    }

    fn spawn_relay(&mut self, id: ConnId, stream: PeerStream, peer: SocketAddr) {
        let (tx, outbound) = mpsc::channel(self.config.outbound_queue);
        let mut entry = ConnEntry::new(peer, tx);
        if stream.is_tls() {
            // Not relayed in either direction until the handshake is done.
            entry.tls = TlsState::PendingRead;
            entry.may_read = false;
            entry.may_write = false;
        } else {
            entry.may_read = !self.config.send_only;
            entry.may_write = !self.config.recv_only;
            entry.in_broadcast = !self.config.recv_only;
        }
        if self.registry.add(id, entry).is_err() {
            debug!(conn = %id, "Registry full, dropping connection");
            self.accounting.on_reaped();
            return;
        }

        if !stream.is_tls() {
            self.announce_join(id, peer);
        }
        self.update_stdin_gate();

        let task = ConnectionTask {
            id,
            stream,
            events: self.events_tx.clone(),
            outbound,
            read_enabled: !self.config.send_only,
            read_buffer_size: self.config.read_buffer_size,
        };
        tokio::spawn(task.run());
    }

    fn on_promoted(&mut self, id: ConnId) {
        let Some(entry) = self.registry.lookup_mut(id) else {
            return;
        };
        entry.tls = TlsState::Established;
        entry.may_read = !self.config.send_only;
        entry.may_write = !self.config.recv_only;
        entry.in_broadcast = !self.config.recv_only;
        let peer = entry.peer;
        info!(conn = %id, peer = %peer, "TLS session established");

        self.announce_join(id, peer);
        self.update_stdin_gate();
    }

    fn on_handshake_failed(&mut self, id: ConnId) -> Option<BrokerExit> {
        let entry = self.registry.remove(id)?;
        self.accounting.on_reaped();
        warn!(conn = %id, peer = %entry.peer, "TLS handshake failed");
        self.update_stdin_gate();
        self.config.single_shot().then_some(BrokerExit::HandshakeFailed)
    }

    async fn on_data(&mut self, id: ConnId, data: Bytes) -> Option<BrokerExit> {
        match self.registry.lookup(id) {
            // Already reaped; data raced the teardown.
            None => return None,
            // Reads from this peer are disabled (send-only operation, or a
            // TLS session still negotiating).
            Some(entry) if !entry.may_read => return None,
            Some(_) => {}
        }

        if self.config.broker {
            let payload = if self.config.chat {
                chat::filter(id, &data)
            } else {
                data
            };
            let outcome = relay::broadcast(&self.registry, Some(id), &payload);
            return self.reap_failed(outcome.failed);
        }

        if let Err(e) = self.stdout.write_all(&data).await {
            debug!(error = %e, "Write to stdout failed");
        } else {
            let _ = self.stdout.flush().await;
        }
        None
    }

    async fn on_stdin(&mut self, data: Bytes) -> Option<BrokerExit> {
        if let Some(delay) = self.config.line_delay {
            tokio::time::sleep(delay).await;
        }
        let mut payload = if self.config.crlf {
            self.stdin_crlf.normalize(&data)
        } else {
            data
        };
        if self.config.chat {
            // Stdin speaks as <user0>.
            payload = chat::filter(ConnId::STDIN, &payload);
        }
        let outcome = relay::broadcast(&self.registry, None, &payload);
        self.reap_failed(outcome.failed)
    }

    fn on_stdin_eof(&mut self) -> Option<BrokerExit> {
        debug!("End of stream on stdin");
        if self.config.send_only && !self.config.broker {
            // Nothing will ever be sent again.
            return Some(BrokerExit::Completed);
        }
        None
    }

    /// Remove a connection and run the disconnect bookkeeping
    ///
    /// Keyed on registry removal, so a second report for the same id is a
    /// no-op and the reaped counter moves exactly once per connection.
    fn reap(&mut self, id: ConnId, clean: bool) -> Option<BrokerExit> {
        let entry = self.registry.remove(id)?;
        self.accounting.on_reaped();
        info!(
            conn = %id,
            peer = %entry.peer,
            active = self.accounting.active(),
            "Connection closed"
        );

        if self.config.chat && entry.in_broadcast {
            let msg = chat::announce_disconnect(id);
            let outcome = relay::broadcast(&self.registry, None, &msg);
            self.reap_failed(outcome.failed);
        }
        self.update_stdin_gate();

        if self.config.single_shot() {
            return Some(if clean {
                BrokerExit::CleanEof
            } else {
                BrokerExit::PeerError
            });
        }
        None
    }

    /// Second phase of a fan-out pass: drop every peer that failed it
    fn reap_failed(&mut self, failed: Vec<ConnId>) -> Option<BrokerExit> {
        let mut exit = None;
        for id in failed {
            if let Some(e) = self.reap(id, false) {
                exit.get_or_insert(e);
            }
        }
        exit
    }

    fn announce_join(&mut self, id: ConnId, peer: SocketAddr) {
        if !self.config.chat {
            return;
        }
        let others: Vec<(ConnId, SocketAddr)> = self
            .registry
            .iter()
            .filter(|(other, entry)| *other != id && entry.in_broadcast)
            .map(|(other, entry)| (other, entry.peer))
            .collect();
        let msg = chat::announce_connect(id, peer, &others);
        let outcome = relay::broadcast(&self.registry, None, &msg);
        self.reap_failed(outcome.failed);
    }

    fn update_stdin_gate(&self) {
        let want = self
            .registry
            .iter()
            .any(|(_, entry)| entry.in_broadcast && entry.may_write);
        let _ = self.stdin_gate.send(want);
    }

    fn shutdown(&mut self) {
        let _ = self.accept_gate.send(false);
        let _ = self.stdin_gate.send(false);
        // Dropping the entries closes every outbound queue, which makes
        // each connection task shut its socket down and exit.
        let ids: Vec<ConnId> = self.registry.iter().map(|(id, _)| id).collect();
        for id in ids {
            if self.registry.remove(id).is_some() {
                self.accounting.on_reaped();
            }
        }
    }
}
