//! Listening broker: accept loop, event engine, per-connection tasks
//!
//! # Architecture
//!
//! ```text
//!                         Broker::run()
//!                              │
//!        ┌─────────────────────┼──────────────────────┐
//!        ▼                     ▼                      ▼
//!   [accept task]         [stdin pump]         [Engine (owns state)]
//!   listener.accept()     stdin.read()          registry, admission,
//!        │                     │                accounting, relay
//!        └──► Event::Incoming  └──► Event::Stdin       ▲
//!                  │                    │              │
//!                  └───── mpsc event channel ──────────┘
//!                                                      │
//!                              per-connection tasks ◄──┘
//!                              (handshake + socket I/O)
//! ```
//!
//! All mutable state lives in the engine task. Worker tasks report events
//! and receive outbound data on bounded queues, so no lock is ever held
//! across socket I/O.

pub(crate) mod broker;
pub mod config;
pub mod connection;
pub(crate) mod datagram;
pub mod hook;
pub mod listener;

pub use config::{BrokerConfig, BrokerExit, Protocol};
pub use connection::PeerStream;
pub use hook::{ConnectionHook, HookFuture};
pub use listener::Broker;
