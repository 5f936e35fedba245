//! Multiplexed TCP/UDP connection broker
//!
//! A listening relay in the netcat tradition: it accepts any number of
//! peers up to a configurable limit, optionally terminates TLS, and moves
//! bytes between the peers and the process's stdin/stdout. In broker mode
//! every peer's data is fanned out to all the others; chat mode adds
//! per-peer tags, control-byte escaping, and join/leave announcements.
//!
//! # Quick start
//!
//! ```no_run
//! use relay_broker::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> relay_broker::Result<()> {
//!     let config = BrokerConfig::with_addr("0.0.0.0:31337".parse().unwrap())
//!         .conn_limit(20)
//!         .chat();
//!     let exit = Broker::new(config).run().await?;
//!     println!("broker finished: {exit}");
//!     Ok(())
//! }
//! ```

pub mod accounting;
pub mod admission;
pub mod chat;
pub mod crlf;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod tls;

pub use accounting::ConnectionAccounting;
pub use admission::{AddressPolicy, AdmissionController, AdmissionDecision, AllowAll};
pub use error::{Error, Result};
pub use registry::{ConnEntry, ConnId, ConnectionRegistry};
pub use server::{Broker, BrokerConfig, BrokerExit, ConnectionHook, PeerStream, Protocol};
pub use tls::TlsContext;
