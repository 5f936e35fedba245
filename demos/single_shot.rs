//! Single-shot relay example, optionally with TLS
//!
//! Run with: cargo run --example single_shot [BIND_ADDR] [CERT_PEM KEY_PEM]
//!
//! Examples:
//!   cargo run --example single_shot
//!   cargo run --example single_shot 127.0.0.1:4433 cert.pem key.pem
//!
//! Accepts exactly one connection, relays it against stdin/stdout, and
//! exits when the peer hangs up. With a certificate and key the listener
//! terminates TLS first:
//!   ncat --ssl localhost 4433
//!
//! The process exit code follows the outcome: clean EOF is success, a
//! failed handshake or mid-stream error is not.

use std::net::SocketAddr;
use std::path::Path;

use relay_broker::{Broker, BrokerConfig, TlsContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let bind_addr: SocketAddr = match args.get(1) {
        Some(addr) => addr.parse()?,
        None => "127.0.0.1:31337".parse().unwrap(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_broker=debug".parse()?),
        )
        .init();

    let mut broker = Broker::new(BrokerConfig::with_addr(bind_addr));
    if let (Some(cert), Some(key)) = (args.get(2), args.get(3)) {
        let tls = TlsContext::from_pem_files(Path::new(cert), Path::new(key))?;
        broker = broker.with_tls(tls);
        println!("Listening on {bind_addr} (TLS), one connection");
    } else {
        println!("Listening on {bind_addr}, one connection");
    }

    let exit = broker.run().await?;
    eprintln!("Finished: {exit}");
    std::process::exit(if exit.is_success() { 0 } else { 1 });
}
