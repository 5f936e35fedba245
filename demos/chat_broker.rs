//! Chat broker example
//!
//! Run with: cargo run --example chat_broker [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example chat_broker                  # binds to 0.0.0.0:31337
//!   cargo run --example chat_broker 127.0.0.1:4000   # binds to 127.0.0.1:4000
//!
//! Connect a few terminals with netcat and talk:
//!   nc localhost 31337
//!
//! Every line is tagged with the sender's id and fanned out to all other
//! clients; join and leave events are announced. Whatever you type in the
//! broker's own terminal is sent to everyone.

use std::net::SocketAddr;

use relay_broker::{Broker, BrokerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let bind_addr: SocketAddr = match args.get(1) {
        Some(addr) => addr.parse()?,
        None => "0.0.0.0:31337".parse().unwrap(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_broker=debug".parse()?),
        )
        .init();

    let config = BrokerConfig::with_addr(bind_addr).conn_limit(20).chat();
    println!("Chat broker listening on {bind_addr}, up to 20 clients");
    println!("Join with: nc {} {}", bind_addr.ip(), bind_addr.port());
    println!();

    let broker = Broker::new(config);
    let exit = tokio::select! {
        exit = broker.run() => exit?,
        _ = tokio::signal::ctrl_c() => {
            println!("Shutting down");
            return Ok(());
        }
    };

    println!("Broker finished: {exit}");
    Ok(())
}
