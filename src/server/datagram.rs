//! Connected-UDP mode
//!
//! UDP has no accept step, so admission happens on the first datagram:
//! whichever listening socket hears from an admissible peer first gets
//! connected to that peer, and from then on the broker relays between
//! that one peer and stdin/stdout. Datagrams from other sources are
//! rejected by the connected socket at the kernel level.
//!
//! Under `keep_open`, a peer that becomes unreachable does not end the
//! run: the sockets are bound afresh and the broker waits for the next
//! client. Stdin EOF always ends the run.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::accounting::ConnectionAccounting;
use crate::admission::{AdmissionController, AdmissionDecision};
use crate::crlf::LineNormalizer;
use crate::error::Result;
use crate::server::config::{BrokerConfig, BrokerExit};

pub(crate) async fn run(
    config: BrokerConfig,
    admission: AdmissionController,
    accounting: Arc<ConnectionAccounting>,
) -> Result<BrokerExit> {
    loop {
        let exit = serve_once(&config, &admission, &accounting).await?;
        if !next_client_wanted(&config, exit) {
            return Ok(exit);
        }
        debug!("Client gone, rebinding for the next one");
    }
}

/// Whether this exit hands the sockets back to the next client
fn next_client_wanted(config: &BrokerConfig, exit: BrokerExit) -> bool {
    config.keep_open && exit == BrokerExit::PeerError
}

/// Bind, wait for one admissible client, and relay until it is gone
async fn serve_once(
    config: &BrokerConfig,
    admission: &AdmissionController,
    accounting: &Arc<ConnectionAccounting>,
) -> Result<BrokerExit> {
    let mut sockets = Vec::with_capacity(config.listen_addrs.len());
    for addr in &config.listen_addrs {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "Listening (UDP)");
        sockets.push(socket);
    }

    // Race the sockets; the first admissible datagram claims the broker.
    let (claim_tx, mut claim_rx) = mpsc::channel(1);
    for socket in sockets {
        let claim_tx = claim_tx.clone();
        let admission = admission.clone();
        let accounting = Arc::clone(accounting);
        let bufsize = config.read_buffer_size;
        tokio::spawn(async move {
            let mut buf = vec![0u8; bufsize];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "UDP receive failed");
                        continue;
                    }
                };
                match admission.decide(peer, accounting.active()) {
                    AdmissionDecision::Allow => {
                        let first = Bytes::copy_from_slice(&buf[..n]);
                        // Losers of the race drop their socket and exit.
                        let _ = claim_tx.send((socket, peer, first)).await;
                        return;
                    }
                    AdmissionDecision::DenyLimit => {
                        warn!(peer = %peer, "Datagram denied, limit reached");
                    }
                    AdmissionDecision::DenyPolicy => {
                        warn!(peer = %peer, "Datagram denied by address policy");
                    }
                }
            }
        });
    }
    drop(claim_tx);

    let Some((socket, peer, first)) = claim_rx.recv().await else {
        return Ok(BrokerExit::Completed);
    };
    drop(claim_rx);

    socket.connect(peer).await?;
    accounting.on_established();
    info!(peer = %peer, "Connection established (UDP)");

    let result = relay_one(config, &socket, first).await;
    accounting.on_reaped();
    result
}

/// Relay between the single connected peer and stdin/stdout
async fn relay_one(config: &BrokerConfig, socket: &UdpSocket, first: Bytes) -> Result<BrokerExit> {
    let mut stdout = tokio::io::stdout();
    let mut stdin = (config.stdin && !config.recv_only).then(tokio::io::stdin);
    let mut crlf = LineNormalizer::new();
    let mut net_buf = vec![0u8; config.read_buffer_size];
    let mut stdin_buf = vec![0u8; config.read_buffer_size];

    if !config.send_only && !first.is_empty() {
        stdout.write_all(&first).await?;
        stdout.flush().await?;
    }

    loop {
        tokio::select! {
            received = socket.recv(&mut net_buf), if !config.send_only => match received {
                Ok(n) => {
                    stdout.write_all(&net_buf[..n]).await?;
                    stdout.flush().await?;
                }
                // A connected UDP socket surfaces ICMP errors here.
                Err(e) => {
                    debug!(error = %e, "UDP peer unreachable");
                    return Ok(BrokerExit::PeerError);
                }
            },
            read = async { stdin.as_mut().unwrap().read(&mut stdin_buf).await }, if stdin.is_some() => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!("End of stream on stdin");
                        return Ok(BrokerExit::Completed);
                    }
                    Ok(n) => {
                        if let Some(delay) = config.line_delay {
                            tokio::time::sleep(delay).await;
                        }
                        let payload = if config.crlf {
                            crlf.normalize(&stdin_buf[..n])
                        } else {
                            Bytes::copy_from_slice(&stdin_buf[..n])
                        };
                        socket.send(&payload).await?;
                    }
                }
            }
        }
    }
}
