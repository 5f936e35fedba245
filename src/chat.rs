//! Chat-mode message filtering and announcements
//!
//! The chat personality of the broadcast relay: every relayed message is
//! prefixed with a stable per-connection tag, control bytes are escaped as
//! three-digit octal so one peer cannot inject terminal sequences at the
//! others, and connect/disconnect events are synthesized as `<announce>`
//! messages that travel through the same fan-out path as ordinary data.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::registry::ConnId;

/// Tag for a connection, as it appears in chat messages
fn tag(id: ConnId) -> String {
    format!("<user{}>", id)
}

fn is_passthrough(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\r' || b == b'\n' || b == b'\t'
}

/// Prefix `data` with the sender's tag and escape non-printable bytes
///
/// Printable ASCII, carriage return, line feed, and tab pass through
/// unchanged; everything else becomes `\NNN` (three-digit octal).
pub fn filter(id: ConnId, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    out.put_slice(tag(id).as_bytes());
    out.put_u8(b' ');

    for &b in data {
        if is_passthrough(b) {
            out.put_u8(b);
        } else {
            out.put_slice(format!("\\{:03o}", b).as_bytes());
        }
    }

    out.freeze()
}

/// Announce a new connection, enumerating who is already present
///
/// `others` must be in ascending identity order and exclude `id` itself.
pub fn announce_connect(id: ConnId, peer: SocketAddr, others: &[(ConnId, SocketAddr)]) -> Bytes {
    let mut msg = format!("<announce> {} is connected as {}.\n", peer, tag(id));

    msg.push_str("<announce> already connected: ");
    if others.is_empty() {
        msg.push_str("nobody");
    } else {
        for (i, (other_id, other_peer)) in others.iter().enumerate() {
            if i > 0 {
                msg.push_str(", ");
            }
            msg.push_str(&format!("{} as {}", other_peer, tag(*other_id)));
        }
    }
    msg.push_str(".\n");

    Bytes::from(msg)
}

/// Announce a disconnection
pub fn announce_disconnect(id: ConnId) -> Bytes {
    Bytes::from(format!("<announce> {} is disconnected.\n", tag(id)))
}
