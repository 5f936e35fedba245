//! Broadcast fan-out
//!
//! Delivers one payload to every broadcast-set member except the sender.
//! Delivery is a non-blocking push onto each member's bounded writer queue:
//! the queue is the per-peer backpressure allowance, and a peer whose queue
//! is closed or full is reported back for removal rather than removed
//! mid-iteration (failures are collected during the pass and torn down by
//! the caller afterwards).

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;

use crate::registry::{ConnId, ConnectionRegistry};

/// Result of one fan-out pass
#[derive(Debug, Default)]
pub struct RelayOutcome {
    /// Members the payload was queued for
    pub delivered: usize,
    /// Members whose writer queue was closed or full; remove after the pass
    pub failed: Vec<ConnId>,
}

/// Send `data` to every broadcast-set member except `source`
///
/// Members are visited in ascending identity order. A failure on one peer
/// never aborts delivery to the rest.
pub fn broadcast(
    registry: &ConnectionRegistry,
    source: Option<ConnId>,
    data: &Bytes,
) -> RelayOutcome {
    let mut outcome = RelayOutcome::default();

    for (id, entry) in registry.iter() {
        if Some(id) == source || !entry.in_broadcast || !entry.may_write {
            continue;
        }

        match entry.tx.try_send(data.clone()) {
            Ok(()) => outcome.delivered += 1,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(id = %id, "Relay target gone");
                outcome.failed.push(id);
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(id = %id, "Relay target too slow, dropping it");
                outcome.failed.push(id);
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::ConnEntry;

    fn member(reg: &mut ConnectionRegistry, id: u64, queue: usize) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(queue);
        let mut entry = ConnEntry::new(format!("127.0.0.1:{}", 5000 + id).parse().unwrap(), tx);
        entry.in_broadcast = true;
        reg.add(ConnId(id), entry).unwrap();
        rx
    }

    #[test]
    fn test_no_echo_to_sender() {
        let mut reg = ConnectionRegistry::with_capacity(8);
        let mut rx1 = member(&mut reg, 1, 4);
        let mut rx2 = member(&mut reg, 2, 4);
        let mut rx3 = member(&mut reg, 3, 4);

        let outcome = broadcast(&reg, Some(ConnId(1)), &Bytes::from_static(b"hi"));
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.failed.is_empty());

        assert!(rx1.try_recv().is_err());
        assert_eq!(&rx2.try_recv().unwrap()[..], b"hi");
        assert_eq!(&rx3.try_recv().unwrap()[..], b"hi");
    }

    #[test]
    fn test_no_source_delivers_to_all() {
        let mut reg = ConnectionRegistry::with_capacity(8);
        let mut rx1 = member(&mut reg, 1, 4);
        let mut rx2 = member(&mut reg, 2, 4);

        let outcome = broadcast(&reg, None, &Bytes::from_static(b"x"));
        assert_eq!(outcome.delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_one_failure_does_not_abort_the_pass() {
        let mut reg = ConnectionRegistry::with_capacity(8);
        let rx1 = member(&mut reg, 1, 4);
        let mut rx2 = member(&mut reg, 2, 4);
        drop(rx1); // peer 1's task is gone

        let outcome = broadcast(&reg, None, &Bytes::from_static(b"x"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, vec![ConnId(1)]);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_is_reported() {
        let mut reg = ConnectionRegistry::with_capacity(8);
        let _rx1 = member(&mut reg, 1, 1);

        assert_eq!(broadcast(&reg, None, &Bytes::from_static(b"a")).delivered, 1);
        let outcome = broadcast(&reg, None, &Bytes::from_static(b"b"));
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.failed, vec![ConnId(1)]);
    }

    #[test]
    fn test_non_members_are_skipped() {
        let mut reg = ConnectionRegistry::with_capacity(8);
        let (tx, mut rx) = mpsc::channel(4);
        // Registered but never promoted into the broadcast set.
        reg.add(
            ConnId(1),
            ConnEntry::new("127.0.0.1:5001".parse().unwrap(), tx),
        )
        .unwrap();

        let outcome = broadcast(&reg, None, &Bytes::from_static(b"x"));
        assert_eq!(outcome.delivered, 0);
        assert!(rx.try_recv().is_err());
    }
}
