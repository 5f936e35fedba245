//! Admission control for newly accepted connections
//!
//! A pure decision gate: the connection limit is checked first, then the
//! injected address policy. The controller never closes sockets and never
//! touches accounting; the event loop owns those side effects.

use std::net::SocketAddr;
use std::sync::Arc;

/// Outcome of an admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Connection may be registered
    Allow,
    /// Connection limit reached
    DenyLimit,
    /// Address policy rejected the peer
    DenyPolicy,
}

/// Allow/deny address list collaborator
pub trait AddressPolicy: Send + Sync {
    /// Whether a peer at this address may connect
    fn is_allowed(&self, peer: SocketAddr) -> bool;
}

/// Policy that admits every address (the default)
#[derive(Debug, Default)]
pub struct AllowAll;

impl AddressPolicy for AllowAll {
    fn is_allowed(&self, _peer: SocketAddr) -> bool {
        true
    }
}

impl<F> AddressPolicy for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn is_allowed(&self, peer: SocketAddr) -> bool {
        self(peer)
    }
}

/// Admission gate combining the connection ceiling and the address policy
#[derive(Clone)]
pub struct AdmissionController {
    limit: usize,
    policy: Arc<dyn AddressPolicy>,
}

impl AdmissionController {
    /// Create a controller with the given connection limit and policy
    pub fn new(limit: usize, policy: Arc<dyn AddressPolicy>) -> Self {
        Self { limit, policy }
    }

    /// Decide whether a newly accepted peer may stay
    ///
    /// The limit is checked before the policy, so `DenyLimit` is reported
    /// independently of what the policy would have said.
    pub fn decide(&self, peer: SocketAddr, active: u64) -> AdmissionDecision {
        if active >= self.limit as u64 {
            return AdmissionDecision::DenyLimit;
        }
        if !self.policy.is_allowed(peer) {
            return AdmissionDecision::DenyPolicy;
        }
        AdmissionDecision::Allow
    }

    /// The configured connection limit
    pub fn limit(&self) -> usize {
        self.limit
    }
}
