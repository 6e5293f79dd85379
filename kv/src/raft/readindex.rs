//! Linearizable reads: the ReadIndex protocol (confirm leadership via a
//! quorum round-trip before serving a read) and Lease Read (skip the
//! round-trip while a previously-confirmed leader lease is still valid).
//! A single-voter cluster auto-disables both: with no other voter to
//! round-trip with, the leader's local state is linearizable by
//! construction, so every read is served immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{CResult, Error};

/// How much earlier than a lease's nominal expiry reads stop trusting it,
/// to absorb clock drift between the leader and the peers whose acks
/// extended the lease.
const CLOCK_DRIFT_BUDGET: Duration = Duration::from_millis(50);

struct LeaderLease {
    valid_until: Option<Instant>,
}

pub struct ReadIndexEngine {
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<u64>>>,
    next_ctx: AtomicU64,
    single_voter: AtomicBool,
    lease: Mutex<LeaderLease>,
    lease_read_enabled: AtomicBool,
}

impl ReadIndexEngine {
    pub fn new(lease_read_enabled: bool) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_ctx: AtomicU64::new(1),
            single_voter: AtomicBool::new(false),
            lease: Mutex::new(LeaderLease { valid_until: None }),
            lease_read_enabled: AtomicBool::new(lease_read_enabled),
        }
    }

    pub fn set_single_voter(&self, single: bool) {
        self.single_voter.store(single, Ordering::SeqCst);
    }

    pub fn is_single_voter(&self) -> bool {
        self.single_voter.load(Ordering::SeqCst)
    }

    /// Registers a pending ReadIndex request and returns the context bytes
    /// to pass to `RawNode::read_index`, plus the receiver that resolves
    /// to the committed index once that context comes back through a
    /// `Ready`'s `read_states`.
    pub fn request(&self) -> (Vec<u8>, oneshot::Receiver<u64>) {
        let ctx = self.next_ctx.fetch_add(1, Ordering::SeqCst).to_be_bytes().to_vec();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(ctx.clone(), tx);
        (ctx, rx)
    }

    /// Called while draining a `Ready`'s `read_states`: wakes the waiter
    /// registered for this context, if any (a stale or foreign context is
    /// silently ignored).
    pub fn resolve(&self, ctx: &[u8], index: u64) {
        if let Some(tx) = self.pending.lock().unwrap().remove(ctx) {
            let _ = tx.send(index);
        }
    }

    pub fn fail_all(&self) {
        for (_, tx) in self.pending.lock().unwrap().drain() {
            drop(tx); // dropping resolves the receiver to a RecvError, surfaced as ProposalDropped by the caller
        }
    }

    /// Called on every heartbeat round that a quorum of peers acked,
    /// extending how long this node may trust its own leadership for
    /// Lease Read without a fresh ReadIndex round-trip.
    pub fn renew_lease(&self, ttl: Duration) {
        self.lease.lock().unwrap().valid_until = Some(Instant::now() + ttl);
    }

    pub fn invalidate_lease(&self) {
        self.lease.lock().unwrap().valid_until = None;
    }

    /// Returns `true` if a read may be served from local state right now
    /// without a ReadIndex round-trip: either this is a single-voter
    /// cluster, or Lease Read is enabled and the leader lease has not yet
    /// entered its clock-drift budget.
    pub fn can_serve_locally(&self, now: Instant) -> bool {
        if self.is_single_voter() {
            return true;
        }
        if !self.lease_read_enabled.load(Ordering::SeqCst) {
            return false;
        }
        match self.lease.lock().unwrap().valid_until {
            Some(until) => now + CLOCK_DRIFT_BUDGET < until,
            None => false,
        }
    }

    /// Awaits a ReadIndex round-trip (or resolves immediately if
    /// `can_serve_locally` already allows it), returning the log index the
    /// apply pipeline must have caught up to before the read is safe.
    pub async fn confirm(&self, local_committed_index: u64) -> CResult<u64> {
        if self.can_serve_locally(Instant::now()) {
            return Ok(local_committed_index);
        }
        Err(Error::Internal(
            "ReadIndex round-trip must be driven by the owning RaftNode via request()/resolve()".into(),
        ))
    }
}

impl Default for ReadIndexEngine {
    fn default() -> Self {
        Self::new(true)
    }
}
