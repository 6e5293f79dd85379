//! The waiter arena: a map from proposal sequence number to the oneshot
//! sender a caller is blocked on, so the single-consumer apply pipeline can
//! wake the right `propose` call without either side holding a reference
//! to the other. Replaces a per-proposal cyclic channel registry (where
//! the proposer and the applier each needed a handle to the other) with
//! one arena both sides look sequence numbers up in -- see spec.md's
//! waiter-registry redesign flag, resolved this way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::CResult;
use crate::revision::Revision;
use crate::txn::TxnResponse;

/// What a successfully-applied proposal resolves to. Lease commands and
/// conf changes don't produce a txn response, just the revision (if any)
/// their application allocated.
#[derive(Clone, Debug)]
pub enum Applied {
    Txn(TxnResponse),
    Lease { id: i64 },
    Revision(Revision),
    ConfChangeApplied,
}

pub struct WaiterArena {
    next_seq: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<CResult<Applied>>>>,
}

impl WaiterArena {
    pub fn new() -> Self {
        Self { next_seq: AtomicU64::new(1), waiters: Mutex::new(HashMap::new()) }
    }

    /// Allocates a fresh sequence number and registers a waiter for it,
    /// returning both the number (to embed in the proposal) and the
    /// receiver the caller should await.
    pub fn register(&self) -> (u64, oneshot::Receiver<CResult<Applied>>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(seq, tx);
        (seq, rx)
    }

    /// Wakes the waiter for `seq` with its result, if anyone is still
    /// listening (the caller may have given up and dropped the receiver).
    pub fn complete(&self, seq: u64, result: CResult<Applied>) {
        if let Some(tx) = self.waiters.lock().unwrap().remove(&seq) {
            let _ = tx.send(result);
        }
    }

    /// Wakes every outstanding waiter with `ProposalDropped`, used when
    /// this node loses leadership mid-flight and its in-flight proposals
    /// are no longer guaranteed to commit.
    pub fn fail_all(&self) {
        use crate::error::Error;
        let mut waiters = self.waiters.lock().unwrap();
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Err(Error::ProposalDropped));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

impl Default for WaiterArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_wakes_the_matching_waiter() {
        let arena = WaiterArena::new();
        let (seq, rx) = arena.register();
        arena.complete(seq, Ok(Applied::Revision(5)));
        match rx.await.unwrap().unwrap() {
            Applied::Revision(r) => assert_eq!(r, 5),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn fail_all_drops_every_pending_waiter() {
        let arena = WaiterArena::new();
        let (_s1, rx1) = arena.register();
        let (_s2, rx2) = arena.register();
        arena.fail_all();
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        assert_eq!(arena.pending_count(), 0);
    }
}
