//! The apply pipeline: the single consumer of Raft's committed-entry
//! stream. Entries are decoded, applied to the backend/lease
//! engine/cluster state in strict log order (never concurrently -- that
//! order *is* the linearization point), and the events each mutation
//! produces are forwarded to the watch engine before the proposer's
//! waiter is woken, so a client that gets an applied response back can
//! never race a watch delivery for the same mutation.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::Backend;
use crate::cluster::ClusterState;
use crate::lease::LeaseEngine;
use crate::watch::WatchEngine;

use super::proposal::decode_batch;
use super::waiter::{Applied, WaiterArena};
use super::Command;

pub struct ApplyPipeline;

impl ApplyPipeline {
    /// Spawns the consumer task. `committed` yields raw entry payloads in
    /// the order Raft committed them (one `recv()` per log entry);
    /// `cluster` is locked only for the duration of applying a single
    /// `ConfChange`, never across an `.await`.
    pub fn spawn(
        backend: Arc<dyn Backend>,
        lease_engine: Arc<LeaseEngine>,
        watch_engine: Arc<WatchEngine>,
        cluster: Arc<std::sync::Mutex<ClusterState>>,
        waiters: Arc<WaiterArena>,
        mut committed: mpsc::Receiver<Vec<u8>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(entry) = committed.recv().await {
                let proposals = match decode_batch(&entry) {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("dropping unparseable committed entry: {}", e);
                        continue;
                    }
                };

                for proposal in proposals {
                    let result = apply_one(&backend, &lease_engine, &watch_engine, &cluster, proposal.command);
                    waiters.complete(proposal.seq, result);
                }
            }
            log::info!("apply pipeline stopped: committed-entry channel closed");
        })
    }
}

fn apply_one(
    backend: &Arc<dyn Backend>,
    lease_engine: &Arc<LeaseEngine>,
    watch_engine: &Arc<WatchEngine>,
    cluster: &Arc<std::sync::Mutex<ClusterState>>,
    command: Command,
) -> crate::error::CResult<Applied> {
    match command {
        Command::Txn(req) => {
            let (resp, events) = backend.txn(&req)?;
            if !events.is_empty() {
                if let Err(e) = watch_engine.notify(resp.revision, events) {
                    log::error!("watch notify failed: {}", e);
                }
            }
            Ok(Applied::Txn(resp))
        }
        Command::LeaseGrant { id, ttl_secs } => {
            let granted = lease_engine.grant_with_id(id, ttl_secs)?;
            Ok(Applied::Lease { id: granted })
        }
        Command::LeaseRevoke { id } => {
            let (revision, events) = backend.revoke_lease_keys(id)?;
            if !events.is_empty() {
                if let Err(e) = watch_engine.notify(revision, events) {
                    log::error!("watch notify failed: {}", e);
                }
            }
            // The lease may already be gone if this is a replay of an
            // expiry sweep that raced a client-initiated revoke; either
            // way the end state (no lease, no attached keys) is correct.
            let _ = lease_engine.revoke(id);
            Ok(Applied::Revision(revision))
        }
        Command::ConfChange(change) => {
            cluster.lock()?.apply(change);
            Ok(Applied::ConfChangeApplied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::raft::proposal::encode_batch;
    use crate::raft::Proposal;
    use crate::txn::TxnRequest;

    #[tokio::test]
    async fn applying_a_txn_notifies_watchers_and_wakes_its_waiter() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let lease_engine = Arc::new(LeaseEngine::new());
        let watch_engine = Arc::new(WatchEngine::new());
        let cluster = Arc::new(std::sync::Mutex::new(ClusterState::new()));
        let waiters = Arc::new(WaiterArena::new());

        let (tx, rx) = mpsc::channel(8);
        let _handle = ApplyPipeline::spawn(backend.clone(), lease_engine, watch_engine, cluster, waiters.clone(), rx);

        let (seq, waiter_rx) = waiters.register();
        let req = TxnRequest {
            compare: vec![],
            success: vec![crate::txn::Op::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0, prev_kv: false }],
            failure: vec![],
        };
        let entry = encode_batch(&[Proposal { seq, command: Command::Txn(req) }]).unwrap();
        tx.send(entry).await.unwrap();

        let applied = waiter_rx.await.unwrap().unwrap();
        assert!(matches!(applied, Applied::Txn(resp) if resp.succeeded));
        assert_eq!(backend.range(b"a", Default::default()).unwrap().kvs[0].value, b"1");
    }
}
