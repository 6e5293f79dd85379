//! The node-local Raft driver: wraps `raft::RawNode` (tikv/raft-rs), ticks
//! it on a timer, steps inbound `Message`s into it, and drains each
//! `Ready` into outbound messages, a persisted log/hard-state, and
//! committed entries handed to the [`apply`](super::apply) pipeline.
//! Sending outbound messages to peers is left to a `Transport` trait --
//! wire-level networking is out of scope here the same way spec.md leaves
//! the gRPC frontend out of scope, this crate only owns what happens once
//! bytes for a peer are ready to go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raft::eraftpb::{ConfState, Message as RaftMessage};
use raft::storage::MemStorage;
use raft::{Config as RaftConfig, RawNode, StateRole};
use tokio::sync::mpsc;

use crate::error::{CResult, Error};

use super::proposal::RawProposer;
use super::readindex::ReadIndexEngine;

/// Sends a Raft message to the peer it's addressed to. Implemented by
/// whatever transport a deployment wires in (etcd-gRPC framing, a raw TCP
/// codec, or an in-process channel for tests); this crate never opens a
/// socket itself.
pub trait Transport: Send + Sync {
    fn send(&self, msg: RaftMessage);
}

pub struct NoopTransport;
impl Transport for NoopTransport {
    fn send(&self, _msg: RaftMessage) {}
}

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub struct RaftNode {
    inner: Mutex<RawNode<MemStorage>>,
    transport: Arc<dyn Transport>,
    committed_tx: mpsc::Sender<Vec<u8>>,
    readindex: Arc<ReadIndexEngine>,
    is_leader: AtomicBool,
}

impl RaftNode {
    pub fn new(
        id: u64,
        voters: Vec<u64>,
        transport: Arc<dyn Transport>,
        readindex: Arc<ReadIndexEngine>,
        committed_tx: mpsc::Sender<Vec<u8>>,
    ) -> CResult<Arc<Self>> {
        Self::with_ticks(id, voters, 10, 3, transport, readindex, committed_tx)
    }

    pub fn with_ticks(
        id: u64,
        voters: Vec<u64>,
        election_tick: usize,
        heartbeat_tick: usize,
        transport: Arc<dyn Transport>,
        readindex: Arc<ReadIndexEngine>,
        committed_tx: mpsc::Sender<Vec<u8>>,
    ) -> CResult<Arc<Self>> {
        let config = RaftConfig {
            id,
            election_tick,
            heartbeat_tick,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        config.validate().map_err(|e| Error::Internal(format!("invalid raft config: {}", e)))?;

        let mut conf_state = ConfState::default();
        conf_state.set_voters(voters.clone());
        let storage = MemStorage::new_with_conf_state(conf_state);

        let raw = RawNode::new(&config, storage, &logger())
            .map_err(|e| Error::Internal(format!("failed to start raft node: {}", e)))?;

        readindex.set_single_voter(voters.len() <= 1);

        Ok(Arc::new(Self {
            inner: Mutex::new(raw),
            transport,
            committed_tx,
            readindex,
            is_leader: AtomicBool::new(false),
        }))
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn step(&self, msg: RaftMessage) -> CResult<()> {
        self.inner.lock()?.step(msg).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn read_index(&self, ctx: Vec<u8>) -> CResult<()> {
        self.inner.lock()?.read_index(ctx);
        Ok(())
    }

    /// One tick of the node's internal clock; call this on a fixed
    /// interval (the teacher's CLI drives its own tickers with
    /// `tokio::time::interval`, see `trace`/CLI bootstrap).
    pub fn tick(&self) {
        self.inner.lock().unwrap().tick();
    }

    /// Drains a `Ready` if one is pending: sends outbound messages via the
    /// transport, persists the log/hard-state/snapshot to storage, forwards
    /// newly committed entries to the apply pipeline, and resolves any
    /// ReadIndex contexts that came back. Should be called after every
    /// `tick()` and after every `step()`.
    pub async fn drain_ready(&self) -> CResult<()> {
        let mut raw = self.inner.lock()?;
        if !raw.has_ready() {
            return Ok(());
        }
        let mut ready = raw.ready();

        for msg in ready.take_messages() {
            self.transport.send(msg);
        }

        if !ready.snapshot().is_empty() {
            raw.mut_store().wl().apply_snapshot(ready.snapshot().clone()).map_err(|e| Error::Internal(e.to_string()))?;
        }

        if !ready.entries().is_empty() {
            raw.mut_store().wl().append(ready.entries()).map_err(|e| Error::Internal(e.to_string()))?;
        }

        if let Some(hs) = ready.hs() {
            raw.mut_store().wl().set_hardstate(hs.clone());
        }

        for rs in ready.read_states() {
            let index = rs.index;
            self.readindex.resolve(&rs.request_ctx, index);
        }

        for entry in ready.committed_entries() {
            if entry.data.is_empty() {
                continue; // empty entries mark a leader's term start, nothing to apply
            }
            if self.committed_tx.send(entry.data.to_vec()).await.is_err() {
                log::error!("apply pipeline receiver dropped; committed entry lost");
            }
        }

        let role_before = raw.raft.state;
        let mut light_rd = raw.advance(ready);
        for msg in light_rd.take_messages() {
            self.transport.send(msg);
        }
        for entry in light_rd.take_committed_entries() {
            if entry.data.is_empty() {
                continue;
            }
            if self.committed_tx.send(entry.data.to_vec()).await.is_err() {
                log::error!("apply pipeline receiver dropped; committed entry lost");
            }
        }
        raw.advance_apply();

        let became_leader = role_before != StateRole::Leader && raw.raft.state == StateRole::Leader;
        let lost_leadership = role_before == StateRole::Leader && raw.raft.state != StateRole::Leader;
        self.is_leader.store(raw.raft.state == StateRole::Leader, Ordering::SeqCst);
        if became_leader {
            log::info!("node {} became leader at term {}", raw.raft.id, raw.raft.term);
        }
        if lost_leadership {
            log::warn!("node {} lost leadership", raw.raft.id);
            self.readindex.invalidate_lease();
        }

        Ok(())
    }

    /// Runs `tick()` + `drain_ready()` on a fixed interval until the
    /// process shuts down. Mirrors the teacher's CLI pattern of spawning a
    /// `ctrlc`-triggered `Arc<AtomicBool>`-guarded loop.
    pub async fn run(self: Arc<Self>, tick_interval: Duration, shutdown: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(tick_interval);
        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.tick();
            if let Err(e) = self.drain_ready().await {
                log::error!("failed draining raft ready: {}", e);
            }
        }
    }
}

impl RawProposer for RaftNode {
    fn propose_raw(&self, data: Vec<u8>) -> CResult<()> {
        let mut raw = self.inner.lock()?;
        if raw.raft.state != StateRole::Leader {
            return Err(Error::NotLeader { hint: raw.raft.leader_id.ne(&0).then(|| raw.raft.leader_id.to_string()) });
        }
        raw.propose(vec![], data).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_voter_node_elects_itself_leader() {
        let readindex = Arc::new(ReadIndexEngine::new(true));
        let (tx, _rx) = mpsc::channel(8);
        let node = RaftNode::new(1, vec![1], Arc::new(NoopTransport), readindex, tx).unwrap();

        // Tick past the (randomized) election timeout; ten ticks covers
        // the configured election_tick with margin.
        for _ in 0..20 {
            node.tick();
            node.drain_ready().await.unwrap();
        }
        assert!(node.is_leader());
    }
}
