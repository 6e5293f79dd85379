//! The batch proposer: a single background task that drains a channel of
//! individual [`Command`]s, groups whatever arrived since the last flush
//! into one Raft entry, and proposes that entry instead of one entry per
//! command. The linger window between flushes adapts to recent batch
//! sizes with an exponential moving average -- under light load it flushes
//! almost immediately (low latency), under heavy load it widens the
//! window so more commands land in each round of replication (higher
//! throughput per log entry).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::CResult;

use super::waiter::{Applied, WaiterArena};
use super::{Command, Proposal};

/// Leading byte marking an entry's payload as a bincode-encoded
/// `Vec<Proposal>` batch, reserved so a future wire format change has a
/// byte to dispatch on instead of guessing.
pub const BATCH_MAGIC: u8 = 0xB7;

const MIN_LINGER: Duration = Duration::from_micros(200);
const MAX_LINGER: Duration = Duration::from_millis(10);
const MAX_BATCH_COMMANDS: usize = 1024;
const EMA_ALPHA: f64 = 0.2;

/// Something that can actually hand a framed entry to Raft. Implemented by
/// `raft::node::RaftNode`; kept as a trait so `BatchProposer` and its tests
/// don't need a real `RawNode`.
pub trait RawProposer: Send + Sync {
    fn propose_raw(&self, data: Vec<u8>) -> CResult<()>;
}

struct AdaptiveLinger {
    ema_batch_len: f64,
}

impl AdaptiveLinger {
    fn new() -> Self {
        Self { ema_batch_len: 1.0 }
    }

    fn record(&mut self, batch_len: usize) {
        self.ema_batch_len = EMA_ALPHA * batch_len as f64 + (1.0 - EMA_ALPHA) * self.ema_batch_len;
    }

    /// Scales linearly between `MIN_LINGER` (batches have been size-1,
    /// i.e. no contention to amortize) and `MAX_LINGER` (batches have been
    /// hitting `MAX_BATCH_COMMANDS`, i.e. worth waiting longer for more).
    fn next_wait(&self) -> Duration {
        let fraction = (self.ema_batch_len / MAX_BATCH_COMMANDS as f64).clamp(0.0, 1.0);
        MIN_LINGER + Duration::from_secs_f64((MAX_LINGER - MIN_LINGER).as_secs_f64() * fraction)
    }
}

pub fn encode_batch(proposals: &[Proposal]) -> CResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64 + proposals.len() * 32);
    out.push(BATCH_MAGIC);
    let body = bincode::serialize(&proposals.to_vec())?;
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_batch(data: &[u8]) -> CResult<Vec<Proposal>> {
    if data.first() != Some(&BATCH_MAGIC) {
        return Err(crate::error::Error::Decode("entry missing batch magic prefix".into()));
    }
    bincode::deserialize(&data[1..]).map_err(Into::into)
}

pub struct BatchProposer {
    sender: mpsc::UnboundedSender<Proposal>,
    waiters: Arc<WaiterArena>,
}

impl BatchProposer {
    /// Spawns the background flush loop against `raw`, sharing `waiters`
    /// with the apply pipeline so proposed sequence numbers resolve to the
    /// same arena the applier completes them in.
    pub fn spawn(raw: Arc<dyn RawProposer>, waiters: Arc<WaiterArena>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Proposal>();

        tokio::spawn({
            let waiters = waiters.clone();
            async move {
                let mut linger = AdaptiveLinger::new();
                let mut buffer: Vec<Proposal> = Vec::new();

                loop {
                    let wait = linger.next_wait();
                    match timeout(wait, rx.recv()).await {
                        Ok(Some(proposal)) => {
                            buffer.push(proposal);
                            if buffer.len() >= MAX_BATCH_COMMANDS {
                                flush(&raw, &waiters, &mut buffer, &mut linger);
                            }
                        }
                        Ok(None) => {
                            flush(&raw, &waiters, &mut buffer, &mut linger);
                            break;
                        }
                        Err(_elapsed) => {
                            if !buffer.is_empty() {
                                flush(&raw, &waiters, &mut buffer, &mut linger);
                            }
                        }
                    }
                }
            }
        });

        Self { sender: tx, waiters }
    }

    /// Registers a waiter, enqueues `command` for the next flush, and
    /// returns the receiver that resolves once the apply pipeline finishes
    /// processing the entry it ends up batched into. If the node loses
    /// leadership or the propose call to Raft itself fails, the waiter
    /// resolves with an error as soon as that's known rather than hanging.
    pub fn propose(&self, command: Command) -> oneshot::Receiver<CResult<Applied>> {
        let (seq, rx) = self.waiters.register();
        if self.sender.send(Proposal { seq, command }).is_err() {
            self.waiters.complete(seq, Err(crate::error::Error::ProposalDropped));
        }
        rx
    }
}

fn flush(raw: &Arc<dyn RawProposer>, waiters: &Arc<WaiterArena>, buffer: &mut Vec<Proposal>, linger: &mut AdaptiveLinger) {
    if buffer.is_empty() {
        return;
    }
    linger.record(buffer.len());
    let batch = std::mem::take(buffer);
    if let Err(e) = encode_batch(&batch).and_then(|data| raw.propose_raw(data)) {
        for p in &batch {
            waiters.complete(p.seq, Err(crate::error::Error::Internal(e.to_string())));
        }
    }
    // On success, waiters stay pending: the apply pipeline completes them
    // once this entry is actually committed and applied, not merely
    // handed to `RawNode::propose`.
}
