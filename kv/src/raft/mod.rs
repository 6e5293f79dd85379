//! The Raft-backed proposal and apply path: everything between "a client
//! asked to mutate the keyspace" and "the mutation is durable on a quorum
//! and visible to readers." Built on `raft` (tikv/raft-rs), the consensus
//! core the retrieval pack's TiKV-family example depends on (see
//! DESIGN.md) -- this crate only uses its `RawNode` state machine and
//! leaves transport (sending `Message`s between peers) as a collaborator
//! trait, the same way spec.md keeps wire frontends out of scope.

pub mod apply;
pub mod node;
pub mod proposal;
pub mod readindex;
pub mod waiter;

use serde_derive::{Deserialize, Serialize};

use crate::cluster::ConfChange;
use crate::txn::TxnRequest;

/// One proposable unit of work. A `BatchProposer`-flushed Raft entry
/// decodes into one or more of these (see `proposal::BATCH_MAGIC`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Txn(TxnRequest),
    LeaseGrant { id: i64, ttl_secs: i64 },
    LeaseRevoke { id: i64 },
    ConfChange(ConfChange),
}

/// Wraps a `Command` with the sequence number the waiter arena uses to
/// route the applied result back to whichever `propose` call is awaiting
/// it. Only meaningful on the node that proposed it -- `seq` has no
/// significance to peers replicating the entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub seq: u64,
    pub command: Command,
}
