#![allow(non_camel_case_types)]

//! `raftkv` is a strongly consistent, replicated key-value store, wire- and
//! semantically-compatible with etcd's v3 data model: every mutation is
//! assigned a global [`revision::Revision`], keys carry
//! `{CreateRevision, ModRevision, Version}` history, and the whole
//! keyspace is replicated via Raft so that a quorum of nodes always agrees
//! on what has been applied.
//!
//! ## Layout
//!
//! - [`storage`] -- the byte-oriented [`storage::engine::Engine`] trait the
//!   teacher crate this was built from already had (`Memory`, `LogCask`);
//!   kept as the substrate the backend state machine could sit on for a
//!   single-node deployment.
//! - [`backend`] -- the actual state machine Raft-committed entries are
//!   applied to: [`backend::Backend`], with a 512-shard in-memory
//!   implementation and an embedded `sled` implementation.
//! - [`revision`] / [`txn`] / [`keycode`] -- the revisioned data model and
//!   Compare-Then-Else transaction semantics.
//! - [`lease`] -- lease grant/revoke/keepalive/TTL bookkeeping and expiry
//!   sweeping.
//! - [`watch`] -- range subscriptions over the revision stream.
//! - [`raft`] -- the proposal path (batch proposer), the apply pipeline,
//!   the waiter arena, and linearizable reads (ReadIndex / Lease Read).
//! - [`cluster`] -- membership and configuration changes, including the
//!   witness node role.
//! - [`snapshot`] -- snapshot framing, chunked transfer, and compaction
//!   watermark persistence.
//!
//! ## Getting started
//!
//! ```rust
//! use raftkv::backend::memory::MemoryBackend;
//! use raftkv::backend::Backend;
//!
//! let store = MemoryBackend::new();
//! let (revision, _prev, _event) = store.put(b"a", b"1", 0, false).unwrap();
//! assert_eq!(revision, 1);
//!
//! let result = store.range(b"a", Default::default()).unwrap();
//! assert_eq!(result.kvs[0].value, b"1");
//! ```

pub mod error;
pub mod storage;

pub mod backend;
pub mod cluster;
pub mod keycode;
pub mod lease;
pub mod raft;
pub mod revision;
pub mod snapshot;
pub mod txn;
pub mod watch;
