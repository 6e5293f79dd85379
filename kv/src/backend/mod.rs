//! The backend state machine: the thing Raft-committed entries are applied
//! to. Exposes one [`Backend`] trait with two implementations, the way the
//! teacher's `storage::Engine` trait has `Memory` and `LogCask` sitting
//! side by side -- `memory` (a 512-shard in-memory map, for tests and small
//! clusters) and `sled` (an embedded LSM-tree, for anything that needs to
//! survive a restart without a snapshot).

pub mod memory;
pub mod sled_backend;

use crate::error::CResult;
use crate::revision::{Event, KeyValue, Revision};
use crate::txn::{TxnRequest, TxnResponse};

#[derive(Clone, Debug, Default)]
pub struct RangeOptions {
    pub range_end: Option<Vec<u8>>,
    pub revision: Revision,
    pub limit: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    pub count: i64,
}

/// A content digest of the whole keyspace as of a revision, used to detect
/// divergence between replicas (etcd's `HashKV`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyHash {
    pub revision: Revision,
    pub hash: u32,
}

/// The key/value state machine that Raft log entries are applied to.
/// Implementations own the revision counter: every call that mutates the
/// keyspace allocates exactly one new revision and returns the events it
/// produced, which the apply pipeline forwards to the watch engine.
pub trait Backend: Send + Sync {
    fn range(&self, key: &[u8], opts: RangeOptions) -> CResult<RangeResult>;

    fn put(&self, key: &[u8], value: &[u8], lease: i64, prev_kv: bool) -> CResult<(Revision, Option<KeyValue>, Event)>;

    fn delete_range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        prev_kv: bool,
    ) -> CResult<(Revision, i64, Vec<KeyValue>, Vec<Event>)>;

    /// Applies a Compare-Then-Else transaction atomically and returns the
    /// events produced by whichever branch ran (empty if it was read-only).
    fn txn(&self, req: &TxnRequest) -> CResult<(TxnResponse, Vec<Event>)>;

    /// Removes every key currently attached to `lease`, as one mutation at
    /// one new revision (mirrors etcd folding a lease expiry into a single
    /// `DeleteRange` per key batch).
    fn revoke_lease_keys(&self, lease: i64) -> CResult<(Revision, Vec<Event>)>;

    fn current_revision(&self) -> Revision;

    fn compacted_revision(&self) -> Revision;

    /// Drops all key history at or below `revision`. Current values are
    /// untouched; only historical versions become unreadable.
    fn compact(&self, revision: Revision) -> CResult<()>;

    fn hash_kv(&self, revision: Revision) -> CResult<KeyHash>;

    /// Serializes the entire current keyspace (used by the snapshot
    /// subsystem, not by clients).
    fn snapshot(&self) -> CResult<Vec<u8>>;

    fn restore(&self, data: &[u8]) -> CResult<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Shared behavioral suite for any `Backend`, the way the teacher's
    /// `test_engine!` macro exercises both `Memory` and `LogCask` with the
    /// same assertions.
    macro_rules! test_backend {
        ($setup:expr) => {
            #[test]
            fn put_then_range() {
                let b = $setup;
                let (rev, prev, _ev) = b.put(b"a", b"1", 0, true).unwrap();
                assert_eq!(rev, 1);
                assert!(prev.is_none());

                let r = b.range(b"a", Default::default()).unwrap();
                assert_eq!(r.kvs.len(), 1);
                assert_eq!(r.kvs[0].value, b"1");
                assert_eq!(r.kvs[0].create_revision, 1);
                assert_eq!(r.kvs[0].mod_revision, 1);
                assert_eq!(r.kvs[0].version, 1);
            }

            #[test]
            fn overwrite_bumps_mod_revision_and_version_not_create() {
                let b = $setup;
                b.put(b"a", b"1", 0, false).unwrap();
                let (rev2, prev, _ev) = b.put(b"a", b"2", 0, true).unwrap();
                assert_eq!(rev2, 2);
                assert_eq!(prev.unwrap().value, b"1");

                let r = b.range(b"a", Default::default()).unwrap();
                assert_eq!(r.kvs[0].create_revision, 1);
                assert_eq!(r.kvs[0].mod_revision, 2);
                assert_eq!(r.kvs[0].version, 2);
            }

            #[test]
            fn delete_then_recreate_resets_create_revision() {
                let b = $setup;
                b.put(b"a", b"1", 0, false).unwrap();
                let (_, n, _prev, _ev) = b.delete_range(b"a", None, false).unwrap();
                assert_eq!(n, 1);
                assert!(b.range(b"a", Default::default()).unwrap().kvs.is_empty());

                b.put(b"a", b"2", 0, false).unwrap();
                let r = b.range(b"a", Default::default()).unwrap();
                assert_eq!(r.kvs[0].create_revision, r.kvs[0].mod_revision);
                assert_eq!(r.kvs[0].version, 1);
            }

            #[test]
            fn range_end_covers_a_span() {
                let b = $setup;
                for k in [b"a".as_slice(), b"b", b"c", b"d"] {
                    b.put(k, b"v", 0, false).unwrap();
                }
                let mut opts = RangeOptions::default();
                opts.range_end = Some(b"c".to_vec());
                let r = b.range(b"a", opts).unwrap();
                assert_eq!(r.kvs.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(), vec![
                    b"a".to_vec(),
                    b"b".to_vec(),
                ]);
            }

            #[test]
            fn txn_compare_guards_branch_selection() {
                use crate::txn::*;
                let b = $setup;
                b.put(b"a", b"1", 0, false).unwrap();

                let req = TxnRequest {
                    compare: vec![Compare {
                        key: b"a".to_vec(),
                        target: CompareTarget::Value,
                        result: CompareResult::Equal,
                        value: CompareValue::Bytes(b"1".to_vec()),
                    }],
                    success: vec![Op::Put { key: b"a".to_vec(), value: b"2".to_vec(), lease: 0, prev_kv: false }],
                    failure: vec![],
                };
                let (resp, events) = b.txn(&req).unwrap();
                assert!(resp.succeeded);
                assert_eq!(events.len(), 1);
                assert_eq!(b.range(b"a", Default::default()).unwrap().kvs[0].value, b"2");
            }

            #[test]
            fn revoke_lease_deletes_attached_keys_only() {
                let b = $setup;
                b.put(b"a", b"1", 7, false).unwrap();
                b.put(b"b", b"1", 0, false).unwrap();
                let (_, events) = b.revoke_lease_keys(7).unwrap();
                assert_eq!(events.len(), 1);
                assert!(b.range(b"a", Default::default()).unwrap().kvs.is_empty());
                assert!(!b.range(b"b", Default::default()).unwrap().kvs.is_empty());
            }

            #[test]
            fn compact_rejects_future_and_past_reads_consistently() {
                let b = $setup;
                b.put(b"a", b"1", 0, false).unwrap();
                b.put(b"a", b"2", 0, false).unwrap();
                b.compact(1).unwrap();
                assert_eq!(b.compacted_revision(), 1);

                let mut opts = RangeOptions::default();
                opts.revision = 1;
                assert!(b.range(b"a", opts).is_err());
            }
        };
    }

    pub(crate) use test_backend;
}
