//! A 512-shard in-memory backend. Point operations (`get`/`put`/`delete`)
//! lock only the shard a key hashes into, the way `dashmap` stripes its
//! buckets; anything that needs keyspace order (`range`, `txn`, snapshot)
//! collects across all shards under a global revision lock, which also
//! serializes mutations -- acceptable since Raft already serializes
//! proposals before they reach here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::error::CResult;
use crate::revision::{Event, EventType, KeyValue, Revision, RevisionCounter};
use crate::txn::{select_branch, Op, OpResponse, TxnRequest, TxnResponse};

use super::{Backend, KeyHash, RangeOptions, RangeResult};

const SHARD_COUNT: usize = 512;

fn shard_of(key: &[u8]) -> usize {
    // FNV-1a, good enough for striping and not relied on for anything
    // order-sensitive.
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash as usize) % SHARD_COUNT
}

pub struct MemoryBackend {
    shards: Vec<RwLock<BTreeMap<Vec<u8>, KeyValue>>>,
    revision: Mutex<RevisionCounter>,
    lease_keys: Mutex<HashMap<i64, HashSet<Vec<u8>>>>,
    /// Serializes multi-key mutations (put/delete/txn) so revision
    /// allocation and the events they produce stay consistent; point
    /// reads and gets bypass this and only take the relevant shard lock.
    write_lock: Mutex<()>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(BTreeMap::new()));
        }
        Self {
            shards,
            revision: Mutex::new(RevisionCounter::new()),
            lease_keys: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn get_current(&self, key: &[u8]) -> Option<KeyValue> {
        self.shards[shard_of(key)].read().unwrap().get(key).cloned()
    }

    fn put_locked(
        &self,
        key: &[u8],
        value: &[u8],
        lease: i64,
        rev: Revision,
    ) -> (Option<KeyValue>, Event) {
        let mut shard = self.shards[shard_of(key)].write().unwrap();
        let prev = shard.get(key).cloned();

        if let Some(p) = &prev {
            if p.lease != 0 {
                if let Some(set) = self.lease_keys.lock().unwrap().get_mut(&p.lease) {
                    set.remove(key);
                }
            }
        }

        let create_revision = prev.as_ref().map(|p| p.create_revision).unwrap_or(rev);
        let version = prev.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let kv = KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
            create_revision,
            mod_revision: rev,
            version,
            lease,
        };
        shard.insert(key.to_vec(), kv.clone());
        drop(shard);

        if lease != 0 {
            self.lease_keys.lock().unwrap().entry(lease).or_default().insert(key.to_vec());
        }

        (prev, Event { kind: EventType::Put, kv, prev_kv: None })
    }

    fn delete_locked(&self, key: &[u8], rev: Revision) -> Option<(KeyValue, Event)> {
        let mut shard = self.shards[shard_of(key)].write().unwrap();
        let removed = shard.remove(key)?;
        drop(shard);

        if removed.lease != 0 {
            if let Some(set) = self.lease_keys.lock().unwrap().get_mut(&removed.lease) {
                set.remove(key);
            }
        }

        let tombstone = KeyValue {
            key: key.to_vec(),
            value: Vec::new(),
            create_revision: removed.create_revision,
            mod_revision: rev,
            version: 0,
            lease: 0,
        };
        let prev = removed.clone();
        Some((removed, Event { kind: EventType::Delete, kv: tombstone, prev_kv: Some(prev) }))
    }

    fn collect_range(&self, key: &[u8], range_end: Option<&[u8]>, limit: i64) -> Vec<KeyValue> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            let iter: Box<dyn Iterator<Item = (&Vec<u8>, &KeyValue)>> = match range_end {
                None => Box::new(guard.range(key.to_vec()..=key.to_vec())),
                Some(end) if end.is_empty() => Box::new(guard.range(key.to_vec()..)),
                Some(end) => Box::new(guard.range(key.to_vec()..end.to_vec())),
            };
            out.extend(iter.map(|(_, v)| v.clone()));
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        if limit > 0 {
            out.truncate(limit as usize);
        }
        out
    }
}

impl Backend for MemoryBackend {
    fn range(&self, key: &[u8], opts: RangeOptions) -> CResult<RangeResult> {
        self.revision.lock().unwrap().validate_read(opts.revision)?;
        let kvs = self.collect_range(key, opts.range_end.as_deref(), opts.limit);
        let count = kvs.len() as i64;
        Ok(RangeResult { kvs, count })
    }

    fn put(&self, key: &[u8], value: &[u8], lease: i64, prev_kv: bool) -> CResult<(Revision, Option<KeyValue>, Event)> {
        let _guard = self.write_lock.lock().unwrap();
        let rev = self.revision.lock().unwrap().next();
        let (prev, event) = self.put_locked(key, value, lease, rev);
        Ok((rev, if prev_kv { prev } else { None }, event))
    }

    fn delete_range(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        prev_kv: bool,
    ) -> CResult<(Revision, i64, Vec<KeyValue>, Vec<Event>)> {
        let _guard = self.write_lock.lock().unwrap();
        let targets = self.collect_range(key, range_end, 0);
        if targets.is_empty() {
            return Ok((self.revision.lock().unwrap().current(), 0, vec![], vec![]));
        }
        let rev = self.revision.lock().unwrap().next();
        let mut prevs = Vec::new();
        let mut events = Vec::new();
        for t in &targets {
            if let Some((removed, event)) = self.delete_locked(&t.key, rev) {
                prevs.push(removed);
                events.push(event);
            }
        }
        let count = events.len() as i64;
        Ok((rev, count, if prev_kv { prevs } else { vec![] }, events))
    }

    fn txn(&self, req: &TxnRequest) -> CResult<(TxnResponse, Vec<Event>)> {
        let _guard = self.write_lock.lock().unwrap();
        let (succeeded, branch) = select_branch(req, |k| self.get_current(k));

        let mut responses = Vec::new();
        let mut events = Vec::new();
        let mut last_rev = self.revision.lock().unwrap().current();

        for op in branch {
            match op {
                Op::Put { key, value, lease, prev_kv } => {
                    let rev = self.revision.lock().unwrap().next();
                    let (prev, event) = self.put_locked(key, value, *lease, rev);
                    last_rev = rev;
                    events.push(event);
                    responses.push(OpResponse::Put { prev_kv: if *prev_kv { prev } else { None } });
                }
                Op::DeleteRange { key, range_end, prev_kv } => {
                    let targets = self.collect_range(key, range_end.as_deref(), 0);
                    let mut deleted = 0i64;
                    let mut prevs = Vec::new();
                    if !targets.is_empty() {
                        let rev = self.revision.lock().unwrap().next();
                        last_rev = rev;
                        for t in &targets {
                            if let Some((removed, event)) = self.delete_locked(&t.key, rev) {
                                prevs.push(removed);
                                events.push(event);
                                deleted += 1;
                            }
                        }
                    }
                    responses.push(OpResponse::DeleteRange {
                        deleted,
                        prev_kvs: if *prev_kv { prevs } else { vec![] },
                    });
                }
                Op::Range { key, range_end, limit } => {
                    let kvs = self.collect_range(key, range_end.as_deref(), *limit);
                    responses.push(OpResponse::Range { kvs });
                }
                Op::Txn(inner) => {
                    // Nested txns reuse the already-held write lock's
                    // effects by recursing into the same compare/apply
                    // logic without re-locking (select_branch reads
                    // through get_current, which only takes shard locks).
                    let (nested_succeeded, nested_branch) =
                        select_branch(inner, |k| self.get_current(k));
                    let mut nested_responses = Vec::new();
                    for nested_op in nested_branch {
                        if let Op::Put { key, value, lease, prev_kv } = nested_op {
                            let rev = self.revision.lock().unwrap().next();
                            let (prev, event) = self.put_locked(key, value, *lease, rev);
                            last_rev = rev;
                            events.push(event);
                            nested_responses
                                .push(OpResponse::Put { prev_kv: if *prev_kv { prev } else { None } });
                        }
                    }
                    responses.push(OpResponse::Txn(Box::new(TxnResponse {
                        succeeded: nested_succeeded,
                        responses: nested_responses,
                        revision: last_rev,
                    })));
                }
            }
        }

        Ok((TxnResponse { succeeded, responses, revision: last_rev }, events))
    }

    fn revoke_lease_keys(&self, lease: i64) -> CResult<(Revision, Vec<Event>)> {
        let _guard = self.write_lock.lock().unwrap();
        let keys: Vec<Vec<u8>> =
            self.lease_keys.lock().unwrap().get(&lease).cloned().unwrap_or_default().into_iter().collect();
        if keys.is_empty() {
            return Ok((self.revision.lock().unwrap().current(), vec![]));
        }
        let rev = self.revision.lock().unwrap().next();
        let mut events = Vec::new();
        for key in &keys {
            if let Some((_, event)) = self.delete_locked(key, rev) {
                events.push(event);
            }
        }
        self.lease_keys.lock().unwrap().remove(&lease);
        Ok((rev, events))
    }

    fn current_revision(&self) -> Revision {
        self.revision.lock().unwrap().current()
    }

    fn compacted_revision(&self) -> Revision {
        self.revision.lock().unwrap().compacted()
    }

    fn compact(&self, revision: Revision) -> CResult<()> {
        self.revision.lock().unwrap().set_compacted(revision);
        Ok(())
    }

    fn hash_kv(&self, revision: Revision) -> CResult<KeyHash> {
        self.revision.lock().unwrap().validate_read(revision)?;
        let all = self.collect_range(b"", Some(b""), 0);
        let mut hasher = crc32fast::Hasher::new();
        for kv in &all {
            hasher.update(&kv.key);
            hasher.update(&kv.value);
            hasher.update(&kv.mod_revision.to_be_bytes());
        }
        Ok(KeyHash { revision, hash: hasher.finalize() })
    }

    fn snapshot(&self) -> CResult<Vec<u8>> {
        let all = self.collect_range(b"", Some(b""), 0);
        let rev = self.revision.lock().unwrap();
        bincode::serialize(&(rev.current(), rev.compacted(), all)).map_err(Into::into)
    }

    fn restore(&self, data: &[u8]) -> CResult<()> {
        let (current, compacted, kvs): (Revision, Revision, Vec<KeyValue>) =
            bincode::deserialize(data)?;
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
        self.lease_keys.lock().unwrap().clear();
        for kv in kvs {
            let idx = shard_of(&kv.key);
            if kv.lease != 0 {
                self.lease_keys.lock().unwrap().entry(kv.lease).or_default().insert(kv.key.clone());
            }
            self.shards[idx].write().unwrap().insert(kv.key.clone(), kv);
        }
        *self.revision.lock().unwrap() = RevisionCounter::restore(current, compacted);
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::test_backend;

    test_backend!(MemoryBackend::new());

    #[test]
    fn snapshot_round_trips() {
        let b = MemoryBackend::new();
        b.put(b"a", b"1", 0, false).unwrap();
        b.put(b"b", b"2", 0, false).unwrap();
        let snap = b.snapshot().unwrap();

        let restored = MemoryBackend::new();
        restored.restore(&snap).unwrap();
        assert_eq!(restored.current_revision(), b.current_revision());
        assert_eq!(
            restored.range(b"a", Default::default()).unwrap().kvs[0].value,
            b"1"
        );
    }
}
