//! An embedded, LSM-tree-backed [`Backend`], for nodes that want the
//! keyspace to survive a restart without replaying a snapshot from a peer.
//! Built on `sled`, the crate several repos in the retrieval pack reach for
//! when they need a persistent sorted map (see DESIGN.md). Keys are stored
//! verbatim in `sled`'s own tree (which already preserves byte order), so
//! unlike [`MemoryBackend`](super::memory::MemoryBackend) there is no
//! custom sharding -- `sled` does its own internal striping.
//!
//! All mutations serialize on one lock, mirroring the teacher's
//! `storage::Engine` design note that "serialized access can't be avoided
//! anyway, since both Raft execution and file access is serial."

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{CResult, Error};
use crate::revision::{Event, EventType, KeyValue, Revision, RevisionCounter};
use crate::txn::{select_branch, Op, OpResponse, TxnRequest, TxnResponse};

use super::{Backend, KeyHash, RangeOptions, RangeResult};

const META_CURRENT: &[u8] = b"current";
const META_COMPACTED: &[u8] = b"compacted";

pub struct SledBackend {
    kv: sled::Tree,
    meta: sled::Tree,
    revision: Mutex<RevisionCounter>,
    lease_keys: Mutex<HashMap<i64, HashSet<Vec<u8>>>>,
    write_lock: Mutex<()>,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> CResult<Self> {
        let db = sled::open(path).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Self::from_db(db)
    }

    pub fn temporary() -> CResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> CResult<Self> {
        let kv = db.open_tree("kv").map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let meta =
            db.open_tree("meta").map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let current = read_i64(&meta, META_CURRENT)?.unwrap_or(0);
        let compacted = read_i64(&meta, META_COMPACTED)?.unwrap_or(0);

        let mut lease_keys: HashMap<i64, HashSet<Vec<u8>>> = HashMap::new();
        for item in kv.iter() {
            let (key, raw) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            let kv_rec: KeyValue = bincode::deserialize(&raw)?;
            if kv_rec.lease != 0 {
                lease_keys.entry(kv_rec.lease).or_default().insert(key.to_vec());
            }
        }

        Ok(Self {
            kv,
            meta,
            revision: Mutex::new(RevisionCounter::restore(current, compacted)),
            lease_keys: Mutex::new(lease_keys),
            write_lock: Mutex::new(()),
        })
    }

    fn persist_revision(&self) -> CResult<()> {
        let rev = self.revision.lock().unwrap();
        write_i64(&self.meta, META_CURRENT, rev.current())?;
        write_i64(&self.meta, META_COMPACTED, rev.compacted())?;
        Ok(())
    }

    fn get_current(&self, key: &[u8]) -> Option<KeyValue> {
        let raw = self.kv.get(key).ok()??;
        bincode::deserialize(&raw).ok()
    }

    fn store(&self, key: &[u8], kv: &KeyValue) -> CResult<()> {
        let bytes = bincode::serialize(kv)?;
        self.kv.insert(key, bytes).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    fn put_locked(&self, key: &[u8], value: &[u8], lease: i64, rev: Revision) -> CResult<(Option<KeyValue>, Event)> {
        let prev = self.get_current(key);
        if let Some(p) = &prev {
            if p.lease != 0 {
                if let Some(set) = self.lease_keys.lock().unwrap().get_mut(&p.lease) {
                    set.remove(key);
                }
            }
        }
        let create_revision = prev.as_ref().map(|p| p.create_revision).unwrap_or(rev);
        let version = prev.as_ref().map(|p| p.version + 1).unwrap_or(1);
        let kv = KeyValue { key: key.to_vec(), value: value.to_vec(), create_revision, mod_revision: rev, version, lease };
        self.store(key, &kv)?;
        if lease != 0 {
            self.lease_keys.lock().unwrap().entry(lease).or_default().insert(key.to_vec());
        }
        Ok((prev, Event { kind: EventType::Put, kv, prev_kv: None }))
    }

    fn delete_locked(&self, key: &[u8], rev: Revision) -> CResult<Option<(KeyValue, Event)>> {
        let removed = match self.get_current(key) {
            Some(kv) => kv,
            None => return Ok(None),
        };
        self.kv.remove(key).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
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
        Ok(Some((removed, Event { kind: EventType::Delete, kv: tombstone, prev_kv: Some(prev) })))
    }

    fn collect_range(&self, key: &[u8], range_end: Option<&[u8]>, limit: i64) -> CResult<Vec<KeyValue>> {
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = match range_end {
            None => Box::new(self.kv.range(key.to_vec()..=key.to_vec())),
            Some(end) if end.is_empty() => Box::new(self.kv.range(key.to_vec()..)),
            Some(end) => Box::new(self.kv.range(key.to_vec()..end.to_vec())),
        };
        let mut out = Vec::new();
        for item in iter {
            let (_, raw) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            out.push(bincode::deserialize::<KeyValue>(&raw)?);
            if limit > 0 && out.len() as i64 >= limit {
                break;
            }
        }
        Ok(out)
    }
}

fn read_i64(tree: &sled::Tree, key: &[u8]) -> CResult<Option<i64>> {
    match tree.get(key).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))? {
        Some(raw) => {
            let arr: [u8; 8] = raw.as_ref().try_into().map_err(|_| Error::Decode("bad meta i64".into()))?;
            Ok(Some(i64::from_be_bytes(arr)))
        }
        None => Ok(None),
    }
}

fn write_i64(tree: &sled::Tree, key: &[u8], value: i64) -> CResult<()> {
    tree.insert(key, &value.to_be_bytes())
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(())
}

impl Backend for SledBackend {
    fn range(&self, key: &[u8], opts: RangeOptions) -> CResult<RangeResult> {
        self.revision.lock().unwrap().validate_read(opts.revision)?;
        let kvs = self.collect_range(key, opts.range_end.as_deref(), opts.limit)?;
        let count = kvs.len() as i64;
        Ok(RangeResult { kvs, count })
    }

    fn put(&self, key: &[u8], value: &[u8], lease: i64, prev_kv: bool) -> CResult<(Revision, Option<KeyValue>, Event)> {
        let _guard = self.write_lock.lock().unwrap();
        let rev = self.revision.lock().unwrap().next();
        let (prev, event) = self.put_locked(key, value, lease, rev)?;
        self.persist_revision()?;
        Ok((rev, if prev_kv { prev } else { None }, event))
    }

    fn delete_range(&self, key: &[u8], range_end: Option<&[u8]>, prev_kv: bool) -> CResult<(Revision, i64, Vec<KeyValue>, Vec<Event>)> {
        let _guard = self.write_lock.lock().unwrap();
        let targets = self.collect_range(key, range_end, 0)?;
        if targets.is_empty() {
            return Ok((self.revision.lock().unwrap().current(), 0, vec![], vec![]));
        }
        let rev = self.revision.lock().unwrap().next();
        let mut prevs = Vec::new();
        let mut events = Vec::new();
        for t in &targets {
            if let Some((removed, event)) = self.delete_locked(&t.key, rev)? {
                prevs.push(removed);
                events.push(event);
            }
        }
        self.persist_revision()?;
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
                    let (prev, event) = self.put_locked(key, value, *lease, rev)?;
                    last_rev = rev;
                    events.push(event);
                    responses.push(OpResponse::Put { prev_kv: if *prev_kv { prev } else { None } });
                }
                Op::DeleteRange { key, range_end, prev_kv } => {
                    let targets = self.collect_range(key, range_end.as_deref(), 0)?;
                    let mut deleted = 0i64;
                    let mut prevs = Vec::new();
                    if !targets.is_empty() {
                        let rev = self.revision.lock().unwrap().next();
                        last_rev = rev;
                        for t in &targets {
                            if let Some((removed, event)) = self.delete_locked(&t.key, rev)? {
                                prevs.push(removed);
                                events.push(event);
                                deleted += 1;
                            }
                        }
                    }
                    responses.push(OpResponse::DeleteRange { deleted, prev_kvs: if *prev_kv { prevs } else { vec![] } });
                }
                Op::Range { key, range_end, limit } => {
                    let kvs = self.collect_range(key, range_end.as_deref(), *limit)?;
                    responses.push(OpResponse::Range { kvs });
                }
                Op::Txn(_) => {
                    return Err(Error::Internal("nested txns are not supported by the sled backend".into()));
                }
            }
        }

        self.persist_revision()?;
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
            if let Some((_, event)) = self.delete_locked(key, rev)? {
                events.push(event);
            }
        }
        self.lease_keys.lock().unwrap().remove(&lease);
        self.persist_revision()?;
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
        self.persist_revision()
    }

    fn hash_kv(&self, revision: Revision) -> CResult<KeyHash> {
        self.revision.lock().unwrap().validate_read(revision)?;
        let mut hasher = crc32fast::Hasher::new();
        for item in self.kv.iter() {
            let (key, raw) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            let kv: KeyValue = bincode::deserialize(&raw)?;
            hasher.update(&key);
            hasher.update(&kv.value);
            hasher.update(&kv.mod_revision.to_be_bytes());
        }
        Ok(KeyHash { revision, hash: hasher.finalize() })
    }

    fn snapshot(&self) -> CResult<Vec<u8>> {
        let mut all = Vec::new();
        for item in self.kv.iter() {
            let (_, raw) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            all.push(bincode::deserialize::<KeyValue>(&raw)?);
        }
        let rev = self.revision.lock().unwrap();
        bincode::serialize(&(rev.current(), rev.compacted(), all)).map_err(Into::into)
    }

    fn restore(&self, data: &[u8]) -> CResult<()> {
        let (current, compacted, kvs): (Revision, Revision, Vec<KeyValue>) = bincode::deserialize(data)?;
        self.kv.clear().map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.lease_keys.lock().unwrap().clear();
        for kv in kvs {
            if kv.lease != 0 {
                self.lease_keys.lock().unwrap().entry(kv.lease).or_default().insert(kv.key.clone());
            }
            self.store(&kv.key, &kv)?;
        }
        *self.revision.lock().unwrap() = RevisionCounter::restore(current, compacted);
        self.persist_revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::test_backend;

    test_backend!(SledBackend::temporary().unwrap());

    #[test]
    fn reopen_rebuilds_lease_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let b = SledBackend::open(dir.path()).unwrap();
            b.put(b"a", b"1", 9, false).unwrap();
        }
        let b = SledBackend::open(dir.path()).unwrap();
        let (_, events) = b.revoke_lease_keys(9).unwrap();
        assert_eq!(events.len(), 1);
    }
}
