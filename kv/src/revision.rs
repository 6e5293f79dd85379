//! The revisioned key/value data model: every mutating operation is
//! assigned one global, monotonically increasing [`Revision`], and each key
//! carries `{CreateRevision, ModRevision, Version}` metadata describing its
//! history, the way etcd's mvcc package does. This replaces the teacher's
//! per-transaction snapshot-isolation `Version` (see the old `mvcc` module)
//! with a single counter shared by the whole keyspace.

use serde_derive::{Deserialize, Serialize};

/// A global, strictly increasing counter. `0` is never a valid revision;
/// the store starts at revision `1` for its first mutation.
pub type Revision = i64;

/// One key's current (or historical) value, as stored and returned to
/// clients. Mirrors etcd's `mvccpb.KeyValue`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,

    /// The revision at which this key was created (the oldest revision
    /// still carrying this key's current "lifetime" -- reset whenever the
    /// key is deleted and re-created).
    pub create_revision: Revision,

    /// The revision of the most recent modification of this key.
    pub mod_revision: Revision,

    /// Incremented on every modification since `create_revision`; reset to
    /// 1 on (re-)creation, 0 meant only as a tombstone marker internally.
    pub version: i64,

    /// Lease ID this key is attached to, or 0 if none.
    pub lease: i64,
}

impl KeyValue {
    pub fn has_lease(&self) -> bool {
        self.lease != 0
    }
}

/// A single historical event applied to a key: a put (possibly an
/// overwrite) or a delete (tombstone, value empty).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventType,
    pub kv: KeyValue,
    /// The value the key held immediately before this event, if any
    /// (etcd calls this `prev_kv`).
    pub prev_kv: Option<KeyValue>,
}

/// Tracks the next revision to hand out and the oldest revision still
/// queryable (everything at or below `compacted` has been compacted away).
#[derive(Clone, Debug, Default)]
pub struct RevisionCounter {
    current: Revision,
    compacted: Revision,
}

impl RevisionCounter {
    pub fn new() -> Self {
        Self { current: 0, compacted: 0 }
    }

    pub fn restore(current: Revision, compacted: Revision) -> Self {
        Self { current, compacted }
    }

    pub fn current(&self) -> Revision {
        self.current
    }

    pub fn compacted(&self) -> Revision {
        self.compacted
    }

    /// Allocates the next revision for a mutating operation (a whole txn
    /// gets exactly one, regardless of how many keys it touches).
    pub fn next(&mut self) -> Revision {
        self.current += 1;
        self.current
    }

    pub fn set_compacted(&mut self, rev: Revision) {
        debug_assert!(rev <= self.current);
        self.compacted = rev;
    }

    /// Validates that `rev` is a legal read/watch revision: not compacted
    /// away, and not in the future.
    pub fn validate_read(&self, rev: Revision) -> crate::error::CResult<()> {
        use crate::error::Error;
        if rev > 0 && rev <= self.compacted {
            return Err(Error::CompactedOutOfRange { requested: rev, compacted: self.compacted });
        }
        if rev > self.current {
            return Err(Error::FutureRevision { requested: rev, current: self.current });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_monotonically() {
        let mut c = RevisionCounter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.current(), 2);
    }

    #[test]
    fn validate_read_rejects_compacted_and_future() {
        let mut c = RevisionCounter::new();
        c.next();
        c.next();
        c.set_compacted(1);
        assert!(c.validate_read(1).is_err());
        assert!(c.validate_read(5).is_err());
        assert!(c.validate_read(2).is_ok());
        assert!(c.validate_read(0).is_ok());
    }
}
