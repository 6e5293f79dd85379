//! Compare-Then-Else transactions, evaluated against the revisioned KV
//! model in [`crate::revision`]. Mirrors etcd's `Txn` RPC: a list of
//! [`Compare`] guards, a `success` branch of [`Op`]s run when every guard
//! holds, and a `failure` branch run otherwise.

use serde_derive::{Deserialize, Serialize};

use crate::revision::KeyValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareTarget {
    Version,
    CreateRevision,
    ModRevision,
    Value,
    Lease,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareResult {
    Equal,
    Greater,
    Less,
    NotEqual,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareValue {
    Int(i64),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    pub target: CompareTarget,
    pub result: CompareResult,
    pub value: CompareValue,
}

impl Compare {
    /// Evaluates this guard against the current state of `key`, where
    /// `current` is `None` when the key does not exist. A missing key
    /// compares as all-zero metadata, matching etcd (so `CreateRevision ==
    /// 0` is the idiomatic "key does not exist" guard).
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        let actual = match self.target {
            CompareTarget::Version => {
                CompareValue::Int(current.map(|kv| kv.version).unwrap_or(0))
            }
            CompareTarget::CreateRevision => {
                CompareValue::Int(current.map(|kv| kv.create_revision).unwrap_or(0))
            }
            CompareTarget::ModRevision => {
                CompareValue::Int(current.map(|kv| kv.mod_revision).unwrap_or(0))
            }
            CompareTarget::Lease => CompareValue::Int(current.map(|kv| kv.lease).unwrap_or(0)),
            CompareTarget::Value => {
                CompareValue::Bytes(current.map(|kv| kv.value.clone()).unwrap_or_default())
            }
        };

        let ordering = match (&actual, &self.value) {
            (CompareValue::Int(a), CompareValue::Int(b)) => a.cmp(b),
            (CompareValue::Bytes(a), CompareValue::Bytes(b)) => a.cmp(b),
            // Mismatched target/value kinds can never match the guard.
            _ => return false,
        };

        match self.result {
            CompareResult::Equal => ordering.is_eq(),
            CompareResult::NotEqual => ordering.is_ne(),
            CompareResult::Greater => ordering.is_gt(),
            CompareResult::Less => ordering.is_lt(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64, prev_kv: bool },
    Range { key: Vec<u8>, range_end: Option<Vec<u8>>, limit: i64 },
    DeleteRange { key: Vec<u8>, range_end: Option<Vec<u8>>, prev_kv: bool },
    Txn(Box<TxnRequest>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResponse {
    Put { prev_kv: Option<KeyValue> },
    Range { kvs: Vec<KeyValue> },
    DeleteRange { deleted: i64, prev_kvs: Vec<KeyValue> },
    Txn(Box<TxnResponse>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
    pub revision: i64,
}

/// Evaluates the compare list against a lookup function and returns which
/// branch ([`TxnRequest::success`] or [`TxnRequest::failure`]) should run.
/// Lookups are supplied by the caller so this stays storage-agnostic: the
/// backend applies the request under its own lock and decides what "the
/// current value of `key`" means.
pub fn select_branch<'a>(
    req: &'a TxnRequest,
    lookup: impl Fn(&[u8]) -> Option<KeyValue>,
) -> (bool, &'a [Op]) {
    let succeeded = req.compare.iter().all(|c| c.evaluate(lookup(&c.key).as_ref()));
    if succeeded {
        (true, &req.success)
    } else {
        (false, &req.failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(version: i64, create: i64, modr: i64, value: &[u8]) -> KeyValue {
        KeyValue {
            key: b"k".to_vec(),
            value: value.to_vec(),
            create_revision: create,
            mod_revision: modr,
            version,
            lease: 0,
        }
    }

    #[test]
    fn missing_key_compares_as_zero_create_revision() {
        let cmp = Compare {
            key: b"k".to_vec(),
            target: CompareTarget::CreateRevision,
            result: CompareResult::Equal,
            value: CompareValue::Int(0),
        };
        assert!(cmp.evaluate(None));
    }

    #[test]
    fn value_compare_respects_bytes() {
        let cmp = Compare {
            key: b"k".to_vec(),
            target: CompareTarget::Value,
            result: CompareResult::Equal,
            value: CompareValue::Bytes(b"v1".to_vec()),
        };
        assert!(cmp.evaluate(Some(&kv(1, 1, 1, b"v1"))));
        assert!(!cmp.evaluate(Some(&kv(1, 1, 1, b"v2"))));
    }

    #[test]
    fn select_branch_runs_failure_when_any_guard_fails() {
        let req = TxnRequest {
            compare: vec![Compare {
                key: b"k".to_vec(),
                target: CompareTarget::Version,
                result: CompareResult::Greater,
                value: CompareValue::Int(5),
            }],
            success: vec![Op::Put { key: b"k".to_vec(), value: vec![], lease: 0, prev_kv: false }],
            failure: vec![Op::Range { key: b"k".to_vec(), range_end: None, limit: 1 }],
        };
        let (ok, branch) = select_branch(&req, |_| Some(kv(1, 1, 1, b"")));
        assert!(!ok);
        assert_eq!(branch.len(), 1);
        assert!(matches!(branch[0], Op::Range { .. }));
    }
}
