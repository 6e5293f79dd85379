//! Error type shared by every layer of the store: storage engines, the
//! revisioned key/value model, leases, watches, and the Raft proposal path.
//! Kept as a hand-rolled enum rather than `thiserror` so the library has no
//! macro-expansion dependency; `raftkv-cli` wraps these in `anyhow` at the
//! process boundary.

use std::fmt;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A compaction request, or a read at a revision, fell below the
    /// store's `CompactedRevision`.
    CompactedOutOfRange { requested: i64, compacted: i64 },

    /// A read or watch requested a revision newer than the store has
    /// applied yet.
    FutureRevision { requested: i64, current: i64 },

    LeaseNotFound(i64),

    LeaseExpired(i64),

    /// Proposal was not accepted because this node does not believe it is
    /// the leader. Carries a hint (peer URL) when known.
    NotLeader { hint: Option<String> },

    /// The proposal was dropped before it could be applied (leadership
    /// changed mid-flight, or the apply pipeline shut down).
    ProposalDropped,

    /// A snapshot install or compaction is already running.
    SnapshotInProgress,

    LimitExceeded(String),

    /// The caller's context was canceled before the operation finished.
    Canceled,

    /// The operation's deadline elapsed before it finished.
    DeadlineExceeded,

    Internal(String),

    Io(std::io::Error),

    Encode(String),

    Decode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CompactedOutOfRange { requested, compacted } => write!(
                f,
                "requested revision {} has been compacted, compacted revision is {}",
                requested, compacted
            ),
            Error::FutureRevision { requested, current } => write!(
                f,
                "requested revision {} is newer than current revision {}",
                requested, current
            ),
            Error::LeaseNotFound(id) => write!(f, "lease {} not found", id),
            Error::LeaseExpired(id) => write!(f, "lease {} expired", id),
            Error::NotLeader { hint } => match hint {
                Some(h) => write!(f, "not leader, try {}", h),
                None => write!(f, "not leader"),
            },
            Error::ProposalDropped => write!(f, "proposal dropped before it could be applied"),
            Error::SnapshotInProgress => write!(f, "a snapshot operation is already in progress"),
            Error::LimitExceeded(msg) => write!(f, "limit exceeded: {}", msg),
            Error::Canceled => write!(f, "operation canceled"),
            Error::DeadlineExceeded => write!(f, "deadline exceeded"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Encode(msg) => write!(f, "encode error: {}", msg),
            Error::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("poisoned lock: {}", e))
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(e: std::num::TryFromIntError) -> Self {
        Error::Internal(e.to_string())
    }
}
