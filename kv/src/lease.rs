//! The lease engine: grant/revoke/keepalive/list/time-to-live bookkeeping,
//! plus the expiry sweep that turns a lapsed deadline into a proposal.
//! Deadlines are tracked with [`std::time::Instant`] (monotonic, so a
//! system clock step can't resurrect or kill a lease early) and the
//! sweeper itself is deliberately *not* Raft-aware: it hands expired lease
//! ids to a caller-supplied proposer closure, matching the rest of this
//! crate's pattern of keeping consensus plumbing out of the domain types
//! (see `raft::apply`, which owns the other side of that boundary).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{CResult, Error};

#[derive(Clone, Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: std::collections::HashSet<Vec<u8>>,
}

pub struct LeaseEngine {
    leases: Mutex<HashMap<i64, LeaseState>>,
}

impl LeaseEngine {
    pub fn new() -> Self {
        Self { leases: Mutex::new(HashMap::new()) }
    }

    /// Grants a new lease with the given TTL (seconds), returning its id.
    /// Ids are random positive `i64`s, like etcd's, to keep them stable
    /// across a lease moving between members of a cluster.
    pub fn grant(&self, ttl_secs: i64) -> CResult<i64> {
        self.grant_with_id(rand::thread_rng().gen_range(1..i64::MAX), ttl_secs)
    }

    /// Grants a lease with a caller-chosen id. Used when replaying a
    /// committed `LeaseGrant` entry, where the id was already decided by
    /// whichever node proposed it.
    pub fn grant_with_id(&self, id: i64, ttl_secs: i64) -> CResult<i64> {
        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        let mut leases = self.leases.lock()?;
        leases.insert(id, LeaseState { ttl, deadline: Instant::now() + ttl, keys: Default::default() });
        Ok(id)
    }

    pub fn revoke(&self, id: i64) -> CResult<()> {
        let mut leases = self.leases.lock()?;
        leases.remove(&id).ok_or(Error::LeaseNotFound(id))?;
        Ok(())
    }

    /// Resets the lease's deadline to `now + ttl`. Returns the ttl so the
    /// client can learn it without a second round-trip.
    pub fn keepalive(&self, id: i64) -> CResult<i64> {
        let mut leases = self.leases.lock()?;
        let lease = leases.get_mut(&id).ok_or(Error::LeaseNotFound(id))?;
        lease.deadline = Instant::now() + lease.ttl;
        Ok(lease.ttl.as_secs() as i64)
    }

    pub fn time_to_live(&self, id: i64) -> CResult<i64> {
        let leases = self.leases.lock()?;
        let lease = leases.get(&id).ok_or(Error::LeaseNotFound(id))?;
        let now = Instant::now();
        if lease.deadline <= now {
            return Err(Error::LeaseExpired(id));
        }
        Ok((lease.deadline - now).as_secs() as i64)
    }

    pub fn list(&self) -> CResult<Vec<i64>> {
        Ok(self.leases.lock()?.keys().copied().collect())
    }

    pub fn attach_key(&self, id: i64, key: &[u8]) -> CResult<()> {
        let mut leases = self.leases.lock()?;
        let lease = leases.get_mut(&id).ok_or(Error::LeaseNotFound(id))?;
        lease.keys.insert(key.to_vec());
        Ok(())
    }

    pub fn detach_key(&self, id: i64, key: &[u8]) -> CResult<()> {
        if let Some(lease) = self.leases.lock()?.get_mut(&id) {
            lease.keys.remove(key);
        }
        Ok(())
    }

    /// Returns every lease id whose deadline has passed as of `now`,
    /// without removing them -- removal only happens once the resulting
    /// `LeaseRevoke` proposal is actually applied, so a lease that's
    /// "expired" but not yet revoked is still reported by `time_to_live`.
    pub fn expired(&self, now: Instant) -> CResult<Vec<i64>> {
        Ok(self.leases.lock()?.iter().filter(|(_, l)| l.deadline <= now).map(|(id, _)| *id).collect())
    }

    /// Called when this node becomes leader: extends every lease's
    /// deadline by its own ttl from *now*, rather than trusting whatever
    /// deadlines were computed relative to the previous leader's clock.
    /// This is the documented resolution of this crate's lease
    /// GrantTime-reset Open Question (see DESIGN.md): a lease never
    /// expires sooner than one full ttl after a leadership change.
    pub fn reset_deadlines_on_leader_change(&self) -> CResult<()> {
        let now = Instant::now();
        let mut leases = self.leases.lock()?;
        for lease in leases.values_mut() {
            lease.deadline = now + lease.ttl;
        }
        Ok(())
    }
}

impl Default for LeaseEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_keepalive_and_ttl() {
        let e = LeaseEngine::new();
        let id = e.grant(60).unwrap();
        assert!(e.time_to_live(id).unwrap() <= 60);
        assert_eq!(e.keepalive(id).unwrap(), 60);
    }

    #[test]
    fn revoke_unknown_lease_errors() {
        let e = LeaseEngine::new();
        assert!(matches!(e.revoke(42), Err(Error::LeaseNotFound(42))));
    }

    #[test]
    fn expired_reports_without_removing() {
        let e = LeaseEngine::new();
        let id = e.grant_with_id(1, 1).unwrap();
        let future = Instant::now() + Duration::from_secs(2);
        assert_eq!(e.expired(future).unwrap(), vec![id]);
        // Still listed until the revoke proposal actually applies.
        assert!(e.list().unwrap().contains(&id));
    }

    #[test]
    fn leader_change_extends_deadlines() {
        let e = LeaseEngine::new();
        let id = e.grant_with_id(1, 5).unwrap();
        e.reset_deadlines_on_leader_change().unwrap();
        assert!(e.time_to_live(id).unwrap() > 0);
    }
}
