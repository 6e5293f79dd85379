//! Cluster membership: the member list and the configuration changes that
//! mutate it. Witness capability is modeled as a flag on [`Member`], not a
//! separate type, per this crate's redesign decision (see DESIGN.md) to
//! avoid an `enum Member { Voter, Witness }` split that would force every
//! call site to match on node kind before it can do anything ID-based.

use serde_derive::{Deserialize, Serialize};

pub type MemberId = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub peer_urls: Vec<String>,
    pub name: String,

    /// A learner receives log entries but does not vote; promoted to a
    /// voter once caught up.
    pub is_learner: bool,

    /// A witness votes (so it counts toward quorum) but never applies
    /// entries to a backend and holds no keyspace of its own -- see
    /// spec.md's witness role. It is never also a learner.
    pub is_witness: bool,
}

impl Member {
    pub fn voter(id: MemberId, name: impl Into<String>, peer_urls: Vec<String>) -> Self {
        Self { id, peer_urls, name: name.into(), is_learner: false, is_witness: false }
    }

    pub fn learner(id: MemberId, name: impl Into<String>, peer_urls: Vec<String>) -> Self {
        Self { id, peer_urls, name: name.into(), is_learner: true, is_witness: false }
    }

    pub fn witness(id: MemberId, name: impl Into<String>, peer_urls: Vec<String>) -> Self {
        Self { id, peer_urls, name: name.into(), is_learner: false, is_witness: true }
    }

    /// Whether this member participates in the apply path (i.e. needs a
    /// live backend to apply committed entries to). Witnesses vote for
    /// quorum but skip application entirely.
    pub fn applies_entries(&self) -> bool {
        !self.is_witness
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChange {
    AddVoter(Member),
    AddLearner(Member),
    AddWitness(Member),
    Remove(MemberId),
    PromoteLearner(MemberId),
    UpdatePeerUrls { id: MemberId, peer_urls: Vec<String> },
}

#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    members: std::collections::HashMap<MemberId, Member>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, change: ConfChange) {
        match change {
            ConfChange::AddVoter(m) | ConfChange::AddLearner(m) | ConfChange::AddWitness(m) => {
                self.members.insert(m.id, m);
            }
            ConfChange::Remove(id) => {
                self.members.remove(&id);
            }
            ConfChange::PromoteLearner(id) => {
                if let Some(m) = self.members.get_mut(&id) {
                    m.is_learner = false;
                }
            }
            ConfChange::UpdatePeerUrls { id, peer_urls } => {
                if let Some(m) = self.members.get_mut(&id) {
                    m.peer_urls = peer_urls;
                }
            }
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Voters that count toward quorum: everyone except learners. Witnesses
    /// count here even though they never apply entries.
    pub fn voting_members(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| !m.is_learner)
    }

    pub fn is_single_voter(&self) -> bool {
        self.voting_members().count() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_counts_for_quorum_but_not_apply() {
        let mut cs = ClusterState::new();
        cs.apply(ConfChange::AddVoter(Member::voter(1, "n1", vec![])));
        cs.apply(ConfChange::AddWitness(Member::witness(2, "n2", vec![])));

        assert_eq!(cs.voting_members().count(), 2);
        assert!(!cs.get(2).unwrap().applies_entries());
        assert!(cs.get(1).unwrap().applies_entries());
    }

    #[test]
    fn promote_learner_makes_it_a_voter() {
        let mut cs = ClusterState::new();
        cs.apply(ConfChange::AddLearner(Member::learner(3, "n3", vec![])));
        assert_eq!(cs.voting_members().count(), 0);
        cs.apply(ConfChange::PromoteLearner(3));
        assert_eq!(cs.voting_members().count(), 1);
    }

    #[test]
    fn remove_drops_member() {
        let mut cs = ClusterState::new();
        cs.apply(ConfChange::AddVoter(Member::voter(1, "n1", vec![])));
        cs.apply(ConfChange::Remove(1));
        assert!(cs.get(1).is_none());
    }
}
