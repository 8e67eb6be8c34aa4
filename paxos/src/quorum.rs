//! Quorum tracking utilities shared between proposer and learner

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::messages::{NodeId, ProposalId};

/// Smallest majority of `num_acceptors`.
#[must_use]
pub fn quorum_size(num_acceptors: usize) -> usize {
    num_acceptors / 2 + 1
}

/// Tallies distinct voters per `(proposal, value)` pair and detects quorum.
///
/// Pairs are counted independently: votes for a different id or a different
/// value never contribute to each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoteTally<V> {
    votes: BTreeMap<(ProposalId, V), BTreeSet<NodeId>>,
    quorum: usize,
}

impl<V: Ord + Clone> VoteTally<V> {
    #[must_use]
    pub fn new(num_acceptors: usize) -> Self {
        Self {
            votes: BTreeMap::new(),
            quorum: quorum_size(num_acceptors),
        }
    }

    /// Record `voter` for `(proposal, value)`.
    ///
    /// Returns the number of distinct voters for the pair after recording,
    /// and whether that number has reached quorum. Repeated votes from the
    /// same voter are not counted twice.
    pub fn record(&mut self, proposal: &ProposalId, value: V, voter: NodeId) -> (usize, bool) {
        let voters = self.votes.entry((proposal.clone(), value)).or_default();
        voters.insert(voter);
        let count = voters.len();
        trace!(%proposal, count, quorum = self.quorum, "tracking vote");
        (count, count >= self.quorum)
    }

    /// Number of distinct voters recorded for `(proposal, value)`.
    #[must_use]
    pub fn votes_for(&self, proposal: &ProposalId, value: &V) -> usize {
        self.votes
            .get(&(proposal.clone(), value.clone()))
            .map_or(0, BTreeSet::len)
    }

    /// Drop every tallied pair.
    pub fn clear(&mut self) {
        self.votes.clear();
    }

    /// Number of distinct `(proposal, value)` pairs being tallied.
    #[must_use]
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn pid(round: u64) -> ProposalId {
        ProposalId::new(round, "P1")
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn duplicate_voter_is_counted_once() {
        let mut tally = VoteTally::new(3);
        assert_eq!(tally.record(&pid(1), "x", id("A1")), (1, false));
        assert_eq!(tally.record(&pid(1), "x", id("A1")), (1, false));
        assert_eq!(tally.record(&pid(1), "x", id("A2")), (2, true));
    }

    #[test]
    fn pairs_are_tallied_separately() {
        let mut tally = VoteTally::new(5);
        tally.record(&pid(1), "x", id("A1"));
        tally.record(&pid(2), "x", id("A2"));
        let (count, reached) = tally.record(&pid(1), "y", id("A3"));
        assert_eq!(count, 1);
        assert!(!reached);
        assert_eq!(tally.votes_for(&pid(1), &"x"), 1);
        assert_eq!(tally.len(), 3);

        tally.clear();
        assert!(tally.is_empty());
    }
}
