//! Learner: tallies acceptor votes and detects the decision.

use std::collections::BTreeSet;

use tracing::{debug, info, trace, warn};

use crate::messages::{Message, MessageBody, NodeId, ProposalId, Value};
use crate::network::Network;
use crate::node::{Identity, MessageHandler};
use crate::quorum::VoteTally;

/// Vote aggregator for the single decree.
///
/// A value is learned once one specific `(proposal, value)` pair has been
/// reported by a quorum of distinct acceptors. The decision is write-once.
pub struct Learner<V> {
    identity: Identity,
    network: Network<V>,
    acceptors: BTreeSet<NodeId>,
    tally: VoteTally<V>,
    learned: Option<(ProposalId, V)>,
}

impl<V: Value> Learner<V> {
    #[must_use]
    pub fn new(
        id: NodeId,
        acceptors: impl IntoIterator<Item = NodeId>,
        network: Network<V>,
    ) -> Self {
        let acceptors: BTreeSet<NodeId> = acceptors.into_iter().collect();
        let tally = VoteTally::new(acceptors.len());
        Self {
            identity: Identity::new(id),
            network,
            acceptors,
            tally,
            learned: None,
        }
    }

    #[must_use]
    pub fn is_learned(&self) -> bool {
        self.learned.is_some()
    }

    #[must_use]
    pub fn learned_value(&self) -> Option<&V> {
        self.learned.as_ref().map(|(_, value)| value)
    }

    /// The decided `(proposal, value)` pair.
    #[must_use]
    pub fn learned(&self) -> Option<&(ProposalId, V)> {
        self.learned.as_ref()
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.tally.quorum()
    }

    /// Distinct acceptors that reported `(proposal, value)`.
    ///
    /// Always 0 after the decision, when the tally has been released.
    #[must_use]
    pub fn votes_for(&self, proposal: &ProposalId, value: &V) -> usize {
        self.tally.votes_for(proposal, value)
    }

    /// Count one LEARN vote from acceptor `from`.
    pub fn learn(&mut self, from: NodeId, proposal: ProposalId, value: V) {
        if self.learned.is_some() {
            trace!(node = %self.id(), %from, %proposal, "already decided, ignoring");
            return;
        }
        if !self.acceptors.contains(&from) {
            warn!(node = %self.id(), %from, %proposal, "vote from unknown acceptor");
            return;
        }

        let (count, reached) = self.tally.record(&proposal, value.clone(), from.clone());
        debug!(node = %self.id(), %from, %proposal, ?value, count, "vote recorded");

        if reached {
            info!(node = %self.id(), %proposal, ?value, "consensus reached");
            self.learned = Some((proposal, value));
            // No vote can change the outcome any more.
            self.tally.clear();
        }
    }
}

impl<V: Value> MessageHandler<V> for Learner<V> {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn identity_mut(&mut self) -> &mut Identity {
        &mut self.identity
    }

    fn network(&self) -> &Network<V> {
        &self.network
    }

    fn handle(&mut self, message: Message<V>) {
        let (from, body) = message.into_parts();
        match body {
            MessageBody::Learn { proposal, value } => self.learn(from, proposal, value),
            other @ (MessageBody::Prepare { .. }
            | MessageBody::Promise { .. }
            | MessageBody::Accept { .. }
            | MessageBody::Accepted { .. }) => {
                warn!(
                    node = %self.id(),
                    %from,
                    kind = other.kind(),
                    "unexpected message for learner"
                );
            }
        }
    }
}
