//! Proposer implementation
//!
//! A proposer drives one round at a time through both phases:
//!
//! 1. [`Proposer::start_proposal`] picks a fresh proposal id and sends
//!    PREPARE to every acceptor.
//! 2. Once a quorum of distinct acceptors has promised that id, it sends
//!    ACCEPT with either the highest previously accepted value reported in
//!    those promises or its own current value, and goes idle again.
//!
//! Deciding is left to the learners. A round that never gathers a quorum
//! stalls in the preparing phase; only an explicit rejection (a PROMISE
//! carrying a higher id) ends it early.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, trace, warn};

use crate::messages::{Message, MessageBody, NodeId, ProposalId, Value};
use crate::network::Network;
use crate::node::{Identity, MessageHandler};
use crate::quorum::quorum_size;

/// Proposer phase
#[derive(Clone, Debug, PartialEq, Eq)]
enum ProposerPhase<V> {
    /// No round in flight.
    Idle,
    /// Collecting promises for the current proposal.
    Preparing {
        /// Value captured when the round started
        value: V,
        /// Acceptor id -> accepted pair reported in its promise
        promises: BTreeMap<NodeId, Option<(ProposalId, V)>>,
    },
}

/// Phase 1 / phase 2 initiator.
pub struct Proposer<V> {
    identity: Identity,
    network: Network<V>,
    acceptors: Vec<NodeId>,
    quorum: usize,
    round: u64,
    current_proposal: Option<ProposalId>,
    current_value: V,
    phase: ProposerPhase<V>,
    highest_accepted: Option<(ProposalId, V)>,
    highest_seen: Option<ProposalId>,
    last_accept: Option<(ProposalId, V)>,
    accepted_by: BTreeSet<NodeId>,
}

impl<V: Value> Proposer<V> {
    /// Create an idle proposer.
    ///
    /// Its proposal ids are `(round, id)` pairs, so any node id works and ids
    /// of different proposers never collide.
    #[must_use]
    pub fn new(
        id: NodeId,
        acceptors: Vec<NodeId>,
        initial_value: V,
        network: Network<V>,
    ) -> Self {
        let quorum = quorum_size(acceptors.len());
        Self {
            identity: Identity::new(id),
            network,
            acceptors,
            quorum,
            round: 0,
            current_proposal: None,
            current_value: initial_value,
            phase: ProposerPhase::Idle,
            highest_accepted: None,
            highest_seen: None,
            last_accept: None,
            accepted_by: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_proposing(&self) -> bool {
        matches!(self.phase, ProposerPhase::Preparing { .. })
    }

    /// Id of the latest round started, if any.
    #[must_use]
    pub fn current_proposal(&self) -> Option<&ProposalId> {
        self.current_proposal.as_ref()
    }

    /// Value this proposer will offer in its next round.
    #[must_use]
    pub fn current_value(&self) -> &V {
        &self.current_value
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Number of distinct promises gathered for the round in flight.
    #[must_use]
    pub fn promises_received(&self) -> usize {
        match &self.phase {
            ProposerPhase::Preparing { promises, .. } => promises.len(),
            ProposerPhase::Idle => 0,
        }
    }

    /// Highest prior acceptance found in the last promise quorum.
    #[must_use]
    pub fn highest_accepted(&self) -> Option<&(ProposalId, V)> {
        self.highest_accepted.as_ref()
    }

    /// Highest proposal id an acceptor has rejected us with.
    #[must_use]
    pub fn highest_seen(&self) -> Option<&ProposalId> {
        self.highest_seen.as_ref()
    }

    /// The last `(proposal, value)` sent in ACCEPT.
    #[must_use]
    pub fn last_accept(&self) -> Option<&(ProposalId, V)> {
        self.last_accept.as_ref()
    }

    /// Acceptors that confirmed [`last_accept`](Self::last_accept).
    #[must_use]
    pub fn accepted_by_count(&self) -> usize {
        self.accepted_by.len()
    }

    /// Replace the value offered from the next round on.
    ///
    /// A round already in flight keeps the value captured when it started.
    pub fn set_value(&mut self, value: V) {
        debug!(node = %self.id(), ?value, "value updated");
        self.current_value = value;
    }

    /// Start a new round: pick a fresh proposal id and send PREPARE.
    ///
    /// Returns the new proposal id, or `None` without doing anything when a
    /// round is already in flight.
    pub fn start_proposal(&mut self) -> Option<ProposalId> {
        if self.is_proposing() {
            warn!(
                node = %self.id(),
                proposal = ?self.current_proposal,
                "already proposing, not starting a new round"
            );
            return None;
        }

        let proposal = self.next_proposal();
        self.current_proposal = Some(proposal.clone());
        self.highest_accepted = None;
        self.phase = ProposerPhase::Preparing {
            value: self.current_value.clone(),
            promises: BTreeMap::new(),
        };

        info!(node = %self.id(), %proposal, value = ?self.current_value, "starting proposal");
        self.network.broadcast(
            self.identity.id(),
            &self.acceptors,
            &MessageBody::Prepare {
                proposal: proposal.clone(),
            },
        );
        Some(proposal)
    }

    // Next round of ours that is above anything we were rejected with.
    fn next_proposal(&mut self) -> ProposalId {
        self.round += 1;
        if let Some(seen) = &self.highest_seen {
            self.round = self.round.max(seen.round + 1);
        }
        ProposalId::new(self.round, self.identity.id().clone())
    }

    fn on_promise(
        &mut self,
        from: NodeId,
        proposal: ProposalId,
        accepted: Option<(ProposalId, V)>,
    ) {
        let Some(current) = self.current_proposal.clone() else {
            trace!(node = %self.id(), %from, %proposal, "promise before any round, ignoring");
            return;
        };
        let ProposerPhase::Preparing {
            value: round_value,
            promises,
        } = &mut self.phase
        else {
            trace!(node = %self.identity.id(), %from, %proposal, "not proposing, ignoring promise");
            return;
        };

        if proposal > current {
            debug!(
                node = %self.identity.id(),
                %from,
                %current,
                promised = %proposal,
                "prepare rejected, abandoning round"
            );
            self.highest_seen = self.highest_seen.take().max(Some(proposal));
            self.phase = ProposerPhase::Idle;
            return;
        }
        if proposal < current {
            trace!(node = %self.identity.id(), %from, %proposal, "stale promise");
            return;
        }

        promises.insert(from, accepted);
        trace!(
            node = %self.identity.id(),
            %proposal,
            count = promises.len(),
            quorum = self.quorum,
            "promise recorded"
        );
        if promises.len() < self.quorum {
            return;
        }

        let highest_accepted = promises
            .values()
            .flatten()
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .cloned();
        let value = match &highest_accepted {
            Some((id, value)) => {
                info!(
                    node = %self.identity.id(),
                    %proposal,
                    accepted = %id,
                    ?value,
                    "adopting previously accepted value"
                );
                value.clone()
            }
            None => round_value.clone(),
        };
        self.highest_accepted = highest_accepted;
        self.send_accept(proposal, value);
    }

    fn send_accept(&mut self, proposal: ProposalId, value: V) {
        info!(node = %self.id(), %proposal, ?value, "promise quorum reached, sending accept");
        self.network.broadcast(
            self.identity.id(),
            &self.acceptors,
            &MessageBody::Accept {
                proposal: proposal.clone(),
                value: value.clone(),
            },
        );
        self.last_accept = Some((proposal, value));
        self.accepted_by.clear();
        self.phase = ProposerPhase::Idle;
    }

    fn on_accepted(&mut self, from: NodeId, proposal: ProposalId, value: &V) {
        match &self.last_accept {
            Some((sent, sent_value)) if *sent == proposal && sent_value == value => {
                self.accepted_by.insert(from);
                debug!(
                    node = %self.identity.id(),
                    %proposal,
                    count = self.accepted_by.len(),
                    "accept confirmed"
                );
            }
            _ => trace!(node = %self.id(), %from, %proposal, "accepted for another round"),
        }
    }
}

impl<V: Value> MessageHandler<V> for Proposer<V> {
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
            MessageBody::Promise { proposal, accepted } => {
                self.on_promise(from, proposal, accepted);
            }
            MessageBody::Accepted { proposal, value } => self.on_accepted(from, proposal, &value),
            other @ (MessageBody::Prepare { .. }
            | MessageBody::Accept { .. }
            | MessageBody::Learn { .. }) => {
                warn!(
                    node = %self.id(),
                    %from,
                    kind = other.kind(),
                    "unexpected message for proposer"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCEPTORS: [&str; 5] = ["A1", "A2", "A3", "A4", "A5"];

    type Net = Network<&'static str>;

    fn proposer(id: &str, value: &'static str) -> (Proposer<&'static str>, Net) {
        let network = Network::with_seed(0);
        let proposer = Proposer::new(
            NodeId::from(id),
            ACCEPTORS.map(NodeId::from).into(),
            value,
            network.clone(),
        );
        (proposer, network)
    }

    fn pid(round: u64, proposer: &str) -> ProposalId {
        ProposalId::new(round, proposer)
    }

    fn promise(
        proposer: &mut Proposer<&'static str>,
        from: &str,
        proposal: &ProposalId,
        accepted: Option<(ProposalId, &'static str)>,
    ) {
        proposer.handle(Message::new(
            NodeId::from(from),
            proposer.id().clone(),
            MessageBody::Promise {
                proposal: proposal.clone(),
                accepted,
            },
        ));
    }

    fn accepts_sent(network: &Net) -> Vec<(ProposalId, &'static str)> {
        ACCEPTORS
            .iter()
            .flat_map(|a| network.drain(&NodeId::from(*a)))
            .filter_map(|m| match m.body() {
                MessageBody::Accept { proposal, value } => Some((proposal.clone(), *value)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ids_of_different_proposers_never_collide() {
        let mut proposers: Vec<_> = ["P1", "Q1", "P01", "P100", "Proposer_2024", "Master"]
            .into_iter()
            .map(|id| proposer(id, "AZUL").0)
            .collect();
        let mut seen = BTreeSet::new();
        for _ in 0..50 {
            for p in &mut proposers {
                p.phase = ProposerPhase::Idle;
                let proposal = p.start_proposal().unwrap();
                assert_eq!(&proposal.proposer, p.id());
                assert!(seen.insert(proposal));
            }
        }
    }

    #[test]
    fn proposer_with_large_number_in_id_starts_rounds() {
        let (mut p, network) = proposer("P100", "AZUL");
        assert_eq!(p.start_proposal(), Some(pid(1, "P100")));
        assert_eq!(network.pending_len(), ACCEPTORS.len());
    }

    #[test]
    fn start_proposal_broadcasts_prepare() {
        let (mut p, network) = proposer("P1", "AZUL");
        assert!(!p.is_proposing());
        assert_eq!(p.start_proposal(), Some(pid(1, "P1")));
        assert!(p.is_proposing());
        assert_eq!(p.current_proposal(), Some(&pid(1, "P1")));
        for a in ACCEPTORS {
            let inbox = network.drain(&NodeId::from(a));
            assert_eq!(
                inbox[0].body(),
                &MessageBody::Prepare {
                    proposal: pid(1, "P1")
                }
            );
        }
    }

    #[test]
    fn second_start_while_in_flight_is_refused() {
        let (mut p, network) = proposer("P1", "AZUL");
        assert!(p.start_proposal().is_some());
        let _ = network.drain(&NodeId::from("A1"));
        assert_eq!(p.start_proposal(), None);
        assert_eq!(p.current_proposal(), Some(&pid(1, "P1")));
        assert_eq!(network.pending_for(&NodeId::from("A1")), 0);
    }

    #[test]
    fn quorum_of_promises_sends_own_value_and_goes_idle() {
        let (mut p, network) = proposer("P1", "AZUL");
        p.start_proposal();
        let _ = accepts_sent(&network);
        let n = pid(1, "P1");

        promise(&mut p, "A1", &n, None);
        promise(&mut p, "A1", &n, None);
        promise(&mut p, "A2", &n, None);
        assert!(p.is_proposing());
        assert_eq!(p.promises_received(), 2);
        assert!(accepts_sent(&network).is_empty());

        promise(&mut p, "A3", &n, None);
        assert!(!p.is_proposing());
        assert_eq!(accepts_sent(&network), vec![(n.clone(), "AZUL"); 5]);
        assert_eq!(p.last_accept(), Some(&(n.clone(), "AZUL")));

        // Late promises for the finished round change nothing.
        promise(&mut p, "A4", &n, None);
        assert!(accepts_sent(&network).is_empty());

        // A new round is allowed and strictly larger.
        assert_eq!(p.start_proposal(), Some(pid(2, "P1")));
    }

    #[test]
    fn adopts_highest_previously_accepted_value() {
        let (mut p, network) = proposer("P2", "VERMELHO");
        p.start_proposal();
        let _ = accepts_sent(&network);
        let n = pid(1, "P2");

        promise(&mut p, "A1", &n, Some((pid(1, "P0"), "VERDE")));
        promise(&mut p, "A2", &n, None);
        promise(&mut p, "A3", &n, Some((pid(1, "P1"), "AZUL")));

        assert_eq!(accepts_sent(&network), vec![(n.clone(), "AZUL"); 5]);
        assert_eq!(p.highest_accepted(), Some(&(pid(1, "P1"), "AZUL")));
        // Our own value is kept for later rounds.
        assert_eq!(p.current_value(), &"VERMELHO");
    }

    #[test]
    fn stale_promises_are_discarded() {
        let (mut p, _) = proposer("P1", "AZUL");
        promise(&mut p, "A1", &pid(1, "P1"), None);
        assert_eq!(p.promises_received(), 0);

        p.start_proposal();
        p.phase = ProposerPhase::Idle;
        p.start_proposal();
        promise(&mut p, "A1", &pid(1, "P1"), None);
        assert_eq!(p.promises_received(), 0);
        assert!(p.is_proposing());
    }

    #[test]
    fn rejection_abandons_round_and_next_id_beats_it() {
        let (mut p, _) = proposer("P1", "AZUL");
        p.start_proposal();
        promise(&mut p, "A1", &pid(1, "P1"), None);
        promise(&mut p, "A2", &pid(5, "P2"), None);
        assert!(!p.is_proposing());
        assert_eq!(p.highest_seen(), Some(&pid(5, "P2")));

        let next = p.start_proposal().unwrap();
        assert!(next > pid(5, "P2"));
        assert_eq!(next, pid(6, "P1"));
    }

    #[test]
    fn set_value_only_affects_the_next_round() {
        let (mut p, network) = proposer("P1", "AZUL");
        p.start_proposal();
        let _ = accepts_sent(&network);
        p.set_value("VERDE");
        assert_eq!(p.current_value(), &"VERDE");
        for a in ["A1", "A2", "A3"] {
            promise(&mut p, a, &pid(1, "P1"), None);
        }
        assert_eq!(accepts_sent(&network), vec![(pid(1, "P1"), "AZUL"); 5]);

        p.start_proposal();
        for a in ["A3", "A4", "A5"] {
            promise(&mut p, a, &pid(2, "P1"), None);
        }
        let sent = accepts_sent(&network);
        assert_eq!(sent.last(), Some(&(pid(2, "P1"), "VERDE")));
    }

    #[test]
    fn accepted_replies_are_counted_for_last_accept() {
        let (mut p, network) = proposer("P1", "AZUL");
        p.start_proposal();
        for a in ["A1", "A2", "A3"] {
            promise(&mut p, a, &pid(1, "P1"), None);
        }
        let _ = accepts_sent(&network);
        for a in ["A1", "A2", "A2"] {
            p.handle(Message::new(
                NodeId::from(a),
                NodeId::from("P1"),
                MessageBody::Accepted {
                    proposal: pid(1, "P1"),
                    value: "AZUL",
                },
            ));
        }
        p.handle(Message::new(
            NodeId::from("A3"),
            NodeId::from("P1"),
            MessageBody::Accepted {
                proposal: pid(7, "P1"),
                value: "AZUL",
            },
        ));
        assert_eq!(p.accepted_by_count(), 2);
    }
}
