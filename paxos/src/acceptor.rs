//! Acceptor implementation
//!
//! The acceptor's `(promised, accepted)` pair stands in for stable storage:
//! failing the node only stops it from draining its inbox, it never resets
//! this state.

use tracing::{debug, trace, warn};

use crate::messages::{Message, MessageBody, NodeId, ProposalId, Value};
use crate::network::Network;
use crate::node::{Identity, MessageHandler};

/// Result of handling a Prepare request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareOutcome<V> {
    /// Promised successfully - carries the currently accepted value (if any)
    Promised {
        proposal: ProposalId,
        accepted: Option<(ProposalId, V)>,
    },
    /// Rejected - an equal or higher proposal was already promised
    Rejected { promised: ProposalId },
}

/// Result of handling an Accept request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Accepted successfully
    Accepted,
    /// Rejected - a higher proposal was already promised
    Rejected { promised: ProposalId },
}

/// The acceptor's durable `(promised, accepted)` pair and its transitions.
///
/// Kept apart from [`Acceptor`] so the transitions can be driven without a
/// network.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AcceptorState<V> {
    promised: Option<ProposalId>,
    accepted: Option<(ProposalId, V)>,
}

impl<V> Default for AcceptorState<V> {
    fn default() -> Self {
        Self {
            promised: None,
            accepted: None,
        }
    }
}

impl<V: Clone> AcceptorState<V> {
    /// Highest proposal ever promised.
    #[must_use]
    pub fn promised(&self) -> Option<&ProposalId> {
        self.promised.as_ref()
    }

    /// Last accepted `(proposal, value)`.
    #[must_use]
    pub fn accepted(&self) -> Option<&(ProposalId, V)> {
        self.accepted.as_ref()
    }

    /// Handle a Prepare request - pure state transition
    ///
    /// Succeeds only for a proposal strictly above everything promised so far.
    pub fn prepare(&mut self, proposal: ProposalId) -> PrepareOutcome<V> {
        match &self.promised {
            Some(promised) if proposal <= *promised => PrepareOutcome::Rejected {
                promised: promised.clone(),
            },
            _ => {
                self.promised = Some(proposal.clone());
                PrepareOutcome::Promised {
                    proposal,
                    accepted: self.accepted.clone(),
                }
            }
        }
    }

    /// Handle an Accept request - pure state transition
    ///
    /// Succeeds for a proposal at or above the promised one; on success both
    /// the promise and the accepted pair move to `proposal`.
    pub fn accept(&mut self, proposal: ProposalId, value: V) -> AcceptOutcome {
        match &self.promised {
            Some(promised) if proposal < *promised => AcceptOutcome::Rejected {
                promised: promised.clone(),
            },
            _ => {
                self.promised = Some(proposal.clone());
                self.accepted = Some((proposal, value));
                AcceptOutcome::Accepted
            }
        }
    }
}

/// Phase 1 / phase 2 responder.
pub struct Acceptor<V> {
    identity: Identity,
    network: Network<V>,
    learners: Vec<NodeId>,
    state: AcceptorState<V>,
}

impl<V: Value> Acceptor<V> {
    /// Create an acceptor that reports accepted values to `learners`.
    #[must_use]
    pub fn new(id: NodeId, learners: Vec<NodeId>, network: Network<V>) -> Self {
        Self {
            identity: Identity::new(id),
            network,
            learners,
            state: AcceptorState::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> &AcceptorState<V> {
        &self.state
    }

    #[must_use]
    pub fn promised(&self) -> Option<&ProposalId> {
        self.state.promised()
    }

    #[must_use]
    pub fn accepted(&self) -> Option<&(ProposalId, V)> {
        self.state.accepted()
    }

    pub fn prepare(&mut self, proposal: ProposalId) -> PrepareOutcome<V> {
        self.state.prepare(proposal)
    }

    pub fn accept(&mut self, proposal: ProposalId, value: V) -> AcceptOutcome {
        self.state.accept(proposal, value)
    }

    fn on_prepare(&mut self, from: NodeId, proposal: ProposalId) {
        let reply = match self.prepare(proposal.clone()) {
            PrepareOutcome::Promised { proposal, accepted } => {
                debug!(node = %self.id(), %from, %proposal, ?accepted, "promised");
                MessageBody::Promise { proposal, accepted }
            }
            PrepareOutcome::Rejected { promised } => {
                debug!(node = %self.id(), %from, %proposal, %promised, "prepare rejected");
                MessageBody::Promise {
                    proposal: promised,
                    accepted: None,
                }
            }
        };
        self.network.send(Message::new(self.id().clone(), from, reply));
    }

    fn on_accept(&mut self, from: NodeId, proposal: ProposalId, value: V) {
        match self.accept(proposal.clone(), value.clone()) {
            AcceptOutcome::Accepted => {
                debug!(node = %self.id(), %from, %proposal, ?value, "accepted");
                self.network.send(Message::new(
                    self.id().clone(),
                    from,
                    MessageBody::Accepted {
                        proposal: proposal.clone(),
                        value: value.clone(),
                    },
                ));
                self.network.broadcast(
                    self.identity.id(),
                    &self.learners,
                    &MessageBody::Learn { proposal, value },
                );
            }
            AcceptOutcome::Rejected { promised } => {
                debug!(node = %self.id(), %from, %proposal, %promised, "accept rejected");
            }
        }
    }
}

impl<V: Value> MessageHandler<V> for Acceptor<V> {
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
        trace!(node = %self.id(), %from, kind = body.kind(), "received");
        match body {
            MessageBody::Prepare { proposal } => self.on_prepare(from, proposal),
            MessageBody::Accept { proposal, value } => self.on_accept(from, proposal, value),
            other @ (MessageBody::Promise { .. }
            | MessageBody::Accepted { .. }
            | MessageBody::Learn { .. }) => {
                warn!(
                    node = %self.id(),
                    %from,
                    kind = other.kind(),
                    "unexpected message for acceptor"
                );
            }
        }
    }
}
