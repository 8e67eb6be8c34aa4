//! Paxos protocol messages

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Values that can be agreed on.
///
/// Values are opaque to the protocol; they only need to be cloned into
/// messages and compared when learners tally votes.
pub trait Value: Clone + Ord + fmt::Debug + Send + 'static {}

impl<T> Value for T where T: Clone + Ord + fmt::Debug + Send + 'static {}

/// Identifier of a simulated node (`"A1"`, `"L2"`, `"P1"`, ...).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct NodeId(Arc<str>);

impl NodeId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Globally comparable proposal number.
///
/// Ordered by `round` first and the issuing proposer second, so ids from
/// different proposers never collide and competing rounds are ordered
/// purely by id, never by arrival time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProposalId {
    pub round: u64,
    pub proposer: NodeId,
}

impl ProposalId {
    #[must_use]
    pub fn new(round: u64, proposer: impl Into<NodeId>) -> Self {
        Self {
            round,
            proposer: proposer.into(),
        }
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("{}.{}", self.round, self.proposer))
    }
}

/// The five protocol message kinds and their payloads.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MessageBody<V> {
    /// Phase 1a: proposer asks acceptors to promise `proposal`.
    Prepare { proposal: ProposalId },
    /// Phase 1b: acceptor's answer to a prepare.
    ///
    /// When `proposal` differs from the prepared id the acceptor refused and
    /// is reporting the higher id it already promised; `accepted` is then
    /// always `None`.
    Promise {
        proposal: ProposalId,
        accepted: Option<(ProposalId, V)>,
    },
    /// Phase 2a: proposer asks acceptors to accept `value` under `proposal`.
    Accept { proposal: ProposalId, value: V },
    /// Phase 2b: acceptor confirms an accept back to the proposer.
    Accepted { proposal: ProposalId, value: V },
    /// Acceptor tells a learner what it accepted.
    Learn { proposal: ProposalId, value: V },
}

impl<V> MessageBody<V> {
    /// Protocol name of this message kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare { .. } => "PREPARE",
            Self::Promise { .. } => "PROMISE",
            Self::Accept { .. } => "ACCEPT",
            Self::Accepted { .. } => "ACCEPTED",
            Self::Learn { .. } => "LEARN",
        }
    }

    /// The proposal id every message kind carries.
    #[must_use]
    pub fn proposal(&self) -> &ProposalId {
        match self {
            Self::Prepare { proposal }
            | Self::Promise { proposal, .. }
            | Self::Accept { proposal, .. }
            | Self::Accepted { proposal, .. }
            | Self::Learn { proposal, .. } => proposal,
        }
    }
}

/// A message in flight between two nodes.
///
/// Immutable once constructed: fields are only readable.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Message<V> {
    sender: NodeId,
    receiver: NodeId,
    body: MessageBody<V>,
}

impl<V> Message<V> {
    #[must_use]
    pub fn new(sender: NodeId, receiver: NodeId, body: MessageBody<V>) -> Self {
        Self {
            sender,
            receiver,
            body,
        }
    }

    #[must_use]
    pub fn sender(&self) -> &NodeId {
        &self.sender
    }

    #[must_use]
    pub fn receiver(&self) -> &NodeId {
        &self.receiver
    }

    #[must_use]
    pub fn body(&self) -> &MessageBody<V> {
        &self.body
    }

    /// Split into `(sender, body)` for handlers that consume the message.
    #[must_use]
    pub fn into_parts(self) -> (NodeId, MessageBody<V>) {
        (self.sender, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_orders_and_displays_as_text() {
        let a1 = NodeId::from("A1");
        let a2 = NodeId::from("A2".to_string());
        assert!(a1 < a2);
        assert_eq!(a1.to_string(), "A1");
        assert_eq!(format!("{a1:?}"), "\"A1\"");
    }

    #[test]
    fn body_exposes_kind_and_proposal() {
        let body: MessageBody<&str> = MessageBody::Promise {
            proposal: ProposalId::new(7, "P1"),
            accepted: Some((ProposalId::new(3, "P2"), "AZUL")),
        };
        assert_eq!(body.kind(), "PROMISE");
        assert_eq!(body.proposal(), &ProposalId::new(7, "P1"));
    }

    #[test]
    fn proposal_ids_order_by_round_then_proposer() {
        let p1 = ProposalId::new(1, "P1");
        let p2 = ProposalId::new(1, "P2");
        let p100 = ProposalId::new(1, "P100");
        assert!(p1 < p2);
        assert!(p1 < p100);
        assert!(p2 < ProposalId::new(2, "P1"));
        // Same digits, different names: distinct ids.
        assert_ne!(p1, ProposalId::new(1, "Q1"));
        assert_ne!(p1, ProposalId::new(1, "P01"));
        assert_eq!(p100.to_string(), "1.P100");
        assert_eq!(format!("{p1:>6}"), "  1.P1");
    }
}
