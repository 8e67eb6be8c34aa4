//! Identity and inbox handling shared by every role.

use tracing::{debug, info, trace};

use crate::messages::{Message, NodeId, Value};
use crate::network::Network;

/// Identity and liveness of a node.
///
/// Embedded by value in each role. Liveness only gates inbox processing:
/// a failed node keeps all of its protocol state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    id: NodeId,
    alive: bool,
}

impl Identity {
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self { id, alive: true }
    }

    #[must_use]
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Role capable of consuming protocol messages from its inbox.
pub trait MessageHandler<V: Value> {
    fn identity(&self) -> &Identity;

    fn identity_mut(&mut self) -> &mut Identity;

    /// Bus this node sends on and drains from.
    fn network(&self) -> &Network<V>;

    /// React to one delivered message.
    fn handle(&mut self, message: Message<V>);

    fn id(&self) -> &NodeId {
        self.identity().id()
    }

    fn is_alive(&self) -> bool {
        self.identity().is_alive()
    }

    /// Crash the node. Its inbox keeps filling until [`recover`](Self::recover).
    fn fail(&mut self) {
        let identity = self.identity_mut();
        if identity.alive {
            identity.alive = false;
            info!(node = %identity.id, "node failed");
        }
    }

    /// Bring the node back with the state it had when it failed.
    fn recover(&mut self) {
        let identity = self.identity_mut();
        if !identity.alive {
            identity.alive = true;
            info!(node = %identity.id, "node recovered");
        }
    }

    /// Drain and handle one batch of pending messages.
    ///
    /// Returns the number of messages handled; always 0 for a failed node.
    fn process_messages(&mut self) -> usize {
        if !self.is_alive() {
            trace!(node = %self.id(), "skipping failed node");
            return 0;
        }

        let batch = self.network().drain(self.id());
        let count = batch.len();
        if count > 0 {
            debug!(node = %self.id(), count, "processing messages");
        }
        for message in batch {
            self.handle(message);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageBody, ProposalId};

    struct Recorder {
        identity: Identity,
        network: Network<u32>,
        seen: Vec<ProposalId>,
    }

    impl MessageHandler<u32> for Recorder {
        fn identity(&self) -> &Identity {
            &self.identity
        }

        fn identity_mut(&mut self) -> &mut Identity {
            &mut self.identity
        }

        fn network(&self) -> &Network<u32> {
            &self.network
        }

        fn handle(&mut self, message: Message<u32>) {
            self.seen.push(message.body().proposal().clone());
        }
    }

    fn send(network: &Network<u32>, to: &str, n: u64) {
        network.send(Message::new(
            NodeId::from("P1"),
            NodeId::from(to),
            MessageBody::Prepare {
                proposal: ProposalId::new(n, "P1"),
            },
        ));
    }

    #[test]
    fn failed_node_leaves_inbox_untouched_until_recovery() {
        let network = Network::with_seed(0);
        let mut node = Recorder {
            identity: Identity::new(NodeId::from("A1")),
            network: network.clone(),
            seen: Vec::new(),
        };

        node.fail();
        assert!(!node.is_alive());
        send(&network, "A1", 1);
        send(&network, "A1", 2);
        assert_eq!(node.process_messages(), 0);
        assert_eq!(network.pending_for(node.id()), 2);

        node.recover();
        assert_eq!(node.process_messages(), 2);
        node.seen.sort();
        assert_eq!(node.seen, vec![ProposalId::new(1, "P1"), ProposalId::new(2, "P1")]);
        assert_eq!(node.process_messages(), 0);
    }
}
