//! In-memory message bus shared by every node of a simulation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::trace;

use crate::messages::{Message, MessageBody, NodeId};

/// Asynchronous, order-scrambling transport between nodes.
///
/// Cloning yields another handle to the same bus. Every sent message is
/// handed to exactly one [`drain`](Self::drain) call for its receiver:
/// nothing is lost, duplicated or delivered to anyone else.
pub struct Network<V> {
    pending: Arc<Mutex<Vec<Message<V>>>>,
    rng: Arc<Mutex<StdRng>>,
}

impl<V> Clone for Network<V> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            rng: Arc::clone(&self.rng),
        }
    }
}

impl<V> Default for Network<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Network<V> {
    /// Create a bus that shuffles deliveries with OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Create a bus whose delivery order is reproducible for `seed`.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            pending: Arc::new(Mutex::new(Vec::new())),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    // The pending vector is only ever pushed to or partitioned whole, so a
    // panic elsewhere cannot leave it half-updated.
    fn pending(&self) -> MutexGuard<'_, Vec<Message<V>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message. Never blocks on delivery and never fails.
    pub fn send(&self, message: Message<V>) {
        trace!(
            from = %message.sender(),
            to = %message.receiver(),
            kind = message.body().kind(),
            proposal = %message.body().proposal(),
            "send"
        );
        self.pending().push(message);
    }

    /// Send `body` from `sender` to each of `receivers`, one message each.
    pub fn broadcast<'a>(
        &self,
        sender: &NodeId,
        receivers: impl IntoIterator<Item = &'a NodeId>,
        body: &MessageBody<V>,
    ) where
        V: Clone,
    {
        for receiver in receivers {
            self.send(Message::new(sender.clone(), receiver.clone(), body.clone()));
        }
    }

    /// Remove every message addressed to `node` and return them shuffled.
    ///
    /// Messages for other nodes are left in place. The shuffle happens after
    /// the pending set has been released.
    pub fn drain(&self, node: &NodeId) -> Vec<Message<V>> {
        let mut inbox = {
            let mut pending = self.pending();
            let (inbox, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|m| m.receiver() == node);
            *pending = rest;
            inbox
        };

        if inbox.len() > 1 {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            inbox.shuffle(&mut *rng);
        }
        inbox
    }

    /// Number of messages not yet drained.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Number of messages waiting for `node`.
    #[must_use]
    pub fn pending_for(&self, node: &NodeId) -> usize {
        self.pending()
            .iter()
            .filter(|m| m.receiver() == node)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::thread;

    use super::*;
    use crate::messages::ProposalId;

    fn prepare(from: &str, to: &str, n: u64) -> Message<String> {
        Message::new(
            NodeId::from(from),
            NodeId::from(to),
            MessageBody::Prepare {
                proposal: ProposalId::new(n, from),
            },
        )
    }

    #[test]
    fn drain_only_takes_messages_for_the_node() {
        let network = Network::with_seed(1);
        network.send(prepare("P1", "A1", 1));
        network.send(prepare("P1", "A2", 1));
        network.send(prepare("P1", "A1", 2));

        let inbox = network.drain(&NodeId::from("A1"));
        assert_eq!(inbox.len(), 2);
        assert!(inbox.iter().all(|m| m.receiver().as_str() == "A1"));
        assert_eq!(network.pending_len(), 1);
        assert_eq!(network.pending_for(&NodeId::from("A2")), 1);
        assert!(network.drain(&NodeId::from("A1")).is_empty());
    }

    #[test]
    fn broadcast_addresses_each_receiver_once() {
        let network: Network<String> = Network::with_seed(2);
        let acceptors: Vec<NodeId> = ["A1", "A2", "A3"].map(NodeId::from).into();
        network.broadcast(
            &NodeId::from("P1"),
            &acceptors,
            &MessageBody::Prepare {
                proposal: ProposalId::new(1, "P1"),
            },
        );
        assert_eq!(network.pending_len(), 3);
        for acceptor in &acceptors {
            assert_eq!(network.drain(acceptor).len(), 1);
        }
    }

    #[test]
    fn drain_eventually_reorders_deliveries() {
        let network = Network::with_seed(3);
        let a1 = NodeId::from("A1");
        let in_order: Vec<u64> = (0..8).collect();
        let reordered = (0..20).any(|_| {
            for n in &in_order {
                network.send(prepare("P1", "A1", *n));
            }
            let got: Vec<u64> = network
                .drain(&a1)
                .iter()
                .map(|m| m.body().proposal().round)
                .collect();
            got != in_order
        });
        assert!(reordered);
    }

    #[test]
    fn concurrent_senders_lose_nothing() {
        let network = Network::with_seed(4);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let network = network.clone();
                thread::spawn(move || {
                    for n in 0..100 {
                        network.send(prepare("P1", "A1", t * 1000 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ids: BTreeSet<u64> = network
            .drain(&NodeId::from("A1"))
            .iter()
            .map(|m| m.body().proposal().round)
            .collect();
        assert_eq!(ids.len(), 400);
        assert_eq!(network.pending_len(), 0);
    }
}
