//! Tick-driven simulation driver
//!
//! A [`Simulation`] owns every node of one run and the bus between them. Each
//! [`tick`](Simulation::tick) visits the nodes in a freshly shuffled order
//! and lets every live node handle its pending messages. Commands (propose,
//! kill, revive, ...) can be issued from any thread between or during ticks;
//! every node sits behind its own lock, so mutation of a node is serialized.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use error_stack::Report;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::acceptor::Acceptor;
use crate::config::SimulationConfig;
use crate::error::{ConfigError, SimulationError};
use crate::learner::Learner;
use crate::messages::{NodeId, ProposalId, Value};
use crate::network::Network;
use crate::node::MessageHandler;
use crate::proposer::Proposer;

type SharedNode<V> = Arc<Mutex<dyn MessageHandler<V> + Send>>;

struct Shared<V> {
    network: Network<V>,
    acceptors: BTreeMap<NodeId, Arc<Mutex<Acceptor<V>>>>,
    learners: BTreeMap<NodeId, Arc<Mutex<Learner<V>>>>,
    proposers: BTreeMap<NodeId, Arc<Mutex<Proposer<V>>>>,
    /// Every node regardless of role, in id order.
    nodes: BTreeMap<NodeId, SharedNode<V>>,
    order_rng: Mutex<StdRng>,
    ticks: AtomicU64,
}

/// Handle to one simulation run.
///
/// Cloning yields another handle to the same run, so a background ticking
/// task and a console can drive it together.
pub struct Simulation<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Simulation<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// What a single tick did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickReport {
    /// 1-based number of this tick.
    pub tick: u64,
    /// Messages handled by all nodes together.
    pub handled: usize,
    /// Nodes that panicked during this tick or were skipped because of an
    /// earlier panic.
    pub faulted: Vec<NodeId>,
}

impl<V: Value> Simulation<V> {
    /// Build every node named in `config` on a fresh bus.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn new(config: SimulationConfig<V>) -> Result<Self, Report<ConfigError>> {
        config.validate()?;

        let (network, order_rng) = match config.seed {
            Some(seed) => (
                Network::with_seed(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (Network::new(), StdRng::from_os_rng()),
        };

        let mut nodes = BTreeMap::new();

        let acceptors: BTreeMap<_, _> = config
            .acceptors
            .iter()
            .map(|id| {
                let acceptor = Acceptor::new(id.clone(), config.learners.clone(), network.clone());
                (id.clone(), Arc::new(Mutex::new(acceptor)))
            })
            .collect();
        register(&mut nodes, &acceptors);

        let learners: BTreeMap<_, _> = config
            .learners
            .iter()
            .map(|id| {
                let learner = Learner::new(id.clone(), config.acceptors.clone(), network.clone());
                (id.clone(), Arc::new(Mutex::new(learner)))
            })
            .collect();
        register(&mut nodes, &learners);

        let proposers: BTreeMap<_, _> = config
            .proposers
            .into_iter()
            .map(|p| {
                let proposer = Proposer::new(
                    p.id.clone(),
                    config.acceptors.clone(),
                    p.initial_value,
                    network.clone(),
                );
                (p.id, Arc::new(Mutex::new(proposer)))
            })
            .collect();
        register(&mut nodes, &proposers);

        info!(
            acceptors = acceptors.len(),
            learners = learners.len(),
            proposers = proposers.len(),
            seed = ?config.seed,
            "simulation created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                network,
                acceptors,
                learners,
                proposers,
                nodes,
                order_rng: Mutex::new(order_rng),
                ticks: AtomicU64::new(0),
            }),
        })
    }

    /// Give every live node one chance to handle its inbox.
    ///
    /// Nodes are visited in random order. A node that panics is reported and
    /// skipped on every later tick; the other nodes keep running.
    #[instrument(skip(self), fields(tick = self.tick_count() + 1))]
    pub fn tick(&self) -> TickReport {
        let tick = self.shared.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let mut order: Vec<_> = self.shared.nodes.iter().collect();
        order.shuffle(
            &mut *self
                .shared
                .order_rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut report = TickReport {
            tick,
            handled: 0,
            faulted: Vec::new(),
        };
        for (id, node) in order {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                node.lock().ok().map(|mut node| node.process_messages())
            }));
            match outcome {
                Ok(Some(handled)) => report.handled += handled,
                Ok(None) => {
                    debug!(node = %id, "node faulted on an earlier tick, skipping");
                    report.faulted.push(id.clone());
                }
                Err(payload) => {
                    let panic = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(node = %id, %panic, "node panicked while handling messages");
                    report.faulted.push(id.clone());
                }
            }
        }

        debug!(handled = report.handled, faulted = report.faulted.len(), "tick done");
        report
    }

    /// Tick until every learner has decided, at most `max_ticks` times.
    ///
    /// Returns the decided value, or `None` if some learner is still
    /// undecided when the budget runs out.
    pub fn run_until_decided(&self, max_ticks: u64) -> Option<V> {
        for _ in 0..max_ticks {
            if self.all_decided() {
                break;
            }
            self.tick();
        }
        if self.all_decided() {
            self.decided_value()
        } else {
            None
        }
    }

    /// Set `proposer`'s value (when given) and start a new round.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if `proposer` is unknown, down, faulted,
    /// or already has a round in flight.
    pub fn propose(
        &self,
        proposer: &str,
        value: Option<V>,
    ) -> Result<ProposalId, Report<SimulationError>> {
        let node = lookup(&self.shared.proposers, proposer, "proposer")?;
        let mut node = lock(proposer, node)?;
        if !node.is_alive() {
            return Err(
                Report::new(SimulationError).attach(format!("proposer {proposer} is down"))
            );
        }
        if node.is_proposing() {
            return Err(Report::new(SimulationError)
                .attach(format!("proposer {proposer} already has a proposal in flight")));
        }
        if let Some(value) = value {
            node.set_value(value);
        }
        node.start_proposal().ok_or_else(|| {
            Report::new(SimulationError)
                .attach(format!("proposer {proposer} refused to start a round"))
        })
    }

    /// Change the value `proposer` uses for its next round.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if `proposer` is unknown or faulted.
    pub fn set_value(&self, proposer: &str, value: V) -> Result<(), Report<SimulationError>> {
        let node = lookup(&self.shared.proposers, proposer, "proposer")?;
        lock(proposer, node)?.set_value(value);
        Ok(())
    }

    /// Crash `node`. Its state is kept and its inbox keeps filling.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if `node` is unknown or faulted.
    pub fn fail(&self, node: &str) -> Result<(), Report<SimulationError>> {
        let handle = lookup(&self.shared.nodes, node, "node")?;
        lock(node, handle)?.fail();
        Ok(())
    }

    /// Revive `node` with the state it had when it crashed.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError`] if `node` is unknown or faulted.
    pub fn recover(&self, node: &str) -> Result<(), Report<SimulationError>> {
        let handle = lookup(&self.shared.nodes, node, "node")?;
        lock(node, handle)?.recover();
        Ok(())
    }

    /// The value learned by the first learner that has decided.
    #[must_use]
    pub fn decided_value(&self) -> Option<V> {
        self.shared
            .learners
            .values()
            .find_map(|learner| peek(learner).learned_value().cloned())
    }

    /// Whether every learner has decided.
    #[must_use]
    pub fn all_decided(&self) -> bool {
        self.shared
            .learners
            .values()
            .all(|learner| peek(learner).is_learned())
    }

    /// Decision of every learner, by id.
    #[must_use]
    pub fn learned_values(&self) -> BTreeMap<NodeId, Option<V>> {
        self.shared
            .learners
            .iter()
            .map(|(id, learner)| (id.clone(), peek(learner).learned_value().cloned()))
            .collect()
    }

    /// Snapshot of every node and of the bus.
    ///
    /// Faulted nodes are still reported, with the state they were left in.
    #[must_use]
    pub fn status(&self) -> Status<V> {
        let acceptors = self
            .shared
            .acceptors
            .iter()
            .map(|(id, node)| {
                let (node, faulted) = inspect(node);
                AcceptorStatus {
                    id: id.clone(),
                    alive: node.is_alive(),
                    faulted,
                    promised: node.promised().cloned(),
                    accepted: node.accepted().cloned(),
                    inbox: self.shared.network.pending_for(id),
                }
            })
            .collect();

        let learners = self
            .shared
            .learners
            .iter()
            .map(|(id, node)| {
                let (node, faulted) = inspect(node);
                LearnerStatus {
                    id: id.clone(),
                    alive: node.is_alive(),
                    faulted,
                    learned: node.learned().cloned(),
                    inbox: self.shared.network.pending_for(id),
                }
            })
            .collect();

        let proposers = self
            .shared
            .proposers
            .iter()
            .map(|(id, node)| {
                let (node, faulted) = inspect(node);
                ProposerStatus {
                    id: id.clone(),
                    alive: node.is_alive(),
                    faulted,
                    proposing: node.is_proposing(),
                    current_proposal: node.current_proposal().cloned(),
                    value: node.current_value().clone(),
                    promises: node.promises_received(),
                    accepted_by: node.accepted_by_count(),
                    inbox: self.shared.network.pending_for(id),
                }
            })
            .collect();

        Status {
            tick: self.tick_count(),
            pending: self.shared.network.pending_len(),
            acceptors,
            learners,
            proposers,
            decided: self.decided_value(),
        }
    }

    /// Tick on a tokio task every `interval` until the returned handle is
    /// shut down.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(&self, interval: Duration) -> SimulationTask {
        let cancel = CancellationToken::new();
        let cancel_token = cancel.clone();
        let simulation = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut announced = false;

            loop {
                tokio::select! {
                    biased;

                    () = cancel_token.cancelled() => {
                        debug!("simulation loop cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        simulation.tick();
                        if !announced && simulation.all_decided() {
                            announced = true;
                            info!(value = ?simulation.decided_value(), "all learners decided");
                        }
                    }
                }
            }
        });

        SimulationTask { cancel, handle }
    }

    /// Number of ticks run so far.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// The bus shared by every node of this run.
    #[must_use]
    pub fn network(&self) -> &Network<V> {
        &self.shared.network
    }

    #[must_use]
    pub fn proposer(&self, id: &str) -> Option<Arc<Mutex<Proposer<V>>>> {
        self.shared.proposers.get(id).cloned()
    }

    #[must_use]
    pub fn acceptor(&self, id: &str) -> Option<Arc<Mutex<Acceptor<V>>>> {
        self.shared.acceptors.get(id).cloned()
    }

    #[must_use]
    pub fn learner(&self, id: &str) -> Option<Arc<Mutex<Learner<V>>>> {
        self.shared.learners.get(id).cloned()
    }
}

fn register<V, N>(
    nodes: &mut BTreeMap<NodeId, SharedNode<V>>,
    role: &BTreeMap<NodeId, Arc<Mutex<N>>>,
) where
    V: Value,
    N: MessageHandler<V> + Send + 'static,
{
    for (id, node) in role {
        let node: SharedNode<V> = node.clone();
        nodes.insert(id.clone(), node);
    }
}

fn lookup<'a, N: ?Sized>(
    nodes: &'a BTreeMap<NodeId, Arc<Mutex<N>>>,
    id: &str,
    role: &str,
) -> Result<&'a Mutex<N>, Report<SimulationError>> {
    nodes
        .get(id)
        .map(|node| &**node)
        .ok_or_else(|| Report::new(SimulationError).attach(format!("unknown {role} {id}")))
}

fn lock<'a, N: ?Sized>(
    id: &str,
    node: &'a Mutex<N>,
) -> Result<MutexGuard<'a, N>, Report<SimulationError>> {
    node.lock().map_err(|_| {
        Report::new(SimulationError)
            .attach(format!("node {id} faulted and no longer accepts commands"))
    })
}

// Read-only access that tolerates a node left poisoned by a panic.
fn peek<N>(node: &Mutex<N>) -> MutexGuard<'_, N> {
    node.lock().unwrap_or_else(PoisonError::into_inner)
}

fn inspect<N>(node: &Mutex<N>) -> (MutexGuard<'_, N>, bool) {
    match node.lock() {
        Ok(guard) => (guard, false),
        Err(poisoned) => (poisoned.into_inner(), true),
    }
}

/// Running background ticker started by [`Simulation::spawn`].
pub struct SimulationTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SimulationTask {
    /// Token that stops the ticker when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop ticking and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.handle.await {
            error!(%error, "simulation task ended abnormally");
        }
    }
}

/// Point-in-time view of a whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Status<V> {
    pub tick: u64,
    /// Messages sent and not yet drained.
    pub pending: usize,
    pub acceptors: Vec<AcceptorStatus<V>>,
    pub learners: Vec<LearnerStatus<V>>,
    pub proposers: Vec<ProposerStatus<V>>,
    pub decided: Option<V>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcceptorStatus<V> {
    pub id: NodeId,
    pub alive: bool,
    pub faulted: bool,
    pub promised: Option<ProposalId>,
    pub accepted: Option<(ProposalId, V)>,
    pub inbox: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LearnerStatus<V> {
    pub id: NodeId,
    pub alive: bool,
    pub faulted: bool,
    pub learned: Option<(ProposalId, V)>,
    pub inbox: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProposerStatus<V> {
    pub id: NodeId,
    pub alive: bool,
    pub faulted: bool,
    pub proposing: bool,
    pub current_proposal: Option<ProposalId>,
    /// Value for the next round.
    pub value: V,
    pub promises: usize,
    pub accepted_by: usize,
    pub inbox: usize,
}

fn liveness(alive: bool, faulted: bool) -> &'static str {
    match (faulted, alive) {
        (true, _) => "FAULTED",
        (false, true) => "up",
        (false, false) => "DOWN",
    }
}

struct Pair<'a, V>(Option<&'a (ProposalId, V)>);

impl<V: fmt::Debug> fmt::Display for Pair<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some((proposal, value)) => write!(f, "{proposal}:{value:?}"),
            None => f.write_str("-"),
        }
    }
}

struct Id<'a>(Option<&'a ProposalId>);

impl fmt::Display for Id<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(proposal) => write!(f, "{proposal}"),
            None => f.write_str("-"),
        }
    }
}

impl<V: fmt::Debug> fmt::Display for Status<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tick {}, {} message(s) pending", self.tick, self.pending)?;

        writeln!(f, "acceptors:")?;
        for a in &self.acceptors {
            writeln!(
                f,
                "  {:<4} {:<7} promised={} accepted={} inbox={}",
                a.id,
                liveness(a.alive, a.faulted),
                Id(a.promised.as_ref()),
                Pair(a.accepted.as_ref()),
                a.inbox
            )?;
        }

        writeln!(f, "learners:")?;
        for l in &self.learners {
            writeln!(
                f,
                "  {:<4} {:<7} learned={} inbox={}",
                l.id,
                liveness(l.alive, l.faulted),
                Pair(l.learned.as_ref()),
                l.inbox
            )?;
        }

        writeln!(f, "proposers:")?;
        for p in &self.proposers {
            writeln!(
                f,
                "  {:<4} {:<7} {} proposal={} value={:?} promises={} accepted_by={} inbox={}",
                p.id,
                liveness(p.alive, p.faulted),
                if p.proposing { "preparing" } else { "idle" },
                Id(p.current_proposal.as_ref()),
                p.value,
                p.promises,
                p.accepted_by,
                p.inbox
            )?;
        }

        match &self.decided {
            Some(value) => write!(f, "decided: {value:?}"),
            None => write!(f, "decided: -"),
        }
    }
}
