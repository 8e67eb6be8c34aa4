//! Single-decree Paxos simulation
//!
//! Proposers, acceptors and learners agree on one value while exchanging
//! messages over an in-memory bus that delivers in arbitrary order. Nodes
//! can be crashed and revived at any point; acceptors keep their promises
//! across crashes, so a decided value never changes.
//!
//! # Architecture
//!
//! - **Proposers**: Run prepare/accept rounds with globally unique ids
//! - **Acceptors**: Promise and accept, and report acceptances to learners
//! - **Learners**: Tally reports with [`quorum::VoteTally`] and decide once
//! - **[`Simulation`]**: Owns the nodes and the [`Network`], ticks them, and
//!   takes commands from other threads
//!
//! # Quick Start
//!
//! ```
//! use paxos_sim::{Simulation, SimulationConfig};
//!
//! let config = SimulationConfig::new(["A1", "A2", "A3"], ["L1"])
//!     .proposer("P1", "AZUL".to_string())
//!     .with_seed(7);
//! let simulation = Simulation::new(config).expect("valid configuration");
//!
//! simulation.fail("A1").expect("A1 exists");
//! simulation.propose("P1", None).expect("P1 is idle");
//! assert_eq!(simulation.run_until_decided(50).as_deref(), Some("AZUL"));
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod config;
pub mod error;
pub mod learner;
mod messages;
pub mod network;
pub mod node;
pub mod proposer;
pub mod quorum;
pub mod simulation;

pub use acceptor::Acceptor;
pub use config::{ProposerConfig, SimulationConfig};
pub use error::{ConfigError, SimulationError};
pub use learner::Learner;
pub use messages::{Message, MessageBody, NodeId, ProposalId, Value};
pub use network::Network;
pub use node::{Identity, MessageHandler};
pub use proposer::Proposer;
pub use simulation::{Simulation, SimulationTask, Status, TickReport};
