//! Simulation configuration

use std::collections::BTreeSet;

use error_stack::Report;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::messages::NodeId;

/// A proposer and the value it starts out proposing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProposerConfig<V> {
    pub id: NodeId,
    pub initial_value: V,
}

/// Node-id sets and initial values for one simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationConfig<V> {
    pub acceptors: Vec<NodeId>,
    pub learners: Vec<NodeId>,
    pub proposers: Vec<ProposerConfig<V>>,
    /// Seed for message and node-order shuffling (OS entropy when `None`)
    #[cfg_attr(feature = "serde", serde(default))]
    pub seed: Option<u64>,
}

impl<V> SimulationConfig<V> {
    /// Create a configuration without proposers.
    pub fn new(
        acceptors: impl IntoIterator<Item = impl Into<NodeId>>,
        learners: impl IntoIterator<Item = impl Into<NodeId>>,
    ) -> Self {
        Self {
            acceptors: acceptors.into_iter().map(Into::into).collect(),
            learners: learners.into_iter().map(Into::into).collect(),
            proposers: Vec::new(),
            seed: None,
        }
    }

    /// Add a proposer.
    #[must_use]
    pub fn proposer(mut self, id: impl Into<NodeId>, initial_value: V) -> Self {
        self.proposers.push(ProposerConfig {
            id: id.into(),
            initial_value,
        });
        self
    }

    /// Make shuffling reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the node-id sets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if there are no acceptors or no learners, or
    /// if any id is used twice (across all roles).
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        if self.acceptors.is_empty() {
            return Err(Report::new(ConfigError).attach("at least one acceptor is required"));
        }
        if self.learners.is_empty() {
            return Err(Report::new(ConfigError).attach("at least one learner is required"));
        }

        let mut ids = BTreeSet::new();
        let all_ids = self
            .acceptors
            .iter()
            .chain(&self.learners)
            .chain(self.proposers.iter().map(|p| &p.id));
        for id in all_ids {
            if !ids.insert(id) {
                return Err(Report::new(ConfigError).attach(format!("duplicate node id {id}")));
            }
        }

        Ok(())
    }
}

impl SimulationConfig<String> {
    /// Five acceptors, two learners and two competing proposers.
    #[must_use]
    pub fn demo() -> Self {
        Self::new(["A1", "A2", "A3", "A4", "A5"], ["L1", "L2"])
            .proposer("P1", "AZUL".to_string())
            .proposer("P2", "VERMELHO".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_is_valid() {
        let config = SimulationConfig::demo();
        config.validate().unwrap();
        assert_eq!(config.acceptors.len(), 5);
        assert_eq!(config.proposers[1].initial_value, "VERMELHO");
    }

    #[test]
    fn rejects_empty_roles() {
        let no_acceptors: SimulationConfig<u8> = SimulationConfig::new(Vec::<&str>::new(), ["L1"]);
        assert!(no_acceptors.validate().is_err());
        let no_learners: SimulationConfig<u8> = SimulationConfig::new(["A1"], Vec::<&str>::new());
        assert!(no_learners.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_ids_across_roles() {
        let config = SimulationConfig::new(["A1", "A2"], ["L1", "A2"]).proposer("P1", 0);
        assert!(config.validate().is_err());
        let config = SimulationConfig::new(["A1"], ["L1"])
            .proposer("P1", 0)
            .proposer("P1", 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_any_proposer_ids() {
        let config = SimulationConfig::new(["A1"], ["L1"])
            .proposer("P1", 0)
            .proposer("Q1", 1)
            .proposer("P01", 2)
            .proposer("P100", 3)
            .proposer("Proposer_2024", 4)
            .proposer("Master", 5);
        config.validate().unwrap();
    }
}
