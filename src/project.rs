//! Append-only collection of completed simulations, deduplicated by
//! [`Identifier`].
//!
//! Insertion order is preserved; under a runner that means completion order.

use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Identifier, Options, Simulation};

struct Inner<O> {
    simulations: Vec<Arc<Simulation<O>>>,
    index: HashMap<Identifier, usize>,
}

/// Ordered, deduplicated set of simulations. Internally synchronised so it
/// can be shared by `Arc` between the runner and its jobs.
pub struct Project<O> {
    inner: RwLock<Inner<O>>,
}

impl<O: Options> Default for Project<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Options> Project<O> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                simulations: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Add a simulation unless a content-equal one is already present.
    ///
    /// Returns the stored entry: the new one, or the existing one on a
    /// duplicate. Adding a duplicate is not an error.
    pub fn add(&self, simulation: Simulation<O>) -> Arc<Simulation<O>> {
        let identifier = simulation.identifier();
        let mut inner = self.inner.write();
        if let Some(&position) = inner.index.get(&identifier) {
            return Arc::clone(&inner.simulations[position]);
        }

        let simulation = Arc::new(simulation);
        let position = inner.simulations.len();
        inner.simulations.push(Arc::clone(&simulation));
        inner.index.insert(identifier, position);
        debug_assert_eq!(inner.index.len(), inner.simulations.len());
        simulation
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.inner.read().index.contains_key(identifier)
    }

    pub fn get(&self, identifier: &Identifier) -> Option<Arc<Simulation<O>>> {
        let inner = self.inner.read();
        inner
            .index
            .get(identifier)
            .map(|&position| Arc::clone(&inner.simulations[position]))
    }

    pub fn len(&self) -> usize {
        self.inner.read().simulations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every simulation in insertion order.
    pub fn simulations(&self) -> Vec<Arc<Simulation<O>>> {
        self.inner.read().simulations.clone()
    }

    pub fn identifiers(&self) -> Vec<Identifier> {
        self.inner
            .read()
            .simulations
            .iter()
            .map(|s| s.identifier())
            .collect()
    }

    /// Simulations whose options satisfy `predicate`, in insertion order.
    pub fn find_simulations<F>(&self, mut predicate: F) -> Vec<Arc<Simulation<O>>>
    where
        F: FnMut(&O) -> bool,
    {
        self.inner
            .read()
            .simulations
            .iter()
            .filter(|s| predicate(s.options()))
            .cloned()
            .collect()
    }

    /// Every result of type `R` across all simulations, in insertion order.
    pub fn find_results<R: Any + Send + Sync>(&self) -> Vec<Arc<R>> {
        self.simulations()
            .iter()
            .flat_map(|s| s.find_results::<R>())
            .collect()
    }

    /// Serializable overview of the project contents.
    pub fn summary(&self) -> Result<ProjectSummary>
    where
        O: Serialize,
    {
        let simulations = self
            .simulations()
            .iter()
            .map(|s| {
                Ok(SimulationSummary {
                    identifier: s.identifier(),
                    options: serde_json::to_value(s.options())?,
                    results: s
                        .result_type_names()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProjectSummary { simulations })
    }
}

impl<O: Options> std::fmt::Debug for Project<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("identifiers", &self.identifiers())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub simulations: Vec<SimulationSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub identifier: Identifier,
    pub options: serde_json::Value,
    pub results: Vec<String>,
}
