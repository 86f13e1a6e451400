//! A simulation: options plus the results produced by running them.

use std::any::Any;
use std::sync::Arc;

use super::options::{Identifier, Options, identifier};

#[derive(Clone)]
struct ResultEntry {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// One options value and the typed results attached by a worker.
///
/// Results are only attached while a job is running; once a simulation has
/// been added to a [`Project`](crate::project::Project) it is shared behind an
/// `Arc` and never mutated again.
#[derive(Clone)]
pub struct Simulation<O> {
    options: O,
    identifier: Identifier,
    results: Vec<ResultEntry>,
}

impl<O: Options> Simulation<O> {
    pub fn new(options: O) -> Self {
        let identifier = identifier(&options);
        Self {
            options,
            identifier,
            results: Vec::new(),
        }
    }

    pub fn options(&self) -> &O {
        &self.options
    }

    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    pub fn add_result<R: Any + Send + Sync>(&mut self, result: R) {
        self.results.push(ResultEntry {
            type_name: std::any::type_name::<R>(),
            value: Arc::new(result),
        });
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    pub fn result_type_names(&self) -> Vec<&'static str> {
        self.results.iter().map(|r| r.type_name).collect()
    }

    /// All results of type `R`, in the order they were attached.
    pub fn find_results<R: Any + Send + Sync>(&self) -> Vec<Arc<R>> {
        self.results
            .iter()
            .filter_map(|r| Arc::clone(&r.value).downcast::<R>().ok())
            .collect()
    }
}

impl<O: std::fmt::Debug> std::fmt::Debug for Simulation<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("identifier", &self.identifier)
            .field("options", &self.options)
            .field(
                "results",
                &self.results.iter().map(|r| r.type_name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
