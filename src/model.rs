//! Core data model.
//!
//! Options describe a simulation to run and carry a content identifier used
//! for dedup. A simulation pairs options with the results a worker produced.

pub mod options;
pub mod simulation;

pub use options::{
    FloatKey, Fingerprinter, Identifier, Options, Parameter, ParameterSet, float_key, identifier,
};
pub use simulation::Simulation;
