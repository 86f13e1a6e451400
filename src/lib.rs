//! # simrun
//!
//! Orchestration engine for simulation jobs.
//!
//! Options are fingerprinted into a content [`Identifier`](model::Identifier);
//! a [`LocalSimulationRunner`](engine::LocalSimulationRunner) skips options it
//! already holds or is already running, runs the rest through a
//! [`Worker`](engine::Worker) on a bounded pool, and collects finished
//! simulations in a [`Project`](project::Project). Progress is reported
//! through a hierarchical [`Token`](token::Token) tree.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod project;
pub mod telemetry;
pub mod token;
