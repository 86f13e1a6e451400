//! Typed configuration from environment variables, plus batch files.
//!
//! Loads once at startup and fails fast on malformed values. Every variable
//! is optional.

pub mod batch;

use crate::error::{Error, Result};
use std::path::PathBuf;

pub use batch::Batch;

#[derive(Debug, Clone)]
pub struct Config {
    /// Concurrent simulations (`SIMRUN_MAX_WORKERS`, default: available parallelism).
    pub max_workers: usize,
    /// Root under which per-job output directories are placed (`SIMRUN_OUTPUT_DIR`).
    pub output_dir: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            output_dir: PathBuf::from("simrun-output"),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Call `dotenvy::dotenv().ok()` first to pick up a local `.env`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_workers: match optional_var("SIMRUN_MAX_WORKERS") {
                Some(raw) => parse_max_workers(&raw)?,
                None => defaults.max_workers,
            },
            output_dir: optional_var("SIMRUN_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

/// Empty values count as unset.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn parse_max_workers(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(Error::Config("SIMRUN_MAX_WORKERS must be at least 1".to_string())),
        Ok(n) => Ok(n),
        Err(e) => Err(Error::Config(format!(
            "SIMRUN_MAX_WORKERS is not a positive integer ({raw:?}): {e}"
        ))),
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_workers_must_be_positive() {
        assert_eq!(parse_max_workers(" 3 ").unwrap(), 3);
        assert!(matches!(parse_max_workers("0"), Err(Error::Config(_))));
        assert!(matches!(parse_max_workers("many"), Err(Error::Config(_))));
    }

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert!(config.max_workers >= 1);
        assert_eq!(config.log_level, "info");
        assert!(config.otel_endpoint.is_none());
    }
}
