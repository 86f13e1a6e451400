//! Batch files: a TOML list of simulations to submit together.
//!
//! ```toml
//! [[simulation]]
//! program = "./bin/mc-sim"
//! args = ["--quiet"]
//!
//! [simulation.parameters]
//! beam_energy_eV = { value = 15000.0, tolerance = 1.0 }
//! detectors = ["xray", "bse"]
//! showers = 10000
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::ParameterSet;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Batch {
    #[serde(default, rename = "simulation")]
    pub simulations: Vec<ParameterSet>,
}

impl Batch {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read batch file {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad batch file {}: {e}", path.display())))
    }
}
