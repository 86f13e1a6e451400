//! The worker contract, and a worker that drives an external program.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::signal::CancelSignal;
use crate::error::WorkerError;
use crate::model::{Options, Parameter, ParameterSet, Simulation};
use crate::token::Token;

/// Drives one simulator to completion for one simulation.
///
/// A worker must call `token.start()` on entry, report non-decreasing
/// progress through `token`, attach results to `simulation` and return `Ok`
/// on success. It should check `cancel` at its checkpoints and return
/// [`WorkerError::Cancelled`] when it stops early. Any other error marks the
/// job as failed.
///
/// `output_dir` is the job's scratch and output area; the runner neither
/// creates nor reads it.
pub trait Worker: Send + Sync + 'static {
    type Options: Options;

    fn run(
        &self,
        token: &Token,
        simulation: &mut Simulation<Self::Options>,
        output_dir: &Path,
        cancel: &CancelSignal,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send;
}

// ---------------------------------------------------------------------------
// CommandWorker
// ---------------------------------------------------------------------------

/// Result attached by [`CommandWorker`] after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub program: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Parsed `results.json` from the output directory, if the program wrote one.
    pub data: Option<serde_json::Value>,
}

/// Runs `ParameterSet::program` with its arguments inside the job's output
/// directory.
///
/// Before launch the worker writes `options.json` into the directory. The
/// child sees `SIMRUN_OUTPUT_DIR`, `SIMRUN_IDENTIFIER` and one
/// `SIMRUN_PARAM_<NAME>` variable per parameter (tags comma-joined). The child is killed
/// when cancellation is observed.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    /// How often the running status line is refreshed.
    pub poll_interval: Duration,
}

impl Default for CommandWorker {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Worker for CommandWorker {
    type Options = ParameterSet;

    async fn run(
        &self,
        token: &Token,
        simulation: &mut Simulation<ParameterSet>,
        output_dir: &Path,
        cancel: &CancelSignal,
    ) -> Result<(), WorkerError> {
        token.start(Some("Preparing output directory"));
        cancel.checkpoint()?;

        tokio::fs::create_dir_all(output_dir).await?;
        let options_json = serde_json::to_string_pretty(simulation.options())
            .map_err(|e| WorkerError::Failed(format!("serialize options: {e}")))?;
        tokio::fs::write(output_dir.join("options.json"), options_json).await?;

        let options = simulation.options();
        let program = resolve_program(&options.program)?;
        debug!(
            program = %program.display(),
            dir = %output_dir.display(),
            "launching simulation program"
        );

        let mut command = Command::new(&program);
        command
            .args(&options.args)
            .current_dir(output_dir)
            .env("SIMRUN_OUTPUT_DIR", output_dir)
            .env("SIMRUN_IDENTIFIER", simulation.identifier().to_string())
            .kill_on_drop(true);
        for (name, value) in &options.parameters {
            command.env(format!("SIMRUN_PARAM_{}", env_name(name)), env_value(value));
        }

        cancel.checkpoint()?;
        let start = Instant::now();
        let mut child = command.spawn()?;
        token.update_running(0.05, format!("Running {}", options.program));

        let status = loop {
            let waited = tokio::select! {
                status = child.wait() => Some(status?),
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep(self.poll_interval) => {
                    token.update_running(
                        0.05,
                        format!("Running {} ({}s)", options.program, start.elapsed().as_secs()),
                    );
                    continue;
                }
            };
            match waited {
                Some(status) => break status,
                None => {
                    warn!(program = %options.program, "cancellation observed, killing child");
                    child.kill().await?;
                    return Err(WorkerError::Cancelled);
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        if !status.success() {
            return Err(WorkerError::Program {
                program: options.program.clone(),
                code: status.code().unwrap_or(-1),
            });
        }

        token.update_running(0.95, "Reading results");
        let data = match tokio::fs::read_to_string(output_dir.join("results.json")).await {
            Ok(content) => Some(
                serde_json::from_str(&content)
                    .map_err(|e| WorkerError::Failed(format!("bad results.json: {e}")))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        info!(program = %options.program, duration_ms, "simulation program finished");
        let output = CommandOutput {
            program: options.program.clone(),
            exit_code: status.code().unwrap_or(0),
            duration_ms,
            data,
        };
        simulation.add_result(output);
        Ok(())
    }
}

/// Resolve relative paths with a directory component against the process
/// CWD. The child runs inside the output directory, which would otherwise
/// change what a relative path points to. Bare names go through `PATH`.
fn resolve_program(program: &str) -> std::io::Result<PathBuf> {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        Ok(std::env::current_dir()?.join(path))
    } else {
        Ok(path.to_path_buf())
    }
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn env_value(value: &Parameter) -> String {
    match value {
        Parameter::Bool(v) => v.to_string(),
        Parameter::Int(v) => v.to_string(),
        Parameter::Float(v) => v.to_string(),
        Parameter::Text(v) => v.clone(),
        Parameter::Tags(tags) => tags.join(","),
        Parameter::Measured { value, .. } => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names_are_shell_safe() {
        assert_eq!(env_name("beam.energy-eV"), "BEAM_ENERGY_EV");
        assert_eq!(env_name("n"), "N");
    }

    #[test]
    fn bare_program_names_are_left_for_path_lookup() {
        assert_eq!(resolve_program("sh").unwrap(), PathBuf::from("sh"));
        assert_eq!(
            resolve_program("/usr/bin/env").unwrap(),
            PathBuf::from("/usr/bin/env")
        );
        let resolved = resolve_program("bin/sim").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("bin/sim"));
    }
}
