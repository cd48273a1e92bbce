//! Worker subprocess spawning.
//!
//! By default a worker is the current executable re-entered with
//! [`WORKER_FLAG`]; its `main` hands control to
//! [`run_worker_main`](super::run_worker_main).

use super::proc::Proc;
use crate::error::{PartestError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};

/// Command-line flag that switches the binary into worker mode.
pub const WORKER_FLAG: &str = "--internal-worker";

/// Environment variable carrying the worker index into the subprocess.
pub const WORKER_INDEX_ENV: &str = "PARTEST_WORKER_INDEX";

/// Program (plus arguments and environment) started for each process worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// The running executable in worker mode.
    ///
    /// Falls back to the bare program name when the executable path is
    /// unavailable; resolution then fails at pool construction.
    pub fn current_exe() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("partest"));
        Self::new(program).arg(WORKER_FLAG)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Locate the program, searching `PATH` for bare names.
    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.program).map_err(|e| {
            PartestError::Config(format!(
                "worker program '{}' is not runnable: {}",
                self.program.display(),
                e
            ))
        })
    }
}

/// Spawn worker `index` from an already resolved program path.
pub(crate) fn spawn_worker(command: &WorkerCommand, program: &Path, index: usize) -> Result<Proc> {
    let mut cmd = Command::new(program);
    cmd.args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(WORKER_INDEX_ENV, index.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // worker logs go to the parent's stderr
        .stderr(Stdio::inherit());

    let child = cmd
        .spawn()
        .map_err(|source| PartestError::Spawn { worker: index, source })?;

    Proc::from_child(child)
}

/// Spawn the named thread that drives one worker subprocess.
pub(crate) fn spawn_driver_thread<F>(index: usize, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    spawn_named(format!("partest-driver-{}", index), index, f)
}

/// Spawn the named thread that reads one worker subprocess' stdout.
pub(crate) fn spawn_reader_thread<F>(index: usize, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    spawn_named(format!("partest-reader-{}", index), index, f)
}

fn spawn_named<F>(name: String, index: usize, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|source| PartestError::Spawn { worker: index, source })
}
