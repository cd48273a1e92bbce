//! Bounded worker pool that runs jobs in isolated workers.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │      caller      │
//!                  └──┬────────────▲──┘
//!          submit/close│            │receive/join
//!                  ┌──▼────────────┴──┐
//!                  │    dispatcher    │
//!                  └──┬────────────▲──┘
//!           requests  │            │  responses
//!         ┌───────────┼────────────┼───────────┐
//!   ┌─────▼─────┐ ┌───▼───────┐ ┌──┴────────┐
//!   │ worker 0  │ │ worker 1  │ │ worker N  │
//!   │ setup     │ │ setup     │ │ setup     │
//!   │ job loop  │ │ job loop  │ │ job loop  │
//!   │ teardown  │ │ teardown  │ │ teardown  │
//!   └───────────┘ └───────────┘ └───────────┘
//! ```
//!
//! Workers are subprocesses ([`Isolation::Process`]) or threads
//! ([`Isolation::Thread`]). With a parallelism of one, or with
//! [`Isolation::Inline`], [`make_pool`] returns an [`InlinePool`] that runs
//! everything synchronously in the caller behind the same [`Pool`] contract.

mod dispatch;
mod inline;
mod ipc;
mod proc;
mod protocol;
mod signals;
mod spawn;
mod worker;

pub use dispatch::Dispatcher;
pub use inline::InlinePool;
pub use protocol::{Bootstrap, Message};
pub use signals::TerminationReason;
pub use spawn::{WORKER_FLAG, WORKER_INDEX_ENV, WorkerCommand};
pub use worker::run_worker_main;

use crate::error::{PartestError, Result};
use crate::host::Host;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The caller-supplied functions a pool runs.
///
/// Handlers are associated functions on a type rather than closures: a
/// worker subprocess re-enters the same binary and finds its setup, callback
/// and teardown by type, so there is never any captured state to carry
/// across the isolation boundary. Everything that does cross it (context,
/// jobs, results, final contexts) must be serializable.
pub trait Handler: 'static {
    /// Initial context; every worker gets its own copy.
    type Context: Clone + Serialize + DeserializeOwned + Send + 'static;
    /// Derived context produced by `setup`, private to one worker.
    type State;
    type Job: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
    /// Final context produced by `teardown`.
    type Final: Serialize + DeserializeOwned + Send + 'static;

    /// Runs once per worker before its first job.
    fn setup(host: &Host, worker: usize, context: Self::Context) -> anyhow::Result<Self::State>;

    /// Runs once per job. Per-job failures should be encoded in `Output`;
    /// an `Err` here is fatal to the worker.
    fn call(state: &Self::State, job: Self::Job) -> anyhow::Result<Self::Output>;

    /// Runs once per worker after a graceful close.
    fn teardown(state: Self::State) -> anyhow::Result<Self::Final>;
}

/// Message type exchanged by the workers of handler `H`.
pub type HandlerMessage<H> =
    Message<<H as Handler>::Job, <H as Handler>::Output, <H as Handler>::Final>;

/// Caller-facing pool contract shared by every variant.
pub trait Pool<H: Handler> {
    /// Number of workers.
    fn parallelism(&self) -> usize;

    /// Queue a job; never blocks.
    fn submit(&mut self, job: H::Job) -> Result<()>;

    /// Next result, waiting up to `timeout` (`None` waits until a result
    /// arrives or no worker is left). `Ok(None)` means nothing arrived.
    /// A worker failure is returned as [`PartestError::Worker`]; the pool
    /// should be abandoned afterwards.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<H::Output>>;

    /// Ask every worker to finish after its queued jobs.
    fn close(&mut self) -> Result<()>;

    /// Wait for workers and collect final contexts in worker order. Without
    /// a prior `close` the workers are torn down and nothing is collected.
    fn join(&mut self) -> Result<Vec<H::Final>>;

    fn is_closed(&self) -> bool;

    /// Whether any worker reported an error.
    fn has_erred(&self) -> bool;
}

/// How workers are isolated from the caller and from each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// One subprocess per worker.
    #[default]
    Process,
    /// One OS thread per worker.
    Thread,
    /// No workers; jobs run synchronously inside `receive`.
    Inline,
}

/// What a worker does when teardown fails after a graceful close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Log and drop the failure; the worker emits no terminal message, so
    /// `join` returns fewer final contexts than workers.
    #[default]
    Ignore,
    /// Emit an Error message, which `join` surfaces as a pool error.
    Report,
}

/// Configuration for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers.
    pub parallelism: usize,
    pub isolation: Isolation,
    pub teardown: TeardownPolicy,
    /// Program started for each process worker.
    pub worker_command: WorkerCommand,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            isolation: Isolation::default(),
            teardown: TeardownPolicy::default(),
            worker_command: WorkerCommand::current_exe(),
        }
    }
}

impl PoolConfig {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            ..Default::default()
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = command;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(PartestError::Config(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build the pool variant that matches `config`.
pub fn make_pool<H: Handler>(
    host: &Host,
    config: &PoolConfig,
    context: H::Context,
) -> Result<Box<dyn Pool<H>>> {
    config.validate()?;

    if config.parallelism == 1 || config.isolation == Isolation::Inline {
        return Ok(Box::new(InlinePool::<H>::new(host, config, context)));
    }

    let pool = match config.isolation {
        Isolation::Thread => Dispatcher::<H>::threads(host, config, context)?,
        _ => Dispatcher::<H>::processes(host, config, context)?,
    };
    Ok(Box::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Handler for Echo {
        type Context = ();
        type State = usize;
        type Job = u32;
        type Output = (usize, u32);
        type Final = usize;

        fn setup(_: &Host, worker: usize, _: ()) -> anyhow::Result<usize> {
            Ok(worker)
        }

        fn call(state: &usize, job: u32) -> anyhow::Result<(usize, u32)> {
            Ok((*state, job))
        }

        fn teardown(state: usize) -> anyhow::Result<usize> {
            Ok(state)
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = PoolConfig::default();
        assert!(config.parallelism >= 1);
        assert_eq!(config.isolation, Isolation::Process);
        assert_eq!(config.teardown, TeardownPolicy::Ignore);
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = make_pool::<Echo>(&Host::new(), &PoolConfig::new(0), ()).err();
        assert!(matches!(err, Some(PartestError::Config(_))));
    }

    #[test]
    fn test_single_worker_runs_inline() {
        let config = PoolConfig::new(1).with_isolation(Isolation::Thread);
        let mut pool = make_pool::<Echo>(&Host::new(), &config, ()).unwrap();
        assert_eq!(pool.parallelism(), 1);

        pool.submit(7).unwrap();
        // inline: the job runs during receive, no waiting involved
        assert_eq!(pool.receive(Some(Duration::ZERO)).unwrap(), Some((0, 7)));
        assert_eq!(pool.join().unwrap(), vec![0]);
    }

    #[test]
    fn test_thread_isolation_selected() {
        let config = PoolConfig::new(3).with_isolation(Isolation::Thread);
        let mut pool = make_pool::<Echo>(&Host::new(), &config, ()).unwrap();
        assert_eq!(pool.parallelism(), 3);
        pool.close().unwrap();
        assert_eq!(pool.join().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_teardown_policy_wire_names() {
        assert_eq!(
            serde_json::to_string(&TeardownPolicy::Report).unwrap(),
            r#""report""#
        );
    }
}
