//! Test runner built on the worker pool.
//!
//! Each job is a test name. A worker runs the configured runner command
//! with the test name appended and reports the exit code and captured
//! output; a failing test is an ordinary result, not a worker error.

pub mod report;
pub mod stats;

use crate::error::{PartestError, Result};
use crate::host::{CallOutput, Host};
use crate::pool::{Handler, Pool, WORKER_INDEX_ENV};
use anyhow::Context as _;
use report::Reporter;
use serde::{Deserialize, Serialize};
use stats::Stats;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Initial context shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Runner program and its leading arguments.
    pub command: Vec<String>,
    /// Report every test as passed without running anything.
    pub dry_run: bool,
    /// Send test output to stderr as it is produced instead of capturing it.
    #[serde(default)]
    pub pass_through: bool,
}

/// Result of running one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    /// Exit code of the runner; `-1` if it could not be started.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub took: Duration,
}

impl TestOutcome {
    fn skipped(name: String) -> Self {
        Self {
            name,
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
            took: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// Final context of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker: usize,
    /// Process the worker ran in.
    pub pid: u32,
    pub tests: usize,
}

/// Per-worker state derived from [`RunnerConfig`].
pub struct RunnerState {
    host: Host,
    worker: usize,
    command: Vec<String>,
    dry_run: bool,
    pass_through: bool,
    tests: Cell<usize>,
}

/// Runs each test through an external command.
pub struct TestRunner;

impl Handler for TestRunner {
    type Context = RunnerConfig;
    type State = RunnerState;
    type Job = String;
    type Output = TestOutcome;
    type Final = WorkerSummary;

    fn setup(host: &Host, worker: usize, config: RunnerConfig) -> anyhow::Result<RunnerState> {
        let mut command = config.command;
        let program = command.first().context("runner command is empty")?;

        if !config.dry_run {
            let resolved = which::which_in(program, host.getenv("PATH"), host.cwd())
                .with_context(|| format!("runner '{}' not found", program))?;
            debug!(worker, runner = %resolved.display(), "Resolved runner");
            command[0] = resolved.to_string_lossy().into_owned();
        }

        Ok(RunnerState {
            host: host.clone(),
            worker,
            command,
            dry_run: config.dry_run,
            pass_through: config.pass_through,
            tests: Cell::new(0),
        })
    }

    fn call(state: &RunnerState, test: String) -> anyhow::Result<TestOutcome> {
        state.tests.set(state.tests.get() + 1);
        if state.dry_run {
            return Ok(TestOutcome::skipped(test));
        }

        let mut argv = state.command.clone();
        argv.push(test.clone());

        let env = [(WORKER_INDEX_ENV, state.worker.to_string())];
        let start = Instant::now();
        let result = if state.pass_through {
            state.host.stream(&argv, &env).map(|code| CallOutput {
                code,
                stdout: String::new(),
                stderr: String::new(),
            })
        } else {
            state.host.call(&argv, &env)
        };
        let outcome = match result {
            Ok(output) => TestOutcome {
                name: test,
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
                took: start.elapsed(),
            },
            // a test that cannot be started is a failed test
            Err(e) => TestOutcome {
                stderr: format!("failed to run {}: {}", argv[0], e),
                code: -1,
                took: start.elapsed(),
                ..TestOutcome::skipped(test)
            },
        };
        Ok(outcome)
    }

    fn teardown(state: RunnerState) -> anyhow::Result<WorkerSummary> {
        Ok(WorkerSummary {
            worker: state.worker,
            pid: std::process::id(),
            tests: state.tests.get(),
        })
    }
}

/// Totals for a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run: usize,
    pub failures: usize,
    pub workers: Vec<WorkerSummary>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failures > 0 { 1 } else { 0 }
    }
}

/// Run `tests` on `pool`, keeping at most `jobs` in flight.
///
/// `heartbeat` bounds each wait for a result; when it elapses the wait is
/// logged and resumed. On any error the pool is torn down without waiting
/// for queued tests.
pub fn run_tests<W: Write>(
    pool: &mut dyn Pool<TestRunner>,
    tests: Vec<String>,
    jobs: usize,
    heartbeat: Option<Duration>,
    reporter: &mut Reporter<W>,
    stats: &mut Stats,
) -> Result<RunSummary> {
    stats.total = tests.len();
    info!(tests = tests.len(), jobs, workers = pool.parallelism(), "Running tests");

    let failures = match dispatch(pool, tests.into(), jobs.max(1), heartbeat, reporter, stats) {
        Ok(failures) => failures,
        Err(e) => {
            // not closed, so this terminates the workers
            let _ = pool.join();
            return Err(e);
        }
    };

    pool.close()?;
    let workers = pool.join()?;
    debug!(workers = workers.len(), "Collected worker summaries");

    reporter.summary(stats.finished, failures, stats.elapsed())?;
    Ok(RunSummary {
        run: stats.finished,
        failures,
        workers,
    })
}

fn dispatch<W: Write>(
    pool: &mut dyn Pool<TestRunner>,
    mut pending: VecDeque<String>,
    jobs: usize,
    heartbeat: Option<Duration>,
    reporter: &mut Reporter<W>,
    stats: &mut Stats,
) -> Result<usize> {
    let mut running = 0usize;
    let mut failures = 0usize;

    while !pending.is_empty() || running > 0 {
        while running < jobs {
            let Some(test) = pending.pop_front() else {
                break;
            };
            stats.started += 1;
            reporter.started(stats, &test)?;
            pool.submit(test)?;
            running += 1;
        }

        let Some(outcome) = pool.receive(heartbeat)? else {
            if heartbeat.is_none() {
                return Err(PartestError::Disconnected);
            }
            info!(running, pending = pending.len(), "Still waiting for test results");
            continue;
        };

        running -= 1;
        stats.finished += 1;
        if !outcome.succeeded() {
            failures += 1;
        }
        reporter.finished(stats, &outcome)?;
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{InlinePool, Isolation, PoolConfig, make_pool};
    use crate::theme;
    use report::ReportOptions;
    use serial_test::serial;

    fn config(command: &[&str], dry_run: bool) -> RunnerConfig {
        RunnerConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            dry_run,
            pass_through: false,
        }
    }

    fn run(
        pool: &mut dyn Pool<TestRunner>,
        tests: &[&str],
        jobs: usize,
    ) -> (Result<RunSummary>, String) {
        theme::disable_colors();
        let mut reporter = Reporter::new(Vec::new(), ReportOptions::default());
        let mut stats = Stats::new("");
        let tests = tests.iter().map(|s| s.to_string()).collect();
        let result = run_tests(pool, tests, jobs, None, &mut reporter, &mut stats);
        (result, String::from_utf8(reporter.into_inner()).unwrap())
    }

    #[test]
    fn test_setup_resolves_runner() {
        let state = TestRunner::setup(&Host::new(), 2, config(&["sh", "-c"], false)).unwrap();
        assert!(state.command[0].ends_with("/sh"));
        assert_eq!(state.worker, 2);
    }

    #[test]
    fn test_setup_missing_runner() {
        let err = TestRunner::setup(&Host::new(), 0, config(&["partest-no-such-runner"], false))
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("runner 'partest-no-such-runner' not found"));

        // dry runs never look at the runner
        assert!(TestRunner::setup(&Host::new(), 0, config(&["partest-no-such-runner"], true)).is_ok());
    }

    #[test]
    fn test_setup_empty_command() {
        assert!(TestRunner::setup(&Host::new(), 0, config(&[], true)).is_err());
    }

    #[test]
    fn test_call_captures_output() {
        let state = TestRunner::setup(&Host::new(), 3, config(&["sh", "-c"], false)).unwrap();
        let outcome = TestRunner::call(
            &state,
            format!("echo out; echo err >&2; echo ${}; exit 4", WORKER_INDEX_ENV),
        )
        .unwrap();
        assert_eq!(outcome.code, 4);
        assert_eq!(outcome.stdout, "out\n3\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.succeeded());

        let summary = TestRunner::teardown(state).unwrap();
        assert_eq!(summary.tests, 1);
        assert_eq!(summary.pid, std::process::id());
    }

    #[test]
    fn test_call_passes_output_through() {
        let config = RunnerConfig {
            pass_through: true,
            ..config(&["sh", "-c"], false)
        };
        let state = TestRunner::setup(&Host::new(), 0, config).unwrap();
        let outcome = TestRunner::call(&state, "echo streamed; exit 2".to_string()).unwrap();
        assert_eq!(outcome.code, 2);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.is_empty());
    }

    #[test]
    fn test_pass_through_defaults_off_on_the_wire() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"command":["sh"],"dry_run":false}"#).unwrap();
        assert!(!config.pass_through);
    }

    #[test]
    #[serial(colors)]
    fn test_run_inline() {
        let mut pool =
            InlinePool::<TestRunner>::new(&Host::new(), &PoolConfig::new(1), config(&["sh", "-c"], false));
        let (result, text) = run(&mut pool, &["exit 0", "exit 1", "true"], 1);
        let summary = result.unwrap();
        assert_eq!(summary.run, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.workers.len(), 1);
        assert_eq!(summary.workers[0].tests, 3);
        assert_eq!(
            text,
            "exit 0 passed\nexit 1 failed\ntrue passed\n3 tests run, 1 failure.\n"
        );
    }

    #[test]
    #[serial(colors)]
    fn test_run_threads() {
        let pool_config = PoolConfig::new(3).with_isolation(Isolation::Thread);
        let mut pool = make_pool::<TestRunner>(&Host::new(), &pool_config, config(&["x"], true)).unwrap();
        let tests: Vec<String> = (0..20).map(|i| format!("suite.test_{}", i)).collect();
        let names: Vec<&str> = tests.iter().map(String::as_str).collect();

        let (result, text) = run(pool.as_mut(), &names, 3);
        let summary = result.unwrap();
        assert_eq!(summary.run, 20);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.workers.iter().map(|w| w.worker).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(summary.workers.iter().map(|w| w.tests).sum::<usize>(), 20);
        assert!(text.ends_with("20 tests run, 0 failures.\n"));
    }

    #[test]
    #[serial(colors)]
    fn test_worker_error_aborts_run() {
        let pool_config = PoolConfig::new(2).with_isolation(Isolation::Thread);
        let mut pool = make_pool::<TestRunner>(
            &Host::new(),
            &pool_config,
            config(&["partest-no-such-runner"], false),
        )
        .unwrap();
        let (result, _) = run(pool.as_mut(), &["a", "b"], 2);
        let err = result.unwrap_err();
        assert!(matches!(err, PartestError::Worker { .. }));
        assert!(err.to_string().contains("runner 'partest-no-such-runner' not found"));
    }
}
