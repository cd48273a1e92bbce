//! Command-line interface definitions using clap.

use clap::{Parser, ValueEnum};
use partest::pool::{Isolation, TeardownPolicy};
use partest::runner::report::ReportOptions;
use partest::runner::stats::DEFAULT_STATUS_FORMAT;
use std::path::PathBuf;
use std::time::Duration;

/// Run tests in parallel, each in an isolated worker.
#[derive(Parser, Debug)]
#[command(name = "partest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Test names; each is appended to the runner command.
    pub tests: Vec<String>,

    /// Read test names from FILE, one per line ("-" for stdin).
    #[arg(short, long, value_name = "FILE")]
    pub file_list: Option<PathBuf>,

    /// Print the sorted test names and exit.
    #[arg(short, long)]
    pub list_only: bool,

    /// Number of tests to run in parallel.
    #[arg(short, long, env = "PARTEST_JOBS", default_value_t = default_jobs())]
    pub jobs: usize,

    /// Report every test as passed without running it.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Runner command, split on whitespace; the test name is appended.
    #[arg(short, long, env = "PARTEST_RUNNER", value_name = "CMD")]
    pub runner: Option<String>,

    /// Only print failures and tests that produced output.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// More output (-v for info logs and started lines, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print per-test and total timing.
    #[arg(short, long)]
    pub timing: bool,

    /// Status prefix (%s started, %t total, %r running, %u pending,
    /// %f finished, %o rate, %e elapsed, %% percent).
    #[arg(
        short,
        long,
        env = "NINJA_STATUS",
        default_value = DEFAULT_STATUS_FORMAT,
        value_name = "FMT"
    )]
    pub status_format: String,

    /// How workers are isolated.
    #[arg(long, value_enum, default_value_t = IsolationArg::Process)]
    pub isolation: IsolationArg,

    /// Treat a failing worker teardown as an error.
    #[arg(long)]
    pub strict_teardown: bool,

    /// Seconds to wait for a result before logging progress.
    #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
    pub heartbeat: Option<Duration>,

    /// Stream test output to stderr while tests run instead of capturing it.
    #[arg(short, long)]
    pub pass_through: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    /// Run as a pool worker subprocess.
    #[arg(long, hide = true)]
    pub internal_worker: bool,
}

fn default_jobs() -> usize {
    num_cpus::get()
}

/// A positive number of seconds that fits in a `Duration`.
fn parse_seconds(arg: &str) -> Result<Duration, String> {
    let secs: f64 = arg.parse().map_err(|e| format!("{}", e))?;
    if secs <= 0.0 {
        return Err("must be greater than zero".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

/// Worker isolation argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationArg {
    /// One subprocess per worker.
    #[default]
    Process,
    /// One thread per worker.
    Thread,
    /// Run every test in the main thread.
    Inline,
}

impl From<IsolationArg> for Isolation {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::Process => Isolation::Process,
            IsolationArg::Thread => Isolation::Thread,
            IsolationArg::Inline => Isolation::Inline,
        }
    }
}

impl Cli {
    pub fn teardown_policy(&self) -> TeardownPolicy {
        if self.strict_teardown {
            TeardownPolicy::Report
        } else {
            TeardownPolicy::Ignore
        }
    }

    /// The runner command line. Dry runs never execute it, so any
    /// placeholder will do when none is configured.
    pub fn runner_command(&self) -> Option<Vec<String>> {
        let command: Vec<String> = self
            .runner
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();
        match (command.is_empty(), self.dry_run) {
            (false, _) => Some(command),
            (true, true) => Some(vec!["true".to_string()]),
            (true, false) => None,
        }
    }

    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            quiet: self.quiet,
            verbose: self.verbose > 0,
            timing: self.timing,
        }
    }
}
