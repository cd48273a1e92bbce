//! partest - parallel test runner

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use partest::host::Host;
use partest::logging::{self, LEVEL_ENV, LogConfig};
use partest::pool::{PoolConfig, WorkerCommand, make_pool, run_worker_main};
use partest::runner::report::Reporter;
use partest::runner::stats::Stats;
use partest::runner::{RunnerConfig, TestRunner, run_tests};
use partest::theme;
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::path::Path;

use cli::Cli;

/// Parses the command line, then either serves as a pool worker or runs the
/// requested tests. Errors are printed with their cause chain and exit 1.
fn main() {
    let cli = Cli::parse();

    if cli.internal_worker {
        logging::init(LogConfig::for_worker().with_env_overrides());
        run_worker_main::<TestRunner>();
    }

    if cli.no_color || !io::stdout().is_terminal() {
        theme::disable_colors();
    }

    let log_config = LogConfig::for_cli(cli.verbose, cli.quiet).with_env_overrides();
    let level = log_config.level;
    logging::init(log_config);

    let result = run(&cli, level);

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli, level: tracing::Level) -> Result<i32> {
    let mut tests = cli.tests.clone();
    if let Some(path) = &cli.file_list {
        tests.extend(read_test_list(path)?);
    }

    if cli.list_only {
        tests.sort();
        let mut stdout = io::stdout().lock();
        for test in &tests {
            writeln!(stdout, "{}", test)?;
        }
        return Ok(0);
    }

    let Some(command) = cli.runner_command() else {
        bail!("no runner command; pass --runner or set PARTEST_RUNNER");
    };

    let host = Host::new();
    let config = PoolConfig::new(cli.jobs)
        .with_isolation(cli.isolation.into())
        .with_teardown(cli.teardown_policy())
        .with_worker_command(WorkerCommand::current_exe().env(LEVEL_ENV, level.as_str()));
    let context = RunnerConfig {
        command,
        dry_run: cli.dry_run,
        pass_through: cli.pass_through,
    };

    let mut pool =
        make_pool::<TestRunner>(&host, &config, context).context("Failed to start workers")?;

    let mut reporter = Reporter::new(io::stdout().lock(), cli.report_options());
    let mut stats = Stats::new(cli.status_format.clone());
    let summary = run_tests(
        pool.as_mut(),
        tests,
        cli.jobs,
        cli.heartbeat,
        &mut reporter,
        &mut stats,
    )?;

    Ok(summary.exit_code())
}

/// Test names from a file, or stdin for "-". Blank lines and `#` comments
/// are skipped.
fn read_test_list(path: &Path) -> Result<Vec<String>> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open test list {}", path.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut tests = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            tests.push(line.to_string());
        }
    }
    Ok(tests)
}
