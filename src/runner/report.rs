//! Per-test result lines and the final summary.

use super::TestOutcome;
use super::stats::Stats;
use crate::theme::Themed;
use std::io::{self, Write};
use std::time::Duration;

/// What the reporter prints.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    /// Only print failures and tests that produced output.
    pub quiet: bool,
    /// Also print a line when a test starts.
    pub verbose: bool,
    /// Print per-test and total durations.
    pub timing: bool,
}

/// Writes test progress to a stream, normally stdout.
pub struct Reporter<W: Write> {
    out: W,
    options: ReportOptions,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, options: ReportOptions) -> Self {
        Self { out, options }
    }

    pub fn started(&mut self, stats: &Stats, name: &str) -> io::Result<()> {
        if self.options.verbose && !self.options.quiet {
            writeln!(self.out, "{}{}", stats.format().muted(), name.test_name())?;
        }
        Ok(())
    }

    pub fn finished(&mut self, stats: &Stats, outcome: &TestOutcome) -> io::Result<()> {
        let has_output = !outcome.stdout.is_empty() || !outcome.stderr.is_empty();
        if outcome.succeeded() && self.options.quiet && !has_output {
            return Ok(());
        }

        let verdict = if outcome.succeeded() {
            "passed".passed()
        } else {
            "failed".failed()
        };
        let timing = if self.options.timing {
            format!(" {:.4}s", outcome.took.as_secs_f64())
        } else {
            String::new()
        };
        writeln!(
            self.out,
            "{}{} {}{}{}",
            stats.format().muted(),
            outcome.name.test_name(),
            verdict,
            timing,
            if has_output { ":" } else { "" }
        )?;

        for line in outcome.stdout.lines().chain(outcome.stderr.lines()) {
            writeln!(self.out, "  {}", line)?;
        }
        Ok(())
    }

    /// `N tests run[ in X.XXXXs], M failure(s).`
    pub fn summary(&mut self, run: usize, failures: usize, elapsed: Duration) -> io::Result<()> {
        if self.options.quiet {
            return Ok(());
        }
        let timing = if self.options.timing {
            format!(" in {:.4}s", elapsed.as_secs_f64())
        } else {
            String::new()
        };
        writeln!(
            self.out,
            "{} tests run{}, {} failure{}.",
            run,
            timing,
            failures,
            if failures == 1 { "" } else { "s" }
        )?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theme;
    use serial_test::serial;

    fn outcome(name: &str, code: i32, stdout: &str) -> TestOutcome {
        TestOutcome {
            name: name.to_string(),
            code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            took: Duration::from_millis(1500),
        }
    }

    fn render(options: ReportOptions, f: impl FnOnce(&mut Reporter<Vec<u8>>)) -> String {
        theme::disable_colors();
        let mut reporter = Reporter::new(Vec::new(), options);
        f(&mut reporter);
        String::from_utf8(reporter.into_inner()).unwrap()
    }

    #[test]
    #[serial(colors)]
    fn test_finished_lines() {
        let mut stats = Stats::new("[%f/%t] ");
        stats.total = 2;
        stats.finished = 1;

        let text = render(ReportOptions::default(), |r| {
            r.finished(&stats, &outcome("a.pass", 0, "")).unwrap();
            r.finished(&stats, &outcome("a.fail", 1, "boom\nbang")).unwrap();
        });
        assert_eq!(text, "[1/2] a.pass passed\n[1/2] a.fail failed:\n  boom\n  bang\n");
    }

    #[test]
    #[serial(colors)]
    fn test_quiet_hides_silent_passes() {
        let stats = Stats::new("");
        let options = ReportOptions {
            quiet: true,
            ..Default::default()
        };
        let text = render(options, |r| {
            r.finished(&stats, &outcome("a.pass", 0, "")).unwrap();
            r.finished(&stats, &outcome("a.fail", 1, "")).unwrap();
            r.summary(2, 1, Duration::ZERO).unwrap();
        });
        assert_eq!(text, "a.fail failed\n");
    }

    #[test]
    #[serial(colors)]
    fn test_timing() {
        let stats = Stats::new("");
        let options = ReportOptions {
            timing: true,
            ..Default::default()
        };
        let text = render(options, |r| {
            r.finished(&stats, &outcome("t", 0, "")).unwrap();
            r.summary(1, 0, Duration::from_millis(2500)).unwrap();
        });
        assert_eq!(text, "t passed 1.5000s\n1 tests run in 2.5000s, 0 failures.\n");
    }

    #[test]
    #[serial(colors)]
    fn test_summary_plural() {
        let text = render(ReportOptions::default(), |r| r.summary(3, 1, Duration::ZERO).unwrap());
        assert_eq!(text, "3 tests run, 1 failure.\n");
    }
}
