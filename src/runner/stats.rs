//! Progress counters and the ninja-style status prefix.

use std::time::{Duration, Instant};

pub const DEFAULT_STATUS_FORMAT: &str = "[%f/%t] ";

/// Counters rendered into the prefix of every report line.
///
/// | spec | meaning |
/// |------|---------|
/// | `%s` | tests started |
/// | `%t` | total tests |
/// | `%r` | tests running |
/// | `%u` | tests not yet started |
/// | `%f` | tests finished |
/// | `%o` | finished tests per second |
/// | `%e` | elapsed seconds |
/// | `%%` | a literal `%` |
#[derive(Debug, Clone)]
pub struct Stats {
    format: String,
    started_at: Instant,
    pub total: usize,
    pub started: usize,
    pub finished: usize,
}

impl Stats {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            started_at: Instant::now(),
            total: 0,
            started: 0,
            finished: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Render the status prefix now.
    pub fn format(&self) -> String {
        self.format_at(self.elapsed())
    }

    fn format_at(&self, elapsed: Duration) -> String {
        let mut out = String::with_capacity(self.format.len() + 8);
        let mut chars = self.format.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('s') => out.push_str(&self.started.to_string()),
                Some('t') => out.push_str(&self.total.to_string()),
                Some('r') => out.push_str(&self.started.saturating_sub(self.finished).to_string()),
                Some('u') => out.push_str(&self.total.saturating_sub(self.started).to_string()),
                Some('f') => out.push_str(&self.finished.to_string()),
                Some('o') => {
                    let secs = elapsed.as_secs_f64();
                    if secs > 0.0 {
                        out.push_str(&format!("{:.1}", self.finished as f64 / secs));
                    } else {
                        out.push('-');
                    }
                }
                Some('e') => out.push_str(&format!("{:.3}", elapsed.as_secs_f64())),
                Some('%') => out.push('%'),
                // unknown specifiers pass through untouched
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(format: &str) -> Stats {
        let mut stats = Stats::new(format);
        stats.total = 10;
        stats.started = 7;
        stats.finished = 4;
        stats
    }

    #[test]
    fn test_default_format() {
        assert_eq!(stats(DEFAULT_STATUS_FORMAT).format_at(Duration::ZERO), "[4/10] ");
    }

    #[test]
    fn test_counters() {
        let s = stats("%s %t %r %u %f");
        assert_eq!(s.format_at(Duration::ZERO), "7 10 3 3 4");
    }

    #[test]
    fn test_rate_and_elapsed() {
        let s = stats("%o/s %es");
        assert_eq!(s.format_at(Duration::from_secs(2)), "2.0/s 2.000s");
        assert_eq!(s.format_at(Duration::ZERO), "-/s 0.000s");
    }

    #[test]
    fn test_literals() {
        let s = stats("100%% %x %");
        assert_eq!(s.format_at(Duration::ZERO), "100% %x %");
    }
}
