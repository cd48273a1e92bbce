//! Color theming for test reports.
//!
//! Colors can be disabled globally via the `--no-color` flag or the
//! `NO_COLOR` environment variable, and are off when stdout is not a
//! terminal. When disabled, every theming method returns unstyled text.

use owo_colors::OwoColorize;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global color enable flag.
static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in `main`.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

fn styled<T: Display + ?Sized>(value: &T, style: impl FnOnce(&T) -> String) -> String {
    if colors_enabled() {
        style(value)
    } else {
        value.to_string()
    }
}

/// Semantic styles for report text.
pub trait Themed: Display {
    /// Passing verdict (green).
    fn passed(&self) -> String {
        styled(self, |s| s.green().to_string())
    }

    /// Failing verdict (bold red).
    fn failed(&self) -> String {
        styled(self, |s| s.red().bold().to_string())
    }

    /// Test identifiers (cyan).
    fn test_name(&self) -> String {
        styled(self, |s| s.cyan().to_string())
    }

    /// Status prefix and captured output (dimmed).
    fn muted(&self) -> String {
        styled(self, |s| s.dimmed().to_string())
    }
}

impl<T: Display + ?Sized> Themed for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_colors() {
        COLORS_ENABLED.store(true, Ordering::Relaxed);
        owo_colors::set_override(true);
    }

    #[test]
    #[serial(colors)]
    fn test_colored_when_enabled() {
        reset_colors();
        let text = "failed".failed();
        assert!(text.contains("failed"));
        assert!(text.contains('\x1b'));
    }

    #[test]
    #[serial(colors)]
    fn test_disable_colors() {
        reset_colors();
        disable_colors();
        assert!(!colors_enabled());
        assert_eq!("passed".passed(), "passed");
        assert_eq!("suite.test".test_name(), "suite.test");
        reset_colors();
    }
}
