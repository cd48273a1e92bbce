//! Logging setup shared by the CLI and worker subprocesses.
//!
//! Everything goes to stderr; stdout of a worker subprocess is the protocol
//! pipe and must never carry log lines.
//!
//! # Environment Variables
//!
//! - `PARTEST_LOG` - Log filter (overrides RUST_LOG)
//! - `PARTEST_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PARTEST_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PARTEST_LOG_FILE` - Path to a log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable used to hand the parent's level down to workers.
pub const LEVEL_ENV: &str = "PARTEST_LOG_LEVEL";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN, the runner's own output is the report)
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            filter: None,
            show_target: true,
            show_thread_ids: false,
        }
    }
}

impl LogConfig {
    /// Preset for the CLI, driven by `-v` / `-q`.
    pub fn for_cli(verbose: u8, quiet: bool) -> Self {
        let level = if quiet {
            Level::ERROR
        } else {
            match verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                _ => Level::DEBUG,
            }
        };
        Self::default().with_level(level)
    }

    /// Preset for worker subprocesses.
    ///
    /// Thread ids are shown since a worker's driver and loop interleave on stderr.
    pub fn for_worker() -> Self {
        Self {
            show_thread_ids: true,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set from the command line wins over the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("PARTEST_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Some(level) = std::env::var(LEVEL_ENV).ok().and_then(|s| parse_level(&s))
        {
            self.level = level;
        }

        if let Some(format) = std::env::var("PARTEST_LOG_FORMAT")
            .ok()
            .and_then(|f| f.parse().ok())
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("PARTEST_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn stderr_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_writer(std::io::stderr);
        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer
                .compact()
                .with_thread_ids(self.show_thread_ids)
                .boxed(),
            LogFormat::Pretty => layer.with_thread_ids(self.show_thread_ids).boxed(),
        }
    }

    fn file_layer(&self, path: &Path) -> Box<dyn Layer<Registry> + Send + Sync> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("partest.log");
        let appender = tracing_appender::rolling::never(dir, file_name);
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_ansi(false)
            .with_writer(appender);
        match self.format {
            LogFormat::Json => layer.json().boxed(),
            _ => layer.with_thread_ids(self.show_thread_ids).boxed(),
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.stderr_layer()];
    if let Some(path) = &config.file_path {
        layers.push(config.file_layer(path));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
