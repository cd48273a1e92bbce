//! Host adapter: the OS-facing services handed to every worker.
//!
//! `Host` is plain data (a working directory plus environment overrides), so
//! the exact same value can be serialized into a worker subprocess' bootstrap
//! record and rebuilt on the other side.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::SystemTime;

/// Captured result of running an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutput {
    /// Exit code; `128 + signal` when the command was killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CallOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Filesystem, time, environment and process access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    cwd: PathBuf,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// Host rooted at the current working directory.
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            cwd,
            env: BTreeMap::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Add an environment override visible through [`Host::getenv`] and to
    /// every command started with [`Host::call`].
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Handle to pass into an isolated worker.
    pub fn for_worker(&self) -> Host {
        self.clone()
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn getenv(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }

    /// Resolve `path` against the host's working directory.
    pub fn abspath(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.abspath(path).exists()
    }

    pub fn read_text_file(&self, path: impl AsRef<Path>) -> io::Result<String> {
        std::fs::read_to_string(self.abspath(path))
    }

    pub fn write_text_file(&self, path: impl AsRef<Path>, contents: &str) -> io::Result<()> {
        std::fs::write(self.abspath(path), contents)
    }

    pub fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    pub fn cpu_count(&self) -> usize {
        num_cpus::get()
    }

    /// Run `argv` to completion in the host's working directory, capturing
    /// stdout and stderr.
    pub fn call(&self, argv: &[String], extra_env: &[(&str, String)]) -> io::Result<CallOutput> {
        let output = self.command(argv, extra_env)?.output()?;

        Ok(CallOutput {
            code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run `argv` to completion with both of its output streams sent to
    /// this process' stderr. Returns the exit code.
    pub fn stream(&self, argv: &[String], extra_env: &[(&str, String)]) -> io::Result<i32> {
        let status = self
            .command(argv, extra_env)?
            .stdin(Stdio::null())
            .stdout(io::stderr())
            .stderr(io::stderr())
            .status()?;
        Ok(exit_code(status))
    }

    fn command(&self, argv: &[String], extra_env: &[(&str, String)]) -> io::Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(cmd)
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_abspath_and_files() {
        let dir = tempdir().unwrap();
        let host = Host::new().with_cwd(dir.path());

        assert_eq!(host.abspath("a.txt"), dir.path().join("a.txt"));
        assert_eq!(host.abspath("/etc/hosts"), PathBuf::from("/etc/hosts"));

        assert!(!host.exists("a.txt"));
        host.write_text_file("a.txt", "one\ntwo\n").unwrap();
        assert!(host.exists("a.txt"));
        assert_eq!(host.read_text_file("a.txt").unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_env_overrides_reach_commands() {
        let host = Host::new().with_env("PARTEST_HOST_TEST", "override");
        assert_eq!(host.getenv("PARTEST_HOST_TEST").as_deref(), Some("override"));

        let out = host
            .call(
                &argv(&["sh", "-c", "echo $PARTEST_HOST_TEST $EXTRA"]),
                &[("EXTRA", "extra".to_string())],
            )
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "override extra");
    }

    #[test]
    fn test_call_captures_failure() {
        let host = Host::new();
        let out = host
            .call(&argv(&["sh", "-c", "echo oops >&2; exit 3"]), &[])
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn test_call_reports_signal() {
        let host = Host::new();
        let out = host.call(&argv(&["sh", "-c", "kill -9 $$"]), &[]).unwrap();
        assert_eq!(out.code, 128 + 9);
    }

    #[test]
    fn test_call_empty_argv() {
        let err = Host::new().call(&[], &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = Host::new().stream(&[], &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_stream_returns_exit_code() {
        let host = Host::new();
        let code = host
            .stream(&argv(&["sh", "-c", "echo streamed; exit 5"]), &[])
            .unwrap();
        assert_eq!(code, 5);
    }

    #[test]
    fn test_clock_and_cpus() {
        let host = Host::new();
        let before = SystemTime::now();
        let now = host.now();
        assert!(now >= before);
        assert!(now <= SystemTime::now());
        assert!(host.cpu_count() >= 1);
    }

    #[test]
    fn test_host_crosses_serialization() {
        let dir = tempdir().unwrap();
        let host = Host::new().with_cwd(dir.path()).with_env("K", "V");
        let json = serde_json::to_string(&host.for_worker()).unwrap();
        let back: Host = serde_json::from_str(&json).unwrap();
        assert_eq!(back, host);
    }
}
