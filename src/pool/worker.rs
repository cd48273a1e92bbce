//! The worker loop: setup once, handle jobs sequentially, teardown once.
//!
//! The same loop runs inside worker threads (over channels) and inside
//! worker subprocesses (over stdin/stdout, see [`run_worker_main`]).

use super::ipc::{LineReader, LineWriter};
use super::protocol::{Bootstrap, Message};
use super::{Handler, HandlerMessage, TeardownPolicy};
use crate::error::{PartestError, Result};
use crate::host::Host;
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info_span, trace, warn};

/// A worker's view of its two channels.
pub(crate) trait Endpoint<H: Handler> {
    /// Next message for this worker; `None` once the dispatcher is gone.
    fn recv(&mut self) -> Option<HandlerMessage<H>>;

    fn send(&mut self, message: HandlerMessage<H>) -> Result<()>;
}

/// How a worker's life ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Closed gracefully and emitted Done.
    Done,
    /// Emitted Error.
    Failed,
    /// Teardown failed and the failure was dropped; nothing was emitted.
    TeardownDropped,
    /// The dispatcher went away without a Close; nothing was emitted.
    Abandoned,
}

impl WorkerExit {
    pub(crate) fn exit_code(self) -> i32 {
        match self {
            Self::Done | Self::Abandoned => 0,
            Self::Failed | Self::TeardownDropped => 1,
        }
    }
}

/// Run `f`, turning both an `Err` and a panic into a description.
pub(crate) fn guard<T>(f: impl FnOnce() -> anyhow::Result<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Run one worker's whole life against `endpoint`.
pub(crate) fn run_worker<H, E>(
    index: usize,
    host: &Host,
    context: H::Context,
    teardown: TeardownPolicy,
    endpoint: &mut E,
) -> WorkerExit
where
    H: Handler,
    E: Endpoint<H>,
{
    let _span = info_span!("worker", index).entered();

    let fail = |endpoint: &mut E, message: String| {
        error!(worker = index, %message, "Worker failed");
        let _ = endpoint.send(Message::Error {
            worker: index,
            message,
        });
        WorkerExit::Failed
    };

    let state = match guard(|| H::setup(host, index, context)) {
        Ok(state) => state,
        Err(message) => return fail(endpoint, format!("setup failed: {}", message)),
    };
    debug!(worker = index, "Worker ready");

    let mut jobs = 0usize;
    loop {
        match endpoint.recv() {
            Some(Message::Request { job }) => {
                let result = match guard(|| H::call(&state, job)) {
                    Ok(result) => result,
                    Err(message) => return fail(endpoint, message),
                };
                jobs += 1;
                trace!(worker = index, jobs, "Job finished");
                if endpoint.send(Message::Response { result }).is_err() {
                    debug!(worker = index, "Dispatcher gone while sending response");
                    return WorkerExit::Abandoned;
                }
            }
            Some(Message::Close) => break,
            Some(other) => {
                return fail(
                    endpoint,
                    format!("unexpected {} message from dispatcher", other.kind()),
                );
            }
            None => {
                debug!(worker = index, jobs, "Request stream closed without Close");
                return WorkerExit::Abandoned;
            }
        }
    }

    match guard(|| H::teardown(state)) {
        Ok(context) => {
            debug!(worker = index, jobs, "Worker done");
            let _ = endpoint.send(Message::Done {
                worker: index,
                context,
            });
            WorkerExit::Done
        }
        Err(message) => match teardown {
            TeardownPolicy::Ignore => {
                warn!(worker = index, %message, "Teardown failed; no final context");
                WorkerExit::TeardownDropped
            }
            TeardownPolicy::Report => fail(endpoint, format!("teardown failed: {}", message)),
        },
    }
}

/// Endpoint for thread workers.
pub(crate) struct ChannelEndpoint<H: Handler> {
    pub(crate) requests: Receiver<HandlerMessage<H>>,
    pub(crate) responses: Sender<HandlerMessage<H>>,
    /// Set when the pool is torn down; pending requests are ignored.
    pub(crate) abort: Arc<AtomicBool>,
}

impl<H: Handler> Endpoint<H> for ChannelEndpoint<H> {
    fn recv(&mut self) -> Option<HandlerMessage<H>> {
        let message = self.requests.recv().ok()?;
        if self.abort.load(Ordering::Acquire) {
            return None;
        }
        Some(message)
    }

    fn send(&mut self, message: HandlerMessage<H>) -> Result<()> {
        self.responses
            .send(message)
            .map_err(|_| PartestError::Disconnected)
    }
}

/// Endpoint for subprocess workers: JSON lines over a pipe pair.
pub(crate) struct PipeEndpoint<R: Read, W: Write> {
    reader: LineReader<R>,
    writer: LineWriter<W>,
}

impl<R: Read, W: Write> PipeEndpoint<R, W> {
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            reader: LineReader::new(reader),
            writer: LineWriter::new(writer),
        }
    }

    /// Read the bootstrap record that precedes all messages.
    pub(crate) fn bootstrap<C>(&mut self) -> Result<Bootstrap<C>>
    where
        C: serde::Serialize + serde::de::DeserializeOwned,
    {
        match self.reader.read_line()? {
            Some(line) => Bootstrap::from_line(line),
            None => Err(PartestError::Protocol(
                "stdin closed before bootstrap".to_string(),
            )),
        }
    }
}

impl<H: Handler, R: Read, W: Write> Endpoint<H> for PipeEndpoint<R, W> {
    fn recv(&mut self) -> Option<HandlerMessage<H>> {
        let line = match self.reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "Failed to read from dispatcher");
                return None;
            }
        };
        match Message::from_line(line) {
            Ok(message) => Some(message),
            Err(e) => {
                error!(error = %e, "Malformed message from dispatcher");
                None
            }
        }
    }

    fn send(&mut self, message: HandlerMessage<H>) -> Result<()> {
        let line = message.to_line()?;
        self.writer.write_line(&line)?;
        Ok(())
    }
}

/// Entry point of a worker subprocess.
///
/// Call this from `main` when the binary was started with
/// [`WORKER_FLAG`](super::WORKER_FLAG). Reads the bootstrap record from
/// stdin, runs the worker loop over stdin/stdout and exits the process.
pub fn run_worker_main<H: Handler>() -> ! {
    // Pipe errors surface as io::Error instead of killing the process.
    // Safety: installing SIG_IGN has no handler code to run.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let mut endpoint = PipeEndpoint::new(io::stdin().lock(), io::stdout().lock());

    let code = match endpoint.bootstrap::<H::Context>() {
        Ok(boot) => {
            let exit = run_worker::<H, _>(
                boot.worker,
                &boot.host,
                boot.context,
                boot.teardown,
                &mut endpoint,
            );
            exit.exit_code()
        }
        Err(e) => {
            error!(error = %e, "Worker bootstrap failed");
            2
        }
    };
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Adds its derived context to each job; job 13 fails, job 99 panics.
    struct Adder;

    impl Handler for Adder {
        type Context = i64;
        type State = i64;
        type Job = i64;
        type Output = i64;
        type Final = i64;

        fn setup(_: &Host, _: usize, context: i64) -> anyhow::Result<i64> {
            anyhow::ensure!(context >= 0, "negative context {}", context);
            Ok(context + 1)
        }

        fn call(state: &i64, job: i64) -> anyhow::Result<i64> {
            match job {
                13 => anyhow::bail!("unlucky job"),
                99 => panic!("job 99 exploded"),
                _ => Ok(state + job),
            }
        }

        fn teardown(state: i64) -> anyhow::Result<i64> {
            anyhow::ensure!(state != 42, "cannot tear down 42");
            Ok(state * 10)
        }
    }

    type Msg = HandlerMessage<Adder>;

    /// Scripted inbox, recorded outbox.
    struct Script {
        inbox: VecDeque<Msg>,
        outbox: Vec<Msg>,
    }

    impl Script {
        fn new(inbox: Vec<Msg>) -> Self {
            Self {
                inbox: inbox.into(),
                outbox: Vec::new(),
            }
        }
    }

    impl Endpoint<Adder> for Script {
        fn recv(&mut self) -> Option<Msg> {
            self.inbox.pop_front()
        }

        fn send(&mut self, message: Msg) -> Result<()> {
            self.outbox.push(message);
            Ok(())
        }
    }

    fn run(context: i64, inbox: Vec<Msg>, policy: TeardownPolicy) -> (WorkerExit, Vec<Msg>) {
        let mut script = Script::new(inbox);
        let exit = run_worker::<Adder, _>(4, &Host::new(), context, policy, &mut script);
        (exit, script.outbox)
    }

    fn req(job: i64) -> Msg {
        Message::Request { job }
    }

    #[test]
    fn test_jobs_then_done() {
        let (exit, out) = run(0, vec![req(1), req(2), Message::Close], TeardownPolicy::Ignore);
        assert_eq!(exit, WorkerExit::Done);
        assert_eq!(
            out,
            vec![
                Message::Response { result: 2 },
                Message::Response { result: 3 },
                Message::Done {
                    worker: 4,
                    context: 10
                },
            ]
        );
    }

    #[test]
    fn test_setup_failure_is_single_error() {
        let (exit, out) = run(-1, vec![req(1), Message::Close], TeardownPolicy::Ignore);
        assert_eq!(exit, WorkerExit::Failed);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Message::Error { worker, message } => {
                assert_eq!(*worker, 4);
                assert!(message.contains("setup failed"));
                assert!(message.contains("negative context -1"));
            }
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_callback_error_stops_worker() {
        let (exit, out) = run(
            0,
            vec![req(1), req(13), req(2), Message::Close],
            TeardownPolicy::Ignore,
        );
        assert_eq!(exit, WorkerExit::Failed);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Message::Response { result: 2 });
        assert!(matches!(&out[1], Message::Error { message, .. } if message == "unlucky job"));
    }

    #[test]
    fn test_panic_is_caught() {
        let (exit, out) = run(0, vec![req(99)], TeardownPolicy::Ignore);
        assert_eq!(exit, WorkerExit::Failed);
        assert!(matches!(&out[..], [Message::Error { message, .. }] if message.contains("job 99 exploded")));
    }

    #[test]
    fn test_teardown_failure_ignored() {
        // derived context 42 makes teardown fail
        let (exit, out) = run(41, vec![req(1), Message::Close], TeardownPolicy::Ignore);
        assert_eq!(exit, WorkerExit::TeardownDropped);
        assert_eq!(out, vec![Message::Response { result: 43 }]);
    }

    #[test]
    fn test_teardown_failure_reported() {
        let (exit, out) = run(41, vec![Message::Close], TeardownPolicy::Report);
        assert_eq!(exit, WorkerExit::Failed);
        assert!(matches!(&out[..], [Message::Error { message, .. }] if message.starts_with("teardown failed")));
    }

    #[test]
    fn test_abandoned_skips_teardown() {
        let (exit, out) = run(0, vec![req(5)], TeardownPolicy::Report);
        assert_eq!(exit, WorkerExit::Abandoned);
        assert_eq!(out, vec![Message::Response { result: 6 }]);
    }

    #[test]
    fn test_unexpected_message_is_fatal() {
        let (exit, out) = run(0, vec![Message::Response { result: 1 }], TeardownPolicy::Ignore);
        assert_eq!(exit, WorkerExit::Failed);
        assert!(matches!(&out[..], [Message::Error { message, .. }] if message.contains("unexpected response")));
    }

    #[test]
    fn test_pipe_endpoint_session() {
        let input = concat!(
            r#"{"worker":1,"host":{"cwd":"/"},"context":2}"#,
            "\n",
            r#"{"type":"request","job":5}"#,
            "\n",
            r#"{"type":"close"}"#,
            "\n",
        );
        let mut output = Vec::new();
        let exit = {
            let mut endpoint = PipeEndpoint::new(input.as_bytes(), &mut output);
            let boot = endpoint.bootstrap::<i64>().unwrap();
            run_worker::<Adder, _>(
                boot.worker,
                &boot.host,
                boot.context,
                boot.teardown,
                &mut endpoint,
            )
        };
        assert_eq!(exit, WorkerExit::Done);
        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"{"type":"response","result":8}"#,
                r#"{"type":"done","worker":1,"context":30}"#,
            ]
        );
    }

    #[test]
    fn test_guard_messages() {
        assert_eq!(guard(|| Ok(1)), Ok(1));
        let err = guard::<()>(|| Err(anyhow::anyhow!("inner").context("outer"))).unwrap_err();
        assert_eq!(err, "outer: inner");
        let err = guard::<()>(|| panic!("{}", String::from("owned"))).unwrap_err();
        assert_eq!(err, "panicked: owned");
    }
}
