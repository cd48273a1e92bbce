//! Handle to a worker subprocess, and the threads that drive it.

use super::ipc::{LineReader, LineWriter};
use super::protocol::Message;
use super::signals::{TerminationReason, analyze_wait_status};
use super::{Handler, HandlerMessage};
use crate::error::{PartestError, Result};
use crossbeam_channel::{Receiver, RecvError, Sender, select};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long a closed worker gets to exit before it is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One parsed line from a worker's stdout.
pub(crate) type Reply<H> = Result<HandlerMessage<H>>;

/// Shared guard over a child's pid.
///
/// Signals and reaping both happen under the lock, and a reaped pid is never
/// signalled, so a pid the kernel has handed to another process is never hit.
#[derive(Clone)]
pub(crate) struct Reaper {
    pid: Pid,
    reaped: Arc<Mutex<bool>>,
}

impl Reaper {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            reaped: Arc::new(Mutex::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn is_reaped(&self) -> bool {
        *self.lock()
    }

    /// Send `sig` unless the child has already been waited for.
    pub(crate) fn kill(&self, sig: Signal) {
        let reaped = self.lock();
        if !*reaped {
            let _ = signal::kill(self.pid, sig);
        }
    }

    /// Non-blocking wait.
    fn try_wait(&self) -> Result<Option<WaitStatus>> {
        let mut reaped = self.lock();
        if *reaped {
            return Err(PartestError::Protocol("worker process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                *reaped = true;
                Ok(Some(status))
            }
            Err(e) => {
                // ECHILD: nothing left to reap
                *reaped = true;
                Err(PartestError::Io(std::io::Error::from(e)))
            }
        }
    }

    /// SIGKILL the child and wait for it. `None` if it was already reaped.
    fn kill_and_wait(&self) -> Option<WaitStatus> {
        let mut reaped = self.lock();
        if *reaped {
            return None;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        *reaped = true;
        waitpid(self.pid, None).ok()
    }
}

/// Handle to a worker subprocess with its two pipes.
pub(crate) struct Proc {
    reaper: Reaper,
    /// `None` once stdin has been closed.
    writer: Option<LineWriter<ChildStdin>>,
    /// `None` once handed to a reader thread.
    reader: Option<LineReader<ChildStdout>>,
}

impl Proc {
    /// Take ownership of a spawned child's stdin and stdout.
    ///
    /// The child is reaped through `waitpid`, not through `std::process::Child`.
    pub(crate) fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PartestError::Protocol("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PartestError::Protocol("worker stdout not captured".into()))?;

        Ok(Self {
            reaper: Reaper::new(pid),
            writer: Some(LineWriter::new(stdin)),
            reader: Some(LineReader::new(stdout)),
        })
    }

    pub(crate) fn pid(&self) -> Pid {
        self.reaper.pid()
    }

    /// Handle the pool keeps for signalling this child.
    pub(crate) fn reaper(&self) -> Reaper {
        self.reaper.clone()
    }

    pub(crate) fn take_reader(&mut self) -> Result<LineReader<ChildStdout>> {
        self.reader
            .take()
            .ok_or_else(|| PartestError::Protocol("worker stdout already taken".into()))
    }

    pub(crate) fn send_line(&mut self, line: &str) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(PartestError::Disconnected)?;
        writer.write_line(line)?;
        Ok(())
    }

    pub(crate) fn send<H: Handler>(&mut self, message: &HandlerMessage<H>) -> Result<()> {
        let line = message.to_line()?;
        self.send_line(&line)
    }

    /// Close the child's stdin so a worker waiting for a message sees EOF.
    pub(crate) fn close_stdin(&mut self) {
        self.writer = None;
    }

    /// Close stdin and wait for the child to exit, escalating to SIGTERM and
    /// then SIGKILL once `grace` has passed.
    pub(crate) fn shutdown(&mut self, grace: Duration) -> TerminationReason {
        self.close_stdin();
        if self.reaper.is_reaped() {
            return TerminationReason::Unknown;
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            match self.reaper.try_wait() {
                Ok(Some(status)) => return analyze_wait_status(status),
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => return TerminationReason::Unknown,
            }
        }

        warn!(pid = self.pid().as_raw(), "Worker did not exit in time, terminating");
        self.reaper.kill(Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(100));
        if let Ok(Some(status)) = self.reaper.try_wait() {
            return analyze_wait_status(status);
        }

        match self.reaper.kill_and_wait() {
            Some(status) => analyze_wait_status(status),
            None => TerminationReason::Unknown,
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        let _ = self.reaper.kill_and_wait();
    }
}

/// Forward every message the worker writes until its stdout closes.
///
/// Returning drops `replies`, which is how the driver sees EOF. A line that
/// does not parse is forwarded as an error and ends the stream.
pub(crate) fn forward_replies<H: Handler>(
    mut reader: LineReader<ChildStdout>,
    replies: Sender<Reply<H>>,
) {
    loop {
        let reply = match reader.read_line() {
            Ok(Some(line)) => Message::from_line(line),
            Ok(None) => return,
            Err(e) => Err(e.into()),
        };
        let failed = reply.is_err();
        if replies.send(reply).is_err() || failed {
            return;
        }
    }
}

/// Why a driver stopped pumping messages.
enum Pump {
    /// The worker emitted its terminal message, or closed without one.
    Finished,
    /// The worker died or its pipe broke before finishing.
    Died,
    /// The pool stopped sending (aborted or dropped).
    Abandoned,
}

/// Everything one driver thread needs.
pub(crate) struct Driver<H: Handler> {
    pub(crate) index: usize,
    pub(crate) proc: Proc,
    pub(crate) requests: Receiver<HandlerMessage<H>>,
    /// Fed by the worker's reader thread; disconnects at EOF.
    pub(crate) replies: Receiver<Reply<H>>,
    pub(crate) responses: Sender<HandlerMessage<H>>,
    pub(crate) abort: Arc<AtomicBool>,
}

impl<H: Handler> Driver<H> {
    /// Feed the worker one request at a time and relay its replies, then
    /// reap it.
    pub(crate) fn run(mut self) {
        let outcome = self.pump();
        let reason = self.proc.shutdown(SHUTDOWN_GRACE);

        let aborting = self.abort.load(Ordering::Acquire);
        debug!(worker = self.index, %reason, aborting, "Worker process exited");

        if matches!(outcome, Pump::Died) && !aborting {
            let _ = self.responses.send(Message::Error {
                worker: self.index,
                message: format!("worker process exited unexpectedly: {}", reason),
            });
        }
    }

    fn pump(&mut self) -> Pump {
        loop {
            // Only pull from the shared queue while the worker is idle, so
            // jobs go to whichever worker frees up first. An idle worker can
            // still speak: a failed setup is reported before any request.
            let message = select! {
                recv(self.requests) -> message => match message {
                    Ok(message) => message,
                    Err(_) => return Pump::Abandoned,
                },
                recv(self.replies) -> reply => return self.unprompted(reply),
            };
            if self.abort.load(Ordering::Acquire) {
                return Pump::Abandoned;
            }

            let closing = matches!(message, Message::Close);
            trace!(worker = self.index, kind = message.kind(), "Forwarding to worker");
            if let Err(e) = self.proc.send::<H>(&message) {
                debug!(worker = self.index, error = %e, "Failed to write to worker");
                // a worker whose setup failed exits right after its Error
                return match self.replies.recv() {
                    Ok(Ok(reply @ Message::Error { .. })) => {
                        let _ = self.responses.send(reply);
                        Pump::Finished
                    }
                    _ => Pump::Died,
                };
            }

            let reply = match self.replies.recv() {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(worker = self.index, error = %e, "Failed to read from worker");
                    return Pump::Died;
                }
                // a closed worker whose teardown failure was dropped exits silently
                Err(_) if closing => return Pump::Finished,
                Err(_) => return Pump::Died,
            };

            let terminal = reply.is_terminal();
            let reply = match reply {
                Message::Response { .. } if !closing => reply,
                Message::Done { .. } | Message::Error { .. } => reply,
                other => self.unexpected(&other),
            };
            let forced_terminal = !terminal && reply.is_terminal();

            if self.responses.send(reply).is_err() {
                return Pump::Abandoned;
            }
            if terminal || closing || forced_terminal {
                return Pump::Finished;
            }
        }
    }

    /// Handle a reply that arrived while the worker had no request.
    fn unprompted(&self, reply: std::result::Result<Reply<H>, RecvError>) -> Pump {
        let reply = match reply {
            Ok(Ok(reply @ Message::Error { .. })) => reply,
            Ok(Ok(other)) => self.unexpected(&other),
            Ok(Err(e)) => {
                warn!(worker = self.index, error = %e, "Failed to read from worker");
                return Pump::Died;
            }
            // exited while idle
            Err(_) => return Pump::Died,
        };
        let _ = self.responses.send(reply);
        Pump::Finished
    }

    fn unexpected(&self, reply: &HandlerMessage<H>) -> HandlerMessage<H> {
        Message::Error {
            worker: self.index,
            message: format!("worker sent unexpected {} message", reply.kind()),
        }
    }
}
