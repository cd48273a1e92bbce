//! Parallel pool variant: N workers behind a shared request channel.

use super::proc::{Driver, Reaper, forward_replies};
use super::protocol::{Bootstrap, Message};
use super::spawn::{spawn_driver_thread, spawn_reader_thread, spawn_worker};
use super::worker::{ChannelEndpoint, run_worker};
use super::{Handler, HandlerMessage, Pool, PoolConfig};
use crate::error::{PartestError, Result};
use crate::host::Host;
use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct WorkerSlot {
    /// Worker thread, or driver thread for a subprocess.
    handle: Option<JoinHandle<()>>,
    /// Subprocess, once its driver owns the `Proc`.
    child: Option<Reaper>,
}

/// Parallel pool with process or thread isolation.
///
/// Jobs go into one unbounded request channel that every worker pulls from
/// when idle; results come back on one response channel. The pool itself
/// holds no response sender, so the response channel disconnects once every
/// worker has exited.
pub struct Dispatcher<H: Handler> {
    parallelism: usize,
    requests: Option<Sender<HandlerMessage<H>>>,
    responses: Receiver<HandlerMessage<H>>,
    workers: Vec<WorkerSlot>,
    abort: Arc<AtomicBool>,
    /// Per worker: a terminal message has been seen.
    finished: Vec<bool>,
    /// Final contexts that arrived before `join`.
    finals: Vec<Option<H::Final>>,
    closed: bool,
    erred: bool,
    joined: bool,
}

impl<H: Handler> Dispatcher<H> {
    fn empty(
        parallelism: usize,
    ) -> (
        Self,
        Receiver<HandlerMessage<H>>,
        Sender<HandlerMessage<H>>,
    ) {
        let (request_tx, request_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let pool = Self {
            parallelism,
            requests: Some(request_tx),
            responses: response_rx,
            workers: Vec::with_capacity(parallelism),
            abort: Arc::new(AtomicBool::new(false)),
            finished: vec![false; parallelism],
            finals: (0..parallelism).map(|_| None).collect(),
            closed: false,
            erred: false,
            joined: false,
        };
        (pool, request_rx, response_tx)
    }

    /// Start one OS thread per worker.
    pub fn threads(host: &Host, config: &PoolConfig, context: H::Context) -> Result<Self> {
        config.validate()?;
        let (mut pool, request_rx, response_tx) = Self::empty(config.parallelism);

        for index in 0..config.parallelism {
            let mut endpoint = ChannelEndpoint::<H> {
                requests: request_rx.clone(),
                responses: response_tx.clone(),
                abort: Arc::clone(&pool.abort),
            };
            let host = host.for_worker();
            let context = context.clone();
            let policy = config.teardown;

            // on error the partially built pool is dropped, which tears it down
            let handle = thread::Builder::new()
                .name(format!("partest-worker-{}", index))
                .spawn(move || {
                    run_worker::<H, _>(index, &host, context, policy, &mut endpoint);
                })
                .map_err(|source| PartestError::Spawn { worker: index, source })?;

            pool.workers.push(WorkerSlot {
                handle: Some(handle),
                child: None,
            });
        }

        info!(workers = config.parallelism, "Started worker threads");
        Ok(pool)
    }

    /// Start one subprocess per worker, running `config.worker_command`.
    pub fn processes(host: &Host, config: &PoolConfig, context: H::Context) -> Result<Self> {
        config.validate()?;

        // Everything that can be checked up front is checked before the
        // first child starts.
        let program = config.worker_command.resolve()?;
        let host = host.for_worker();
        let bootstraps = (0..config.parallelism)
            .map(|worker| {
                Bootstrap {
                    worker,
                    host: host.clone(),
                    context: context.clone(),
                    teardown: config.teardown,
                }
                .to_line()
                .map_err(|e| {
                    PartestError::Config(format!("context cannot be sent to workers: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (mut pool, request_rx, response_tx) = Self::empty(config.parallelism);

        for (index, bootstrap) in bootstraps.iter().enumerate() {
            let mut proc = spawn_worker(&config.worker_command, &program, index)?;
            let reaper = proc.reaper();
            debug!(worker = index, pid = proc.pid().as_raw(), "Spawned worker process");

            proc.send_line(bootstrap)?;

            // Detached: it ends at EOF, once the child and anything that
            // inherited its stdout are gone.
            let (reply_tx, reply_rx) = unbounded();
            let reader = proc.take_reader()?;
            spawn_reader_thread(index, move || forward_replies::<H>(reader, reply_tx))?;

            let driver = Driver::<H> {
                index,
                proc,
                requests: request_rx.clone(),
                replies: reply_rx,
                responses: response_tx.clone(),
                abort: Arc::clone(&pool.abort),
            };
            let handle = spawn_driver_thread(index, move || driver.run())?;

            pool.workers.push(WorkerSlot {
                handle: Some(handle),
                child: Some(reaper),
            });
        }

        info!(
            workers = config.parallelism,
            program = %program.display(),
            "Started worker processes"
        );
        Ok(pool)
    }

    fn record_done(&mut self, worker: usize, context: H::Final) {
        match self.finals.get_mut(worker) {
            Some(slot) => {
                *slot = Some(context);
                self.finished[worker] = true;
            }
            None => warn!(worker, "Final context from unknown worker"),
        }
    }

    fn record_error(&mut self, worker: usize, message: String) -> PartestError {
        self.erred = true;
        if let Some(finished) = self.finished.get_mut(worker) {
            *finished = true;
        }
        PartestError::worker(worker, message)
    }

    /// Stop every worker without waiting for queued work.
    fn terminate(&mut self) {
        self.abort.store(true, Ordering::Release);
        self.requests = None;

        for child in self.workers.iter().filter_map(|slot| slot.child.as_ref()) {
            child.kill(Signal::SIGKILL);
        }

        // Drivers return promptly once their child is dead. Worker threads
        // are detached: one in the middle of a job cannot be interrupted.
        for slot in self.workers.drain(..) {
            if let (Some(handle), Some(_)) = (slot.handle, slot.child) {
                let _ = handle.join();
            }
        }

        self.joined = true;
        debug!(workers = self.parallelism, "Pool terminated");
    }

    /// Wait for every worker thread (or driver thread) to finish.
    fn reap(&mut self) {
        for (index, slot) in self.workers.drain(..).enumerate() {
            if let Some(handle) = slot.handle
                && handle.join().is_err()
            {
                warn!(worker = index, "Worker thread panicked");
            }
        }
        self.joined = true;
    }
}

impl<H: Handler> Pool<H> for Dispatcher<H> {
    fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn submit(&mut self, job: H::Job) -> Result<()> {
        if self.closed {
            return Err(PartestError::Closed);
        }
        let requests = self.requests.as_ref().ok_or(PartestError::Closed)?;
        requests
            .send(Message::Request { job })
            .map_err(|_| PartestError::Disconnected)
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<H::Output>> {
        if self.joined {
            return Ok(None);
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            let message = match deadline {
                Some(deadline) => self.responses.recv_deadline(deadline).ok(),
                None => self.responses.recv().ok(),
            };
            match message {
                Some(Message::Response { result }) => return Ok(Some(result)),
                Some(Message::Done { worker, context }) => self.record_done(worker, context),
                Some(Message::Error { worker, message }) => {
                    return Err(self.record_error(worker, message));
                }
                Some(other) => warn!(kind = other.kind(), "Unexpected message from worker"),
                // timed out, or every worker is gone
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(requests) = self.requests.take() {
            for _ in 0..self.parallelism {
                // every worker already gone; join sees the disconnect
                if requests.send(Message::Close).is_err() {
                    break;
                }
            }
        }
        self.closed = true;
        debug!(workers = self.parallelism, "Pool closed");
        Ok(())
    }

    fn join(&mut self) -> Result<Vec<H::Final>> {
        if self.joined {
            return Ok(Vec::new());
        }
        if !self.closed {
            debug!("Joining a pool that was not closed; terminating workers");
            self.terminate();
            return Ok(Vec::new());
        }

        while self.finished.iter().any(|done| !done) {
            match self.responses.recv() {
                Ok(Message::Done { worker, context }) => self.record_done(worker, context),
                Ok(Message::Error { worker, message }) => {
                    let err = self.record_error(worker, message);
                    self.terminate();
                    return Err(err);
                }
                Ok(Message::Response { .. }) => debug!("Discarding result received during join"),
                Ok(other) => warn!(kind = other.kind(), "Unexpected message from worker"),
                // every worker has exited
                Err(_) => break,
            }
        }
        self.reap();

        let finals: Vec<H::Final> = self.finals.iter_mut().filter_map(Option::take).collect();
        if finals.len() < self.parallelism {
            warn!(
                expected = self.parallelism,
                received = finals.len(),
                "Some workers produced no final context"
            );
        }
        Ok(finals)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn has_erred(&self) -> bool {
        self.erred
    }
}

impl<H: Handler> Drop for Dispatcher<H> {
    fn drop(&mut self) {
        if !self.joined {
            self.terminate();
        }
    }
}
