//! Pool variant that runs everything synchronously in the caller.

use super::worker::guard;
use super::{Handler, Pool, PoolConfig, TeardownPolicy};
use crate::error::{PartestError, Result};
use crate::host::Host;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Index reported for the single inline worker.
const INLINE_WORKER: usize = 0;

/// Single-worker pool without isolation.
///
/// Setup runs in the constructor and each job runs inside [`Pool::receive`],
/// so nothing ever waits. Used for a parallelism of one, where spawning a
/// worker would only add overhead.
pub struct InlinePool<H: Handler> {
    /// `None` after teardown or a fatal error.
    state: Option<H::State>,
    queue: VecDeque<H::Job>,
    teardown: TeardownPolicy,
    /// Setup failure not yet reported to the caller.
    pending_error: Option<String>,
    final_context: Option<H::Final>,
    closed: bool,
    erred: bool,
    joined: bool,
}

impl<H: Handler> InlinePool<H> {
    pub fn new(host: &Host, config: &PoolConfig, context: H::Context) -> Self {
        let (state, pending_error) = match guard(|| H::setup(host, INLINE_WORKER, context)) {
            Ok(state) => (Some(state), None),
            Err(message) => {
                warn!(%message, "Inline setup failed");
                (None, Some(format!("setup failed: {}", message)))
            }
        };

        Self {
            state,
            queue: VecDeque::new(),
            teardown: config.teardown,
            pending_error,
            final_context: None,
            closed: false,
            erred: false,
            joined: false,
        }
    }

    fn fail(&mut self, message: String) -> PartestError {
        self.erred = true;
        self.state = None;
        self.queue.clear();
        PartestError::worker(INLINE_WORKER, message)
    }
}

impl<H: Handler> Pool<H> for InlinePool<H> {
    fn parallelism(&self) -> usize {
        1
    }

    fn submit(&mut self, job: H::Job) -> Result<()> {
        if self.closed {
            return Err(PartestError::Closed);
        }
        self.queue.push_back(job);
        Ok(())
    }

    fn receive(&mut self, _timeout: Option<Duration>) -> Result<Option<H::Output>> {
        if let Some(message) = self.pending_error.take() {
            return Err(self.fail(message));
        }
        let Some(state) = self.state.as_ref() else {
            return Ok(None);
        };
        let Some(job) = self.queue.pop_front() else {
            return Ok(None);
        };

        match guard(|| H::call(state, job)) {
            Ok(result) => Ok(Some(result)),
            Err(message) => Err(self.fail(message)),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(state) = self.state.take() else {
            return Ok(());
        };
        if !self.queue.is_empty() {
            debug!(pending = self.queue.len(), "Discarding jobs never received");
            self.queue.clear();
        }

        match guard(|| H::teardown(state)) {
            Ok(context) => {
                self.final_context = Some(context);
                Ok(())
            }
            Err(message) => match self.teardown {
                TeardownPolicy::Ignore => {
                    warn!(%message, "Teardown failed; no final context");
                    Ok(())
                }
                TeardownPolicy::Report => {
                    Err(self.fail(format!("teardown failed: {}", message)))
                }
            },
        }
    }

    fn join(&mut self) -> Result<Vec<H::Final>> {
        if self.joined {
            return Ok(Vec::new());
        }
        if let Some(message) = self.pending_error.take() {
            self.joined = true;
            return Err(self.fail(message));
        }
        self.close()?;
        self.joined = true;
        Ok(self.final_context.take().into_iter().collect())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn has_erred(&self) -> bool {
        self.erred
    }
}
