//! partest - parallel test runner built on an isolated worker pool.
//!
//! The [`pool`] module is the engine: a bounded pool that hands opaque jobs
//! to workers, runs a per-worker setup and teardown around them, and reports
//! results and failures back over a five-message protocol. The [`runner`]
//! module uses it to run tests through an external command.

pub mod error;
pub mod host;
pub mod logging;
pub mod pool;
pub mod runner;
pub mod theme;

pub use error::{PartestError, Result};
pub use host::Host;
pub use pool::{Handler, Isolation, Pool, PoolConfig, TeardownPolicy, make_pool};
