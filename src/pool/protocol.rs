//! Message protocol between the dispatcher and its workers.
//!
//! Requests and Close flow dispatcher → worker; Response, Done and Error flow
//! worker → dispatcher. Over process boundaries every message is one JSON
//! object per line.

use super::TeardownPolicy;
use crate::error::Result;
use crate::host::Host;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The five-variant message vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message<J, R, F> {
    /// One job for a worker.
    Request { job: J },
    /// The result of exactly one Request.
    Response { result: R },
    /// Finish the job loop and run teardown.
    Close,
    /// Teardown succeeded; carries the worker's final context.
    Done { worker: usize, context: F },
    /// The worker failed and stopped processing.
    Error { worker: usize, message: String },
}

impl<J, R, F> Message<J, R, F> {
    /// Done and Error end a worker's life; a worker emits at most one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Close => "close",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

impl<J, R, F> Message<J, R, F>
where
    J: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned,
    F: Serialize + DeserializeOwned,
{
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        to_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// First line written to a worker subprocess, before any message.
///
/// Carries everything the worker would otherwise have inherited from its
/// parent: its index, the host handle and its private copy of the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap<C> {
    pub worker: usize,
    pub host: Host,
    pub context: C,
    #[serde(default)]
    pub teardown: TeardownPolicy,
}

impl<C: Serialize + DeserializeOwned> Bootstrap<C> {
    pub fn to_line(&self) -> Result<String> {
        to_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn to_line<T: Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    Ok(json)
}
