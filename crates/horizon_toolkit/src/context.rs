//! The two execution contexts work can be pinned to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a piece of work runs.
///
/// `Sync` is the host's single main thread, drained once per tick in FIFO
/// order. It is the only place shared world state may be touched.
/// `Async` is the worker pool, unordered and free to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Sync,
    Async,
}

impl ExecutionContext {
    pub fn is_sync(self) -> bool {
        matches!(self, ExecutionContext::Sync)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionContext::Sync => "sync",
            ExecutionContext::Async => "async",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
