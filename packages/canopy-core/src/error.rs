use crate::node::ViewId;
use std::time::Duration;
use thiserror::Error;

/// A renderer command the bridge refused. Aborts the remaining effects of
/// the current drain; the committed tree is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("renderer rejected `{command}` for view {view:?}: {reason}")]
pub struct BridgeError {
    pub command: &'static str,
    pub view: Option<ViewId>,
    pub reason: String,
}

impl BridgeError {
    pub fn new(command: &'static str, view: Option<ViewId>, reason: impl Into<String>) -> Self {
        Self {
            command,
            view,
            reason: reason.into(),
        }
    }
}

/// Engine bugs. Fatal in development builds, dropped with a warning in
/// release builds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("view {0:?} referenced but not mounted")]
    UnknownView(ViewId),
    #[error("view {0:?} mounted twice")]
    DoubleMount(ViewId),
    #[error("parent link does not point back (view {0:?})")]
    BrokenParentLink(Option<ViewId>),
}

/// Recoverable author mistakes. Logged and worked around locally; these
/// never abort a drain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorError {
    #[error("duplicate key `{key}` among children of view {parent:?}; falling back to positional matching")]
    DuplicateKey { parent: ViewId, key: String },
    #[error("component render recursed past depth {0}; treating output as empty")]
    RenderRecursion(usize),
}

/// Worker-path failures. Always recovered by the serial fallback on the
/// same input pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("diff worker timed out after {0:?}")]
    Timeout(Duration),
    #[error("diff worker disconnected")]
    Disconnected,
    #[error("worker pool is shut down")]
    PoolShutDown,
    #[error("snapshot codec failed: {0}")]
    Codec(String),
}

/// Errors that abort the current drain. The engine itself survives; the
/// next drain reruns reconciliation from the last committed tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}
