use crate::{exceptions::ControlSignal, threading::ThreadHandle};
use std::thread::ThreadId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Host thread {native:?} is already registered as guest thread {existing}")]
    AlreadyRegistered {
        native: ThreadId,
        existing: ThreadHandle,
    },
    #[error("Guest thread {0} is not registered")]
    NotRegistered(ThreadHandle),
}

/// A thread-local operation was invoked on behalf of another thread.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Operation on guest thread {target} invoked from {current:?}; only the owning thread may do this")]
pub struct WrongThreadError {
    pub target: ThreadHandle,
    pub current: Option<ThreadHandle>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Guest thread {0} was already started")]
    AlreadyStarted(ThreadHandle),

    #[error("Failed to spawn host thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Failure of a blocking helper (`sleep`, `join`, ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockingError {
    /// The guest interrupt status was set while waiting. The status is cleared.
    #[error("Interrupted while blocked")]
    Interrupted,

    #[error(transparent)]
    Control(#[from] ControlSignal),
}
