//! Control-flow signals raised at safepoints.
//!
//! A stop or kill request is delivered by returning a [`ControlSignal`] in the
//! `Err` channel of whatever the target thread is currently doing. Callers
//! propagate it with `?` until a guest-level handler (or the launcher) takes
//! it. Only `Stop` may be handled; `Kill` unwinds the whole thread.
use serde::Serialize;
use std::{borrow::Cow, fmt};
use thiserror::Error;

/// Class name used when a stop request carries no cause.
pub const THREAD_DEATH: &str = "ThreadDeath";

/// A guest-level exception object, as far as this layer needs to know it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GuestException {
    pub class_name: Cow<'static, str>,
    pub message: Option<String>,
}

impl GuestException {
    pub fn new(class_name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            class_name: class_name.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The default cause of a stop with no explicit throwable.
    pub fn thread_death() -> Self {
        Self::new(THREAD_DEATH)
    }

    pub fn is_thread_death(&self) -> bool {
        self.class_name == THREAD_DEATH
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.class_name, msg),
            None => write!(f, "{}", self.class_name),
        }
    }
}

/// Abrupt termination delivered to a guest thread at a safepoint.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ControlSignal {
    /// Asynchronous guest exception. Recoverable by guest handlers.
    #[error("thread stopped: {0}")]
    Stop(GuestException),
    /// Host-level termination. Must reach the launcher.
    #[error("thread killed (exit status {exit_status})")]
    Kill { exit_status: i32 },
}

/// Guest-level `catch`: turns a `Stop` into an ordinary exception value and
/// re-propagates `Kill` untouched.
pub fn catch_stop<T>(
    result: Result<T, ControlSignal>,
) -> Result<Result<T, GuestException>, ControlSignal> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(ControlSignal::Stop(exception)) => Ok(Err(exception)),
        Err(kill @ ControlSignal::Kill { .. }) => Err(kill),
    }
}
