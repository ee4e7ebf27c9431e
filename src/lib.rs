//! # threadctl
//!
//! Cooperative control of guest threads: stop, kill, suspend and resume,
//! delivered at safepoints instead of by preemption.
//!
//! A [`Runtime`] owns the guest threads. Control-plane code calls
//! [`Runtime::stop`], [`Runtime::kill`], [`Runtime::suspend`] and
//! [`Runtime::resume`] from any host thread; guest code reacts only when it
//! reaches a safepoint ([`ThreadContext::poll`], blocking helpers, or an
//! [`Executor`] back-edge). Stops and kills come back as a [`ControlSignal`]
//! in the `Err` channel.
//!
//! ## Environment Variables
//!
//! See [`config`] for control settings and [`tracer`] for the event tracer.
pub mod cli;
pub mod config;
pub mod error;
pub mod exceptions;
pub mod executor;
pub mod metrics;
pub mod runtime;
pub mod sync;
pub mod threading;
pub mod tracer;

pub use config::ControlConfig;
pub use error::{BlockingError, RegistryError, RuntimeError, WrongThreadError};
pub use exceptions::{catch_stop, ControlSignal, GuestException};
pub use executor::{Executor, StepResult};
pub use metrics::{ControlMetrics, MetricsSnapshot};
pub use runtime::{Runtime, ThreadContext, ThreadOutcome};
pub use threading::{BlockKind, ControlState, GuestThread, RunState, ThreadHandle};
