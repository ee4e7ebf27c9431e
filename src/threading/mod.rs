//! Guest thread bookkeeping and cooperative control.
//!
//! # Architecture
//!
//! Every guest thread owns a control block ([`GuestThread`]). Other threads
//! never act on a target directly; they record a request in the target's
//! control block and, when the target may be blocked, wake it. The target
//! reacts only at safepoints:
//!
//! - around blocking calls ([`BlockingGuard`], entered with
//!   [`Runtime::enter_blocking`](crate::Runtime::enter_blocking)), which poll
//!   both on entry and on exit,
//! - at executor back-edges and calls, via
//!   [`Runtime::poll`](crate::Runtime::poll).
//!
//! ## Control state
//!
//! Stop and kill requests share a per-thread state machine ([`ControlState`])
//! guarded by a per-thread lock. A stop is one-shot: the target consumes it
//! and returns to `Normal`. A kill is never cancelled or downgraded.
//!
//! ## Suspension
//!
//! Suspend and resume use a separate lock and condition variable
//! ([`SuspendLock`]) that is created the first time a thread is suspended.
//!
//! ## Delivery
//!
//! Requests for a running thread on another host thread are queued as
//! [`PendingAction`]s in the target's inbox and drained by its next poll. A
//! best-effort wake makes interruptible waits re-check their wake condition.
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

mod blocking;
mod control;
mod notifier;
mod registry;
mod safepoint;
mod suspend;
mod termination;
mod thread;
mod transition;

pub use control::{ControlState, ControlSupport};
pub use notifier::{
    ActionAccess, AsyncNotifier, CallbackAction, PendingAction, StopAction, SuspendAction,
    ThreadLocalAction,
};
pub use registry::ThreadRegistry;
pub use suspend::SuspendLock;
pub use thread::{GuestThread, WakeReason};
pub use transition::BlockingGuard;

/// Opaque identifier of a guest thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadHandle(pub u64);

impl Display for ThreadHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ThreadHandle {
    fn from(id: u64) -> Self {
        ThreadHandle(id)
    }
}

impl ThreadHandle {
    pub fn new(id: u64) -> Self {
        ThreadHandle(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Why a thread is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BlockKind {
    Sleeping,
    Joining,
    Waiting,
    Parked,
    Io,
    /// Parked in self-suspension
    Suspended,
    /// Any other host call
    Host,
}

impl BlockKind {
    const ALL: [BlockKind; 7] = [
        BlockKind::Sleeping,
        BlockKind::Joining,
        BlockKind::Waiting,
        BlockKind::Parked,
        BlockKind::Io,
        BlockKind::Suspended,
        BlockKind::Host,
    ];
}

/// Execution state of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    /// Created, not started
    New,
    /// Executing guest code
    Runnable,
    /// Inside a blocking call
    Blocked(BlockKind),
    /// Exited
    Terminated,
}

const BLOCKED_BASE: u8 = 0x10;

impl RunState {
    pub(crate) fn encode(self) -> u8 {
        match self {
            RunState::New => 0,
            RunState::Runnable => 1,
            RunState::Terminated => 2,
            RunState::Blocked(kind) => BLOCKED_BASE + kind as u8,
        }
    }

    pub(crate) fn decode(raw: u8) -> Self {
        match raw {
            0 => RunState::New,
            1 => RunState::Runnable,
            2 => RunState::Terminated,
            b if b >= BLOCKED_BASE && usize::from(b - BLOCKED_BASE) < BlockKind::ALL.len() => {
                RunState::Blocked(BlockKind::ALL[usize::from(b - BLOCKED_BASE)])
            }
            other => unreachable!("corrupt run state byte {:#x}", other),
        }
    }

    /// Started and not yet terminated.
    pub fn is_alive(self) -> bool {
        !matches!(self, RunState::New | RunState::Terminated)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, RunState::Blocked(_))
    }

    pub fn name(self) -> &'static str {
        match self {
            RunState::New => "NEW",
            RunState::Runnable => "RUNNABLE",
            RunState::Terminated => "TERMINATED",
            RunState::Blocked(BlockKind::Sleeping) => "BLOCKED(sleeping)",
            RunState::Blocked(BlockKind::Joining) => "BLOCKED(joining)",
            RunState::Blocked(BlockKind::Waiting) => "BLOCKED(waiting)",
            RunState::Blocked(BlockKind::Parked) => "BLOCKED(parked)",
            RunState::Blocked(BlockKind::Io) => "BLOCKED(io)",
            RunState::Blocked(BlockKind::Suspended) => "BLOCKED(suspended)",
            RunState::Blocked(BlockKind::Host) => "BLOCKED(host)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "corrupt run state")]
    fn test_corrupt_state_byte_is_fatal() {
        let _ = RunState::decode(0x7f);
    }

    #[test]
    fn test_liveness() {
        assert!(!RunState::New.is_alive());
        assert!(RunState::Runnable.is_alive());
        assert!(RunState::Blocked(BlockKind::Io).is_alive());
        assert!(!RunState::Terminated.is_alive());
    }
}
