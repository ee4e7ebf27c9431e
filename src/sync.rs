//! Basic synchronization primitives.
//!
//! Everything in the crate takes its locks and atomics from here so the
//! primitive set stays in one place. Locks are `parking_lot` (no poisoning,
//! `wait_for` on condvars); atomics and `Arc` come from `std`.
use crate::threading::ThreadHandle;
use std::cell::Cell;

pub use parking_lot::{Condvar, Mutex, RwLock};
pub use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering},
    Arc, OnceLock,
};

thread_local! {
    /// Cached guest thread handle for the current host thread
    static CURRENT_GUEST_THREAD: Cell<Option<ThreadHandle>> = const { Cell::new(None) };
}

/// Get the guest thread handle attached to the current host thread, if any.
pub fn current_guest_handle() -> Option<ThreadHandle> {
    CURRENT_GUEST_THREAD.with(|h| h.get())
}

pub(crate) fn set_current_guest_handle(handle: Option<ThreadHandle>) {
    CURRENT_GUEST_THREAD.with(|h| h.set(handle));
}
