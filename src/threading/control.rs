use crate::{
    exceptions::{ControlSignal, GuestException},
    metrics::ControlMetrics,
    runtime::Runtime,
    sync::{AtomicU8, Mutex, OnceLock, Ordering},
    threading::{notifier::Delivery, GuestThread, StopAction, SuspendLock},
};
use serde::Serialize;
use tracing::debug;

/// Pending asynchronous request on a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ControlState {
    Normal = 0,
    Stop = 1,
    Kill = 2,
    /// The thread is unwinding on its own; stops are ignored.
    Exiting = 3,
}

impl ControlState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ControlState::Normal,
            1 => ControlState::Stop,
            2 => ControlState::Kill,
            3 => ControlState::Exiting,
            other => unreachable!("corrupt control state {}", other),
        }
    }

    pub fn can_stop(self) -> bool {
        self == ControlState::Normal
    }
}

/// What a locked re-check of the control state found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Observed {
    Nothing,
    Stop(GuestException),
    Kill,
}

#[derive(Debug, Default)]
struct ControlInner {
    cause: Option<GuestException>,
}

/// Per-thread stop/kill state and the lazily created suspend lock.
///
/// `status` is only written while `inner` is held. The cause is written
/// before the status store (`Release`) so a reader that peeks `Stop`
/// (`Acquire`) and then takes the lock always finds it.
#[derive(Debug)]
pub struct ControlSupport {
    status: AtomicU8,
    inner: Mutex<ControlInner>,
    suspend: OnceLock<SuspendLock>,
}

impl Default for ControlSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSupport {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(ControlState::Normal as u8),
            inner: Mutex::new(ControlInner::default()),
            suspend: OnceLock::new(),
        }
    }

    /// Lock-free peek at the current state.
    pub fn state(&self) -> ControlState {
        ControlState::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ControlState) {
        self.status.store(state as u8, Ordering::Release);
    }

    /// Records a stop if the state accepts one. `route` runs under the lock
    /// and its result is handed back so the caller can act after unlocking.
    pub(crate) fn try_stop<D>(
        &self,
        cause: Option<GuestException>,
        route: impl FnOnce() -> D,
    ) -> Option<D> {
        let mut inner = self.inner.lock();
        if !self.state().can_stop() {
            return None;
        }
        inner.cause = cause;
        self.set_state(ControlState::Stop);
        Some(route())
    }

    pub(crate) fn kill<D>(&self, route: impl FnOnce() -> D) -> D {
        let mut inner = self.inner.lock();
        inner.cause = None;
        self.set_state(ControlState::Kill);
        route()
    }

    /// Marks the thread as unwinding. A kill stays a kill.
    pub(crate) fn exit(&self) {
        let mut inner = self.inner.lock();
        if self.state() != ControlState::Kill {
            inner.cause = None;
            self.set_state(ControlState::Exiting);
        }
    }

    /// Consumes a pending stop, re-checking under the lock.
    pub(crate) fn take_stop(&self) -> Observed {
        let mut inner = self.inner.lock();
        match self.state() {
            ControlState::Stop => {
                self.set_state(ControlState::Normal);
                Observed::Stop(inner.cause.take().unwrap_or_else(GuestException::thread_death))
            }
            ControlState::Kill => Observed::Kill,
            ControlState::Normal | ControlState::Exiting => Observed::Nothing,
        }
    }

    /// Whether any request was recorded, read under the lock.
    pub(crate) fn has_request(&self) -> bool {
        let _inner = self.inner.lock();
        self.state() != ControlState::Normal
    }

    pub fn suspend_lock(&self) -> Option<&SuspendLock> {
        self.suspend.get()
    }

    /// The suspend lock, created at most once.
    pub(crate) fn suspend_lock_or_init(&self) -> &SuspendLock {
        self.suspend.get_or_init(SuspendLock::new)
    }

    pub fn has_suspend_lock(&self) -> bool {
        self.suspend.get().is_some()
    }
}

impl Runtime {
    /// Requests that `target` abort with `cause` (default `ThreadDeath`) at
    /// its next safepoint.
    ///
    /// Returns `Ok(false)` if the target already carries a request. When the
    /// target is the calling thread the stop is raised right away and comes
    /// back as `Err`.
    pub fn stop(
        &self,
        target: &GuestThread,
        cause: Option<GuestException>,
    ) -> Result<bool, ControlSignal> {
        ControlMetrics::bump(&self.metrics.stop_requests);
        let control = target.control();
        let Some(delivery) = control.try_stop(cause, || self.notifier.route(target)) else {
            ControlMetrics::bump(&self.metrics.stop_rejections);
            debug!(
                "stop of thread {} rejected in state {:?}",
                target.handle(),
                control.state()
            );
            self.trace(|t| t.trace_control_request(target.handle(), "stop", "rejected"));
            return Ok(false);
        };
        self.trace(|t| t.trace_control_request(target.handle(), "stop", delivery.name()));
        self.deliver(target, delivery)?;
        Ok(true)
    }

    /// Requests that `target` terminate unconditionally. Never cancelled.
    pub fn kill(&self, target: &GuestThread) -> Result<(), ControlSignal> {
        ControlMetrics::bump(&self.metrics.kill_requests);
        let control = target.control();
        let delivery = control.kill(|| self.notifier.route(target));
        self.trace(|t| t.trace_control_request(target.handle(), "kill", delivery.name()));
        // A self-suspended target only watches its suspend condvar
        if let Some(lock) = control.suspend_lock() {
            lock.wake();
        }
        self.deliver(target, delivery)
    }

    fn deliver(&self, target: &GuestThread, delivery: Delivery) -> Result<(), ControlSignal> {
        match delivery {
            // Caught by the stillborn check or the launcher's first poll
            Delivery::Deferred => Ok(()),
            Delivery::Inline => self.handle_stop(target),
            Delivery::Remote => {
                self.notifier.notify(target, StopAction);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_stop_keeps_first_cause() {
        let control = ControlSupport::new();
        assert!(control
            .try_stop(Some(GuestException::new("A")), || ())
            .is_some());
        assert!(control
            .try_stop(Some(GuestException::new("B")), || ())
            .is_none());
        assert_eq!(control.take_stop(), Observed::Stop(GuestException::new("A")));
        assert_eq!(control.state(), ControlState::Normal);
        // One-shot
        assert_eq!(control.take_stop(), Observed::Nothing);
    }

    #[test]
    fn test_kill_dominates_stop() {
        let control = ControlSupport::new();
        control.try_stop(Some(GuestException::new("A")), || ());
        control.kill(|| ());
        assert_eq!(control.take_stop(), Observed::Kill);
        assert_eq!(control.state(), ControlState::Kill);
    }

    #[test]
    fn test_exit_never_downgrades_kill() {
        let control = ControlSupport::new();
        control.exit();
        assert_eq!(control.state(), ControlState::Exiting);
        assert!(control.try_stop(None, || ()).is_none());

        let killed = ControlSupport::new();
        killed.kill(|| ());
        killed.exit();
        assert_eq!(killed.state(), ControlState::Kill);
    }

    #[test]
    fn test_default_cause_is_thread_death() {
        let control = ControlSupport::new();
        control.try_stop(None, || ());
        match control.take_stop() {
            Observed::Stop(cause) => assert!(cause.is_thread_death()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    #[should_panic(expected = "corrupt control state")]
    fn test_unknown_state_is_fatal() {
        let _ = ControlState::from_u8(9);
    }
}
