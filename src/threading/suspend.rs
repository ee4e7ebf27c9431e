use crate::{
    exceptions::ControlSignal,
    metrics::ControlMetrics,
    runtime::Runtime,
    sync::{Condvar, Mutex},
    threading::{
        control::ControlState, notifier::Delivery, BlockKind, GuestThread, RunState,
        SuspendAction,
    },
};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct SuspendState {
    requested: bool,
    /// Bumped by every suspend request
    epoch: u64,
    /// Last epoch the target acknowledged by parking
    observed: u64,
}

/// Suspension flag and condvar of one thread, separate from its control lock.
#[derive(Debug, Default)]
pub struct SuspendLock {
    state: Mutex<SuspendState>,
    cond: Condvar,
}

impl SuspendLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.state.lock().requested
    }

    /// Sets the flag; returns the epoch the caller waits for.
    pub(crate) fn request(&self) -> u64 {
        let mut state = self.state.lock();
        state.requested = true;
        state.epoch += 1;
        state.epoch
    }

    pub(crate) fn is_observed(&self, epoch: u64) -> bool {
        self.state.lock().observed >= epoch
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.requested = false;
        self.cond.notify_all();
    }

    /// Makes every waiter re-check its exit condition.
    pub(crate) fn wake(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Parks the calling (target) thread while the flag is set.
    ///
    /// `on_park` runs under the lock before the request is acknowledged.
    /// `killed` is re-checked after every wake; a kill ends the suspension.
    /// Returns whether the thread parked at all.
    pub(crate) fn self_suspend(&self, killed: impl Fn() -> bool, on_park: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        if !state.requested || killed() {
            return false;
        }
        on_park();
        state.observed = state.epoch;
        self.cond.notify_all();
        while state.requested && !killed() {
            self.cond.wait(&mut state);
        }
        true
    }

    /// Waits until the target acknowledged `epoch`, or until the request is
    /// withdrawn, or until `settled` reports the target needs no ack.
    ///
    /// Returns true only for an acknowledgement.
    pub(crate) fn wait_observed(
        &self,
        epoch: u64,
        slice: Duration,
        warn_after: Duration,
        settled: impl Fn() -> bool,
    ) -> bool {
        let started = Instant::now();
        let mut warned = false;
        let mut state = self.state.lock();
        loop {
            if state.observed >= epoch {
                return true;
            }
            if !state.requested || settled() {
                return false;
            }
            self.cond.wait_for(&mut state, slice);
            if !warned && started.elapsed() > warn_after {
                warn!(
                    "suspend not acknowledged after {:?} (epoch {})",
                    started.elapsed(),
                    epoch
                );
                warned = true;
            }
        }
    }
}

impl Runtime {
    /// Suspends `target` at its next safepoint.
    ///
    /// Returns once the target has parked, is already blocked, or has died.
    /// Suspending the calling thread parks it right here; the `Err` is a kill
    /// that ended the suspension.
    pub fn suspend(&self, target: &GuestThread) -> Result<(), ControlSignal> {
        if !target.is_alive() {
            return Ok(());
        }
        ControlMetrics::bump(&self.metrics.suspend_requests);
        let lock = target.control().suspend_lock_or_init();
        let epoch = lock.request();

        match self.notifier.route(target) {
            Delivery::Inline => {
                self.trace(|t| t.trace_control_request(target.handle(), "suspend", "inline"));
                if self.handle_suspend(target) {
                    self.handle_stop(target)?;
                }
            }
            // Alive but not attached: terminating, nothing left to park
            Delivery::Deferred => {}
            Delivery::Remote => {
                self.trace(|t| t.trace_control_request(target.handle(), "suspend", "remote"));
                self.notifier.notify(target, SuspendAction);
                match self.current_thread().filter(|caller| caller.is_current()) {
                    Some(caller) => self.await_suspend_as_guest(&caller, target, lock, epoch)?,
                    None => {
                        self.await_suspend(target, lock, epoch, || false);
                    }
                }
            }
        }
        Ok(())
    }

    /// Waits until `target` acknowledges `epoch`, is blocked or dead, the
    /// request is withdrawn, or `interrupted` reports the caller has work.
    fn await_suspend(
        &self,
        target: &GuestThread,
        lock: &SuspendLock,
        epoch: u64,
        interrupted: impl Fn() -> bool,
    ) -> bool {
        let acked = lock.wait_observed(
            epoch,
            self.config.wake_slice,
            self.config.suspend_ack_warn,
            || interrupted() || !target.is_alive() || target.run_state().is_blocked(),
        );
        debug!(
            "suspend wait on thread {} ended (acknowledged: {})",
            target.handle(),
            acked
        );
        acked
    }

    /// The wait of a guest caller. It waits as `Blocked(Waiting)` so others
    /// do not wait on it in turn, and breaks out to its exit poll whenever a
    /// request of its own arrives.
    fn await_suspend_as_guest(
        &self,
        caller: &GuestThread,
        target: &GuestThread,
        lock: &SuspendLock,
        epoch: u64,
    ) -> Result<(), ControlSignal> {
        loop {
            let guard = self.enter_blocking(caller, BlockKind::Waiting)?;
            let acked = self.await_suspend(target, lock, epoch, || has_own_request(caller));
            guard.exit()?;
            let settled = !lock.is_requested()
                || !target.is_alive()
                || target.run_state().is_blocked();
            if acked || settled || lock.is_observed(epoch) {
                return Ok(());
            }
        }
    }

    /// Releases a suspended thread. No-op for a thread never suspended.
    pub fn resume(&self, target: &GuestThread) {
        let Some(lock) = target.control_if_present().and_then(|c| c.suspend_lock()) else {
            return;
        };
        ControlMetrics::bump(&self.metrics.resume_requests);
        lock.release();
        self.trace(|t| t.trace_control_request(target.handle(), "resume", "released"));
    }

    /// Parks the calling thread while it is suspended. Returns whether it
    /// parked; the caller then re-checks for a kill.
    pub(crate) fn handle_suspend(&self, thread: &GuestThread) -> bool {
        let Some(control) = thread.control_if_present() else {
            return false;
        };
        let Some(lock) = control.suspend_lock() else {
            return false;
        };
        let prior = thread.run_state();
        let started = Instant::now();
        let parked = lock.self_suspend(
            || control.state() == ControlState::Kill,
            || thread.set_run_state(RunState::Blocked(BlockKind::Suspended)),
        );
        if parked {
            thread.set_run_state(prior);
            let elapsed = started.elapsed();
            self.metrics.record_suspension(elapsed);
            self.trace(|t| {
                t.trace_thread_suspend(thread.handle());
                t.trace_thread_resume(thread.handle(), elapsed.as_micros() as u64);
            });
        }
        parked
    }
}

/// Work the calling guest thread must serve at its next poll. A nested poll
/// never drains the inbox, so queued actions do not count there.
fn has_own_request(caller: &GuestThread) -> bool {
    let control = caller
        .control_if_present()
        .is_some_and(|c| matches!(c.state(), ControlState::Stop | ControlState::Kill));
    control || (!caller.is_in_poll() && caller.has_pending_actions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_self_suspend_without_request_returns_immediately() {
        let lock = SuspendLock::new();
        assert!(!lock.self_suspend(|| false, || panic!("must not park")));
    }

    #[test]
    fn test_release_unparks() {
        let lock = Arc::new(SuspendLock::new());
        let epoch = lock.request();

        let l2 = lock.clone();
        let parked = thread::spawn(move || l2.self_suspend(|| false, || {}));

        assert!(lock.wait_observed(
            epoch,
            Duration::from_millis(5),
            Duration::from_secs(10),
            || false
        ));
        lock.release();
        assert!(parked.join().unwrap());
        assert!(!lock.is_requested());
    }

    #[test]
    fn test_wait_observed_gives_up_when_withdrawn() {
        let lock = SuspendLock::new();
        let epoch = lock.request();
        lock.release();
        assert!(!lock.wait_observed(
            epoch,
            Duration::from_millis(5),
            Duration::from_secs(10),
            || false
        ));
    }
}
