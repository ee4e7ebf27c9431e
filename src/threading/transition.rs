use crate::{
    exceptions::ControlSignal,
    metrics::ControlMetrics,
    runtime::Runtime,
    threading::{BlockKind, GuestThread, RunState},
};

/// Marks a thread as blocked for the lifetime of the guard.
///
/// [`exit`](Self::exit) polls and then restores the prior state. Dropping the
/// guard without calling it (early return, unwinding) restores the state but
/// skips the poll.
#[must_use = "dropping the guard skips the exit safepoint"]
pub struct BlockingGuard<'a> {
    runtime: &'a Runtime,
    thread: &'a GuestThread,
    prior: Option<RunState>,
}

impl BlockingGuard<'_> {
    /// Exit safepoint. The prior state is restored even if the poll raises.
    pub fn exit(mut self) -> Result<(), ControlSignal> {
        let result = self.runtime.poll(self.thread);
        self.restore();
        result
    }

    fn restore(&mut self) {
        if let Some(prior) = self.prior.take() {
            self.runtime
                .record_state_change(self.thread, self.thread.run_state(), prior);
            self.thread.set_run_state(prior);
        }
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

impl Runtime {
    /// Records the current state, switches to `Blocked(kind)` and polls.
    ///
    /// If the entry poll raises, the prior state is already restored when the
    /// signal comes back.
    pub fn enter_blocking<'a>(
        &'a self,
        thread: &'a GuestThread,
        kind: BlockKind,
    ) -> Result<BlockingGuard<'a>, ControlSignal> {
        self.assert_current(thread);
        ControlMetrics::bump(&self.metrics.blocking_transitions);

        let prior = thread.run_state();
        let blocked = RunState::Blocked(kind);
        self.record_state_change(thread, prior, blocked);
        thread.set_run_state(blocked);

        let guard = BlockingGuard {
            runtime: self,
            thread,
            prior: Some(prior),
        };
        self.poll(thread)?;
        Ok(guard)
    }

    /// Runs `f` as a blocking call.
    ///
    /// The exit safepoint always runs, and a signal it raises replaces any
    /// error `f` returned.
    pub fn run_blocking<T, E, F>(
        &self,
        thread: &GuestThread,
        kind: BlockKind,
        f: F,
    ) -> Result<T, E>
    where
        E: From<ControlSignal>,
        F: FnOnce() -> Result<T, E>,
    {
        let guard = self.enter_blocking(thread, kind)?;
        let result = f();
        guard.exit()?;
        result
    }

    pub(crate) fn record_state_change(&self, thread: &GuestThread, old: RunState, new: RunState) {
        if self.trace_enabled {
            self.trace(|t| t.trace_thread_state(thread.handle(), old.name(), new.name()));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ControlConfig,
        error::BlockingError,
        exceptions::{ControlSignal, GuestException},
        runtime::Runtime,
        threading::{BlockKind, RunState},
    };

    #[test]
    fn test_failing_call_restores_state() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("io");
        let _attached = runtime.attach_for_test(&thread);
        let before = thread.run_state();

        let result: Result<(), BlockingError> =
            runtime.run_blocking(&thread, BlockKind::Io, || {
                assert_eq!(thread.run_state(), RunState::Blocked(BlockKind::Io));
                Err(BlockingError::Interrupted)
            });
        assert_eq!(result, Err(BlockingError::Interrupted));
        assert_eq!(thread.run_state(), before);
    }

    #[test]
    fn test_entry_poll_signal_restores_state() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("entry");
        let _attached = runtime.attach_for_test(&thread);
        let before = thread.run_state();

        // Recorded without a notification, so only the next poll sees it
        thread.control().try_stop(Some(GuestException::new("Early")), || ());
        let mut ran = false;
        let result: Result<(), ControlSignal> =
            runtime.run_blocking(&thread, BlockKind::Host, || {
                ran = true;
                Ok(())
            });
        assert_eq!(result, Err(ControlSignal::Stop(GuestException::new("Early"))));
        assert!(!ran);
        assert_eq!(thread.run_state(), before);
    }

    #[test]
    fn test_exit_signal_replaces_call_error() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("exit");
        let _attached = runtime.attach_for_test(&thread);

        let result: Result<(), BlockingError> =
            runtime.run_blocking(&thread, BlockKind::Waiting, || {
                thread.control().kill(|| ());
                Err(BlockingError::Interrupted)
            });
        assert_eq!(
            result,
            Err(BlockingError::Control(ControlSignal::Kill { exit_status: 0 }))
        );
        assert_eq!(thread.run_state(), RunState::Runnable);
    }

    #[test]
    fn test_dropped_guard_restores_without_polling() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("drop");
        let _attached = runtime.attach_for_test(&thread);

        {
            let _guard = runtime.enter_blocking(&thread, BlockKind::Parked).unwrap();
            assert!(thread.run_state().is_blocked());
            thread.control().kill(|| ());
        }
        assert_eq!(thread.run_state(), RunState::Runnable);
        assert!(runtime.poll(&thread).is_err());
    }
}
