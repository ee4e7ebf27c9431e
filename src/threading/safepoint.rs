use crate::{
    error::WrongThreadError,
    exceptions::ControlSignal,
    metrics::ControlMetrics,
    runtime::Runtime,
    sync::{current_guest_handle, Ordering},
    threading::{
        control::{ControlState, Observed},
        ActionAccess, GuestThread, ThreadLocalAction,
    },
};
use tracing::{debug, trace};

/// Clears the in-poll marker however the poll ends.
struct PollScope<'a>(&'a GuestThread);

impl Drop for PollScope<'_> {
    fn drop(&mut self) {
        self.0.leave_poll();
    }
}

impl Runtime {
    /// Is `thread` running on the calling host thread?
    pub fn check_current(&self, thread: &GuestThread) -> Result<(), WrongThreadError> {
        if thread.is_current() {
            Ok(())
        } else {
            Err(WrongThreadError {
                target: thread.handle(),
                current: current_guest_handle(),
            })
        }
    }

    pub(crate) fn assert_current(&self, thread: &GuestThread) {
        if let Err(e) = self.check_current(thread) {
            panic!("{}", e);
        }
    }

    /// Safepoint: reacts to every request pending on `thread`.
    ///
    /// Drains queued actions, then delivers a stop or kill, then parks if a
    /// suspend is pending. A kill that arrives while parked is delivered
    /// before returning.
    ///
    /// # Panics
    ///
    /// If `thread` is not the calling thread.
    pub fn poll(&self, thread: &GuestThread) -> Result<(), ControlSignal> {
        self.assert_current(thread);
        ControlMetrics::bump(&self.metrics.safepoint_polls);

        if !thread.enter_poll() {
            // Re-entered from a pending action; only stop/kill apply
            return self.handle_stop(thread);
        }
        let _scope = PollScope(thread);

        if self.trace_enabled {
            self.trace(|t| t.trace_thread_safepoint(thread.handle(), "poll"));
        }

        self.drain_actions(thread)?;
        self.handle_stop(thread)?;
        if self.handle_suspend(thread) {
            self.handle_stop(thread)?;
        }
        Ok(())
    }

    fn drain_actions(&self, thread: &GuestThread) -> Result<(), ControlSignal> {
        if !thread.has_pending_actions() {
            return Ok(());
        }
        let access = ActionAccess {
            runtime: self,
            thread,
        };
        while let Some(mut action) = thread.pop_action() {
            trace!("thread {} performing {} action", thread.handle(), action.name());
            ControlMetrics::bump(&self.metrics.actions_performed);
            // Whatever is still queued stays for the next poll
            action.perform(&access)?;
        }
        Ok(())
    }

    /// Delivers a pending stop or kill as a control signal.
    pub(crate) fn handle_stop(&self, thread: &GuestThread) -> Result<(), ControlSignal> {
        let Some(control) = thread.control_if_present() else {
            return Ok(());
        };
        match control.state() {
            ControlState::Normal | ControlState::Exiting => Ok(()),
            ControlState::Kill => Err(self.kill_signal(thread)),
            ControlState::Stop => match control.take_stop() {
                Observed::Stop(cause) => {
                    ControlMetrics::bump(&self.metrics.stops_delivered);
                    debug!("delivering stop ({}) to thread {}", cause, thread.handle());
                    self.trace(|t| t.trace_control_delivered(thread.handle(), "stop"));
                    Err(ControlSignal::Stop(cause))
                }
                // Upgraded to a kill since the peek
                Observed::Kill => Err(self.kill_signal(thread)),
                // Consumed by a nested poll in between
                Observed::Nothing => Ok(()),
            },
        }
    }

    fn kill_signal(&self, thread: &GuestThread) -> ControlSignal {
        ControlMetrics::bump(&self.metrics.kills_delivered);
        let exit_status = self.exit_status.load(Ordering::Acquire);
        debug!("delivering kill to thread {}", thread.handle());
        self.trace(|t| t.trace_control_delivered(thread.handle(), "kill"));
        ControlSignal::Kill { exit_status }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ControlConfig,
        exceptions::{ControlSignal, GuestException},
        runtime::Runtime,
        threading::CallbackAction,
    };

    #[test]
    fn test_poll_delivers_stop_once() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("poller");
        let _attached = runtime.attach_for_test(&thread);

        runtime.poll(&thread).unwrap();
        let err = runtime
            .stop(&thread, Some(GuestException::new("Boom")))
            .unwrap_err();
        assert_eq!(err, ControlSignal::Stop(GuestException::new("Boom")));
        runtime.poll(&thread).unwrap();
    }

    #[test]
    fn test_nested_poll_only_handles_stop() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("nested");
        let _attached = runtime.attach_for_test(&thread);

        runtime.notifier.submit(
            &thread,
            CallbackAction::new("nested-poll", |access| {
                access.runtime.poll(access.thread)
            }),
        );
        runtime.poll(&thread).unwrap();
        assert!(!thread.has_pending_actions());
    }

    #[test]
    fn test_failed_action_leaves_rest_queued() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("failing");
        let _attached = runtime.attach_for_test(&thread);

        runtime.notifier.submit(
            &thread,
            CallbackAction::new("throw", |_| {
                Err(ControlSignal::Stop(GuestException::new("FromAction")))
            }),
        );
        runtime
            .notifier
            .submit(&thread, CallbackAction::new("later", |_| Ok(())));

        let err = runtime.poll(&thread).unwrap_err();
        assert_eq!(err, ControlSignal::Stop(GuestException::new("FromAction")));
        assert!(thread.has_pending_actions());
        runtime.poll(&thread).unwrap();
        assert!(!thread.has_pending_actions());
    }

    #[test]
    #[should_panic(expected = "only the owning thread")]
    fn test_poll_from_wrong_thread_panics() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("elsewhere");
        let _ = runtime.poll(&thread);
    }
}
