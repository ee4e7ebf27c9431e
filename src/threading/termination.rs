use crate::{
    exceptions::ControlSignal,
    metrics::ControlMetrics,
    runtime::{Runtime, ThreadContext},
    sync::{current_guest_handle, set_current_guest_handle, Arc},
    threading::GuestThread,
};
use tracing::debug;

impl Runtime {
    /// Shutdown sequence of a guest thread, run on its own host thread.
    ///
    /// Late stops are ignored from here on. The exit hook runs, then the
    /// thread is marked terminated (waking joiners) and leaves the registry.
    /// A stop raised by the hook is dropped; a kill is returned once every
    /// step has run.
    pub fn terminate(self: &Arc<Self>, thread: &Arc<GuestThread>) -> Result<(), ControlSignal> {
        thread.control().exit();

        let hook = self.exit_hook.read().clone();
        let pending_kill = match hook {
            Some(hook) => {
                let ctx = ThreadContext::new(self.clone(), thread.clone());
                match hook(&ctx) {
                    Ok(()) => None,
                    Err(ControlSignal::Stop(cause)) => {
                        debug!(
                            "thread {} exit hook raised {}; ignored",
                            thread.handle(),
                            cause
                        );
                        None
                    }
                    Err(kill) => Some(kill),
                }
            }
            None => None,
        };

        thread.mark_terminated();
        thread.detach();
        self.registry.unregister(thread.handle());
        self.threads.remove(&thread.handle());
        if current_guest_handle() == Some(thread.handle()) {
            set_current_guest_handle(None);
        }

        let dropped = thread.discard_actions();
        if dropped > 0 {
            debug!(
                "thread {} exited with {} actions pending",
                thread.handle(),
                dropped
            );
        }
        // A suspender still waiting for an acknowledgement
        if let Some(lock) = thread.control().suspend_lock() {
            lock.wake();
        }

        ControlMetrics::bump(&self.metrics.threads_terminated);
        self.trace(|t| t.trace_thread_exit(thread.handle()));

        match pending_kill {
            Some(kill) => Err(kill),
            None => Ok(()),
        }
    }

    /// Terminates a thread that must never run: the runtime is closing or a
    /// request reached the thread before it started. Returns whether it did.
    pub fn terminate_if_stillborn(&self, thread: &GuestThread) -> bool {
        let requested = thread
            .control_if_present()
            .is_some_and(|control| control.has_request());
        if !self.is_closing() && !requested {
            return false;
        }

        thread.mark_terminated();
        self.threads.remove(&thread.handle());
        ControlMetrics::bump(&self.metrics.stillborn_threads);
        debug!("thread {} is stillborn", thread.handle());
        self.trace(|t| t.trace_thread_stillborn(thread.handle()));
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ControlConfig,
        exceptions::{ControlSignal, GuestException},
        runtime::Runtime,
        threading::{ControlState, RunState},
    };

    #[test]
    fn test_stopped_before_start_is_stillborn() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("early");
        assert!(!runtime.terminate_if_stillborn(&thread));

        assert_eq!(runtime.stop(&thread, None), Ok(true));
        assert!(runtime.terminate_if_stillborn(&thread));
        assert_eq!(thread.run_state(), RunState::Terminated);
        assert!(runtime.thread(thread.handle()).is_none());
    }

    #[test]
    fn test_terminate_unregisters_and_ignores_late_stop() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("late");
        let attached = runtime.attach_for_test(&thread);
        let native = attached.native();
        assert_eq!(runtime.registry().lookup(native), Some(thread.handle()));

        runtime.set_exit_hook(|ctx| {
            // Exiting rejects stops
            let late = ctx.runtime().stop(ctx.thread(), Some(GuestException::new("Late")));
            assert_eq!(late, Ok(false));
            Ok(())
        });
        runtime.terminate(&thread).unwrap();

        assert_eq!(runtime.registry().lookup(native), None);
        assert_eq!(thread.run_state(), RunState::Terminated);
        assert_eq!(thread.control().state(), ControlState::Exiting);
        assert!(thread.wait_terminated(None));
    }

    #[test]
    fn test_kill_from_hook_returned_after_termination() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("hook-kill");
        let _attached = runtime.attach_for_test(&thread);

        runtime.set_exit_hook(|_| Err(ControlSignal::Kill { exit_status: 4 }));
        let result = runtime.terminate(&thread);

        assert_eq!(result, Err(ControlSignal::Kill { exit_status: 4 }));
        assert_eq!(thread.run_state(), RunState::Terminated);
        assert!(runtime.registry().is_empty());
    }

    #[test]
    fn test_stop_from_hook_is_swallowed() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("hook-stop");
        let _attached = runtime.attach_for_test(&thread);

        runtime.set_exit_hook(|_| Err(ControlSignal::Stop(GuestException::thread_death())));
        assert_eq!(runtime.terminate(&thread), Ok(()));
        assert!(runtime.registry().is_empty());
    }
}
