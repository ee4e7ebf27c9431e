//! Interruptible blocking helpers for guest code.
//!
//! Each helper waits inside a [`BlockingGuard`](super::BlockingGuard) in
//! slices of `wake_slice`, so a control request or an interrupt is seen
//! within one slice even if its wake was missed.
use crate::{
    error::BlockingError,
    exceptions::ControlSignal,
    runtime::ThreadContext,
    threading::{BlockKind, GuestThread, WakeReason},
};
use std::time::{Duration, Instant};

impl ThreadContext {
    /// Sleeps for `duration`.
    ///
    /// Fails with `Interrupted` (clearing the status) if the thread is or
    /// becomes interrupted, or with the control signal of a request that
    /// arrived meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), BlockingError> {
        let runtime = self.runtime();
        let thread = self.thread();
        let deadline = Instant::now() + duration;
        loop {
            let guard = runtime.enter_blocking(thread, BlockKind::Sleeping)?;
            let slice = runtime.config().wake_slice;
            let reason = thread.park_until(Some(deadline), slice, || thread.is_interrupted());
            guard.exit()?;

            if thread.take_interrupted() {
                return Err(BlockingError::Interrupted);
            }
            if reason == WakeReason::TimedOut {
                return Ok(());
            }
        }
    }

    /// Waits for `target` to terminate. Returns false on timeout.
    ///
    /// A target that was never started counts as finished.
    pub fn join(
        &self,
        target: &GuestThread,
        timeout: Option<Duration>,
    ) -> Result<bool, BlockingError> {
        if !target.is_started() {
            return Ok(true);
        }
        let runtime = self.runtime();
        let thread = self.thread();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let guard = runtime.enter_blocking(thread, BlockKind::Joining)?;
            let slice = runtime.config().wake_slice;
            let reason = target.wait_terminated_sliced(deadline, slice, || {
                thread.is_interrupted() || thread.take_host_wake()
            });
            guard.exit()?;

            if thread.take_interrupted() {
                return Err(BlockingError::Interrupted);
            }
            match reason {
                WakeReason::Ready => return Ok(true),
                WakeReason::TimedOut => return Ok(false),
                WakeReason::Woken => {}
            }
        }
    }

    /// Runs the host call `f` as a blocking call of `kind`.
    pub fn blocking<T, E, F>(&self, kind: BlockKind, f: F) -> Result<T, E>
    where
        E: From<ControlSignal>,
        F: FnOnce() -> Result<T, E>,
    {
        self.runtime().run_blocking(self.thread(), kind, f)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::ControlConfig,
        error::BlockingError,
        exceptions::ControlSignal,
        runtime::{Runtime, ThreadOutcome},
        threading::{BlockKind, RunState},
    };
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn test_sleep_runs_to_deadline() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("sleeper");
        let handle = runtime
            .start(&thread, |ctx| {
                let started = Instant::now();
                ctx.sleep(Duration::from_millis(30)).map_err(|e| match e {
                    BlockingError::Control(signal) => signal,
                    BlockingError::Interrupted => panic!("not interrupted"),
                })?;
                assert!(started.elapsed() >= Duration::from_millis(30));
                assert_eq!(ctx.thread().run_state(), RunState::Runnable);
                Ok(())
            })
            .unwrap();
        assert_eq!(handle.join().unwrap(), ThreadOutcome::Completed);
    }

    #[test]
    fn test_interrupt_ends_sleep() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("interruptible");
        let (tx, rx) = mpsc::channel();
        let handle = runtime
            .start(&thread, move |ctx| {
                let result = ctx.sleep(Duration::from_secs(30));
                tx.send((result, ctx.thread().is_interrupted())).unwrap();
                Ok(())
            })
            .unwrap();

        thread::sleep(Duration::from_millis(30));
        runtime.interrupt(&thread);
        let (result, still_set) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(BlockingError::Interrupted));
        assert!(!still_set);
        assert_eq!(handle.join().unwrap(), ThreadOutcome::Completed);
    }

    #[test]
    fn test_join_waits_for_target() {
        let runtime = Runtime::new(ControlConfig::default());
        let worker = runtime.create_thread("worker");
        let joiner = runtime.create_thread("joiner");

        let worker_handle = runtime
            .start(&worker, |ctx| {
                ctx.sleep(Duration::from_millis(20)).ok();
                Ok(())
            })
            .unwrap();
        let target = worker.clone();
        let joiner_handle = runtime
            .start(&joiner, move |ctx| {
                let joined = ctx.join(&target, Some(Duration::from_secs(5)));
                assert_eq!(joined, Ok(true));
                Ok(())
            })
            .unwrap();

        assert_eq!(worker_handle.join().unwrap(), ThreadOutcome::Completed);
        assert_eq!(joiner_handle.join().unwrap(), ThreadOutcome::Completed);
    }

    #[test]
    fn test_join_times_out() {
        let runtime = Runtime::new(ControlConfig::default());
        let joiner = runtime.create_thread("impatient");
        let never = runtime.create_thread("never-ends");

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let never_handle = runtime
            .start(&never, move |ctx| {
                ctx.blocking(BlockKind::Io, || {
                    release_rx.recv().ok();
                    Ok::<(), ControlSignal>(())
                })
            })
            .unwrap();

        let target = never.clone();
        let joiner_handle = runtime
            .start(&joiner, move |ctx| {
                assert_eq!(ctx.join(&target, Some(Duration::from_millis(30))), Ok(false));
                Ok(())
            })
            .unwrap();
        assert_eq!(joiner_handle.join().unwrap(), ThreadOutcome::Completed);

        release_tx.send(()).unwrap();
        assert_eq!(never_handle.join().unwrap(), ThreadOutcome::Completed);
    }
}
