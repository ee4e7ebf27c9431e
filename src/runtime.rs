use crate::{
    config::ControlConfig,
    error::{RegistryError, RuntimeError},
    exceptions::{ControlSignal, GuestException},
    metrics::{ControlMetrics, MetricsSnapshot},
    sync::{
        current_guest_handle, set_current_guest_handle, Arc, AtomicBool, AtomicI32, AtomicU64,
        Mutex, Ordering, RwLock,
    },
    threading::{AsyncNotifier, GuestThread, RunState, ThreadHandle, ThreadRegistry},
    tracer::Tracer,
};
use dashmap::DashMap;
use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Global counter for guest thread handles, shared by every runtime so
/// handles never collide across runtimes in one process.
static NEXT_GUEST_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type ExitHook =
    Arc<dyn Fn(&ThreadContext) -> Result<(), ControlSignal> + Send + Sync>;

/// How a launched guest thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadOutcome {
    /// Never ran: the runtime was closing or a request arrived before start
    Stillborn,
    Completed,
    /// An uncaught stop unwound the body
    Stopped(GuestException),
    Killed { exit_status: i32 },
    /// The host thread could not be registered; the body never ran
    Failed(RegistryError),
}

/// Owner of every guest thread and entry point for controlling them.
pub struct Runtime {
    pub(crate) config: ControlConfig,
    pub(crate) registry: ThreadRegistry,
    /// Every thread created and not yet terminated, started or not
    pub(crate) threads: DashMap<ThreadHandle, Arc<GuestThread>>,
    pub(crate) notifier: AsyncNotifier,
    pub(crate) metrics: Arc<ControlMetrics>,
    tracer: Mutex<Tracer>,
    pub(crate) trace_enabled: bool,
    closing: AtomicBool,
    pub(crate) exit_status: AtomicI32,
    pub(crate) exit_hook: RwLock<Option<ExitHook>>,
}

impl Runtime {
    pub fn new(config: ControlConfig) -> Arc<Self> {
        Self::with_tracer(config, Tracer::disabled())
    }

    /// Configuration and event tracer both taken from `THREADCTL_*` variables.
    pub fn from_env() -> Arc<Self> {
        Self::with_tracer(ControlConfig::from_env(), Tracer::from_env())
    }

    pub fn with_tracer(config: ControlConfig, tracer: Tracer) -> Arc<Self> {
        let metrics = Arc::new(ControlMetrics::new());
        Arc::new(Self {
            exit_status: AtomicI32::new(config.exit_status),
            config,
            registry: ThreadRegistry::new(),
            threads: DashMap::new(),
            notifier: AsyncNotifier::new(metrics.clone()),
            metrics,
            trace_enabled: tracer.is_enabled(),
            tracer: Mutex::new(tracer),
            closing: AtomicBool::new(false),
            exit_hook: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn notifier(&self) -> &AsyncNotifier {
        &self.notifier
    }

    pub(crate) fn trace(&self, f: impl FnOnce(&mut Tracer)) {
        if self.trace_enabled {
            f(&mut self.tracer.lock());
        }
    }

    pub fn flush_trace(&self) {
        self.tracer.lock().flush();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Records the exit status carried by kill signals from now on.
    pub fn request_exit(&self, status: i32) {
        info!("exit requested with status {}", status);
        self.exit_status.store(status, Ordering::Release);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// Guest-level shutdown hook run by every terminating thread.
    pub fn set_exit_hook<F>(&self, hook: F)
    where
        F: Fn(&ThreadContext) -> Result<(), ControlSignal> + Send + Sync + 'static,
    {
        *self.exit_hook.write() = Some(Arc::new(hook));
    }

    // region thread lifecycle

    pub fn create_thread(&self, name: impl Into<String>) -> Arc<GuestThread> {
        self.create_thread_with(name, false)
    }

    pub fn create_thread_with(&self, name: impl Into<String>, daemon: bool) -> Arc<GuestThread> {
        let handle = ThreadHandle::new(NEXT_GUEST_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(GuestThread::new(handle, name, daemon));
        self.threads.insert(handle, thread.clone());
        self.trace(|t| t.trace_thread_create(handle, thread.name()));
        thread
    }

    /// Launches `thread` on a new host thread.
    ///
    /// The body only runs if the thread is not stillborn, and only after a
    /// first safepoint poll. `terminate` runs however the body ends, panics
    /// included (the panic is resumed afterwards).
    pub fn start<F>(
        self: &Arc<Self>,
        thread: &Arc<GuestThread>,
        body: F,
    ) -> Result<JoinHandle<ThreadOutcome>, RuntimeError>
    where
        F: FnOnce(&ThreadContext) -> Result<(), ControlSignal> + Send + 'static,
    {
        if !thread.mark_started() {
            return Err(RuntimeError::AlreadyStarted(thread.handle()));
        }
        let runtime = self.clone();
        let target = thread.clone();
        let handle = thread::Builder::new()
            .name(thread.name().to_owned())
            .spawn(move || runtime.launch(target, body))?;
        Ok(handle)
    }

    fn launch<F>(self: Arc<Self>, thread: Arc<GuestThread>, body: F) -> ThreadOutcome
    where
        F: FnOnce(&ThreadContext) -> Result<(), ControlSignal>,
    {
        if self.terminate_if_stillborn(&thread) {
            return ThreadOutcome::Stillborn;
        }

        let native = thread.attach_current();
        if let Err(e) = self.registry.register(native, thread.handle()) {
            error!("cannot launch thread {}: {}", thread.handle(), e);
            thread.detach();
            thread.mark_terminated();
            self.threads.remove(&thread.handle());
            return ThreadOutcome::Failed(e);
        }
        set_current_guest_handle(Some(thread.handle()));
        self.record_state_change(&thread, thread.run_state(), RunState::Runnable);
        thread.set_run_state(RunState::Runnable);
        ControlMetrics::bump(&self.metrics.threads_started);
        self.trace(|t| t.trace_thread_start(thread.handle()));

        let ctx = ThreadContext::new(self.clone(), thread.clone());
        // A request that raced with the stillborn check lands here
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            ctx.poll()?;
            body(&ctx)
        }));

        let mut outcome = match &result {
            Ok(Ok(())) => ThreadOutcome::Completed,
            Ok(Err(ControlSignal::Stop(cause))) => {
                debug!("thread {} stopped by uncaught {}", thread.handle(), cause);
                ThreadOutcome::Stopped(cause.clone())
            }
            Ok(Err(ControlSignal::Kill { exit_status })) => ThreadOutcome::Killed {
                exit_status: *exit_status,
            },
            Err(_) => ThreadOutcome::Completed,
        };
        if let Err(ControlSignal::Kill { exit_status }) = self.terminate(&thread) {
            outcome = ThreadOutcome::Killed { exit_status };
        }
        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
        outcome
    }

    /// Stops accepting threads, kills every live one except the caller and
    /// waits up to `shutdown_grace` for the non-daemon ones.
    ///
    /// Returns the started non-daemon threads still alive at the deadline.
    /// Daemon threads are killed but never waited for.
    pub fn shutdown(&self) -> Vec<ThreadHandle> {
        self.closing.store(true, Ordering::Release);
        let current = current_guest_handle();
        let targets: Vec<Arc<GuestThread>> = self
            .threads()
            .into_iter()
            .filter(|t| Some(t.handle()) != current)
            .collect();
        info!("shutting down {} guest threads", targets.len());

        for target in &targets {
            // Never inline: the caller is excluded
            if let Err(signal) = self.kill(target) {
                warn!("kill of thread {} came back as {}", target.handle(), signal);
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        let stragglers: Vec<ThreadHandle> = targets
            .iter()
            .filter(|t| t.is_started() && !t.is_daemon())
            .filter(|t| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                !t.wait_terminated(Some(remaining))
            })
            .map(|t| t.handle())
            .collect();
        if !stragglers.is_empty() {
            warn!(
                "{} guest threads still alive after {:?}: {:?}",
                stragglers.len(),
                self.config.shutdown_grace,
                stragglers
            );
        }
        self.flush_trace();
        stragglers
    }

    // endregion thread lifecycle

    // region queries

    pub fn thread(&self, handle: ThreadHandle) -> Option<Arc<GuestThread>> {
        self.threads.get(&handle).map(|entry| entry.value().clone())
    }

    /// Every thread created and not yet terminated.
    pub fn threads(&self) -> Vec<Arc<GuestThread>> {
        self.threads.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn current_thread(&self) -> Option<Arc<GuestThread>> {
        current_guest_handle().and_then(|handle| self.thread(handle))
    }

    pub fn is_alive(&self, thread: &GuestThread) -> bool {
        thread.is_alive()
    }

    /// Running guest code, as opposed to blocked, new or finished.
    pub fn is_executing_guest_code(&self, thread: &GuestThread) -> bool {
        thread.run_state() == RunState::Runnable
    }

    pub fn thread_name(&self, thread: Option<&GuestThread>) -> String {
        match thread {
            Some(thread) => thread.name().to_owned(),
            None => "<unknown>".to_owned(),
        }
    }

    pub fn thread_id(&self, thread: Option<&GuestThread>) -> i64 {
        match thread {
            Some(thread) => thread.handle().as_u64() as i64,
            None => -1,
        }
    }

    // endregion queries

    // region interruption

    /// Sets the guest interrupt status of `target` and wakes it.
    pub fn interrupt(&self, target: &GuestThread) {
        target.set_interrupted(true);
        self.notifier.wake(target);
        self.trace(|t| t.trace_control_request(target.handle(), "interrupt", "woken"));
    }

    /// Reads the interrupt status, clearing it if `clear` is set.
    ///
    /// # Panics
    ///
    /// If `clear` is set and `target` is not the calling thread.
    pub fn is_interrupted(&self, target: &GuestThread, clear: bool) -> bool {
        if clear {
            self.assert_current(target);
            target.take_interrupted()
        } else {
            target.is_interrupted()
        }
    }

    /// # Panics
    ///
    /// If `target` is not the calling thread.
    pub fn clear_interrupt_status(&self, target: &GuestThread) {
        self.assert_current(target);
        target.set_interrupted(false);
    }

    // endregion interruption

    #[cfg(test)]
    pub(crate) fn attach_for_test(&self, thread: &Arc<GuestThread>) -> TestAttachment<'_> {
        let native = thread.attach_current();
        self.registry
            .register(native, thread.handle())
            .expect("test host thread already registered");
        set_current_guest_handle(Some(thread.handle()));
        thread.set_run_state(RunState::Runnable);
        TestAttachment {
            runtime: self,
            thread: thread.clone(),
            native,
        }
    }
}

/// Attaches a guest thread to the test's own host thread.
#[cfg(test)]
pub(crate) struct TestAttachment<'a> {
    runtime: &'a Runtime,
    thread: Arc<GuestThread>,
    native: thread::ThreadId,
}

#[cfg(test)]
impl TestAttachment<'_> {
    pub(crate) fn native(&self) -> thread::ThreadId {
        self.native
    }
}

#[cfg(test)]
impl Drop for TestAttachment<'_> {
    fn drop(&mut self) {
        self.thread.detach();
        self.runtime.registry.unregister(self.thread.handle());
        set_current_guest_handle(None);
    }
}

/// What a running guest thread sees of itself and its runtime.
#[derive(Clone)]
pub struct ThreadContext {
    runtime: Arc<Runtime>,
    thread: Arc<GuestThread>,
}

impl ThreadContext {
    pub(crate) fn new(runtime: Arc<Runtime>, thread: Arc<GuestThread>) -> Self {
        Self { runtime, thread }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn thread(&self) -> &Arc<GuestThread> {
        &self.thread
    }

    pub fn handle(&self) -> ThreadHandle {
        self.thread.handle()
    }

    /// Safepoint.
    pub fn poll(&self) -> Result<(), ControlSignal> {
        self.runtime.poll(&self.thread)
    }

    pub fn is_interrupted(&self, clear: bool) -> bool {
        self.runtime.is_interrupted(&self.thread, clear)
    }

    pub fn clear_interrupt_status(&self) {
        self.runtime.clear_interrupt_status(&self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_twice_fails() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("once");
        let handle = runtime.start(&thread, |_| Ok(())).unwrap();
        assert!(matches!(
            runtime.start(&thread, |_| Ok(())),
            Err(RuntimeError::AlreadyStarted(h)) if h == thread.handle()
        ));
        assert_eq!(handle.join().unwrap(), ThreadOutcome::Completed);
        assert_eq!(thread.run_state(), RunState::Terminated);
    }

    #[test]
    fn test_uncaught_stop_is_reported() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("thrower");
        let handle = runtime
            .start(&thread, |ctx| {
                ctx.runtime()
                    .stop(ctx.thread(), Some(GuestException::new("Self")))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            handle.join().unwrap(),
            ThreadOutcome::Stopped(GuestException::new("Self"))
        );
    }

    #[test]
    fn test_diagnostics_for_missing_thread() {
        let runtime = Runtime::new(ControlConfig::default());
        assert_eq!(runtime.thread_name(None), "<unknown>");
        assert_eq!(runtime.thread_id(None), -1);
        assert!(runtime.current_thread().is_none());

        let thread = runtime.create_thread("named");
        assert_eq!(runtime.thread_name(Some(&thread)), "named");
        assert!(!runtime.is_alive(&thread));
        assert!(!runtime.is_executing_guest_code(&thread));
    }

    #[test]
    fn test_current_thread_inside_body() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("me");
        let expected = thread.handle();
        let handle = runtime
            .start(&thread, move |ctx| {
                let current = ctx.runtime().current_thread().map(|t| t.handle());
                assert_eq!(current, Some(expected));
                assert!(ctx.runtime().is_executing_guest_code(ctx.thread()));
                Ok(())
            })
            .unwrap();
        assert_eq!(handle.join().unwrap(), ThreadOutcome::Completed);
        assert!(runtime.thread(expected).is_none());
    }

    #[test]
    fn test_interrupt_status() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("interrupted");
        let _attached = runtime.attach_for_test(&thread);

        runtime.interrupt(&thread);
        assert!(runtime.is_interrupted(&thread, false));
        assert!(runtime.is_interrupted(&thread, true));
        assert!(!runtime.is_interrupted(&thread, false));

        runtime.interrupt(&thread);
        runtime.clear_interrupt_status(&thread);
        assert!(!thread.is_interrupted());
    }

    #[test]
    fn test_panicking_body_still_terminates() {
        let runtime = Runtime::new(ControlConfig::default());
        let thread = runtime.create_thread("panics");
        let handle = runtime
            .start(&thread, |_| panic!("guest body failed"))
            .unwrap();
        assert!(handle.join().is_err());
        assert!(thread.wait_terminated(Some(Duration::from_secs(5))));
    }
}
