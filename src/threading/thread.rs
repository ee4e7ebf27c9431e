use crate::{
    sync::{AtomicBool, AtomicU8, Condvar, Mutex, OnceLock, Ordering},
    threading::{ControlSupport, PendingAction, RunState, ThreadHandle},
};
use std::{
    collections::VecDeque,
    fmt,
    mem,
    thread::{self, Thread, ThreadId},
    time::{Duration, Instant},
};

/// Why an interruptible wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The waited-for condition became true
    Ready,
    /// The deadline passed
    TimedOut,
    /// Someone woke the thread (control request or interrupt)
    Woken,
}

#[derive(Debug, Clone)]
struct HostThread {
    id: ThreadId,
    thread: Thread,
}

/// Host-level wake flag and condition used by interruptible waits.
#[derive(Debug, Default)]
struct Parker {
    woken: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn wake(&self) {
        *self.woken.lock() = true;
        self.cvar.notify_all();
    }

    fn take(&self) -> bool {
        mem::take(&mut *self.woken.lock())
    }

    fn park_until(
        &self,
        deadline: Option<Instant>,
        slice: Duration,
        ready: impl Fn() -> bool,
    ) -> WakeReason {
        let mut woken = self.woken.lock();
        loop {
            if *woken {
                *woken = false;
                return WakeReason::Woken;
            }
            if ready() {
                return WakeReason::Ready;
            }
            let now = Instant::now();
            let wait = match deadline {
                Some(d) if now >= d => return WakeReason::TimedOut,
                Some(d) => (d - now).min(slice),
                None => slice,
            };
            self.cvar.wait_for(&mut woken, wait);
        }
    }
}

/// Control block of one guest thread.
///
/// The run state has a single writer at a time: the launcher before the body
/// runs, the thread itself afterwards. Everything other threads may touch is
/// behind a lock or an atomic.
pub struct GuestThread {
    handle: ThreadHandle,
    name: String,
    daemon: bool,
    state: AtomicU8, // Encoded RunState
    started: AtomicBool,
    host: Mutex<Option<HostThread>>,
    control: OnceLock<ControlSupport>,
    inbox: Mutex<VecDeque<PendingAction>>,
    has_pending: AtomicBool,
    /// Guest-visible interrupt status
    interrupted: AtomicBool,
    parker: Parker,
    in_poll: AtomicBool,
    /// Monitor used to announce termination to joiners
    lifecycle: Mutex<()>,
    terminated: Condvar,
}

impl GuestThread {
    pub(crate) fn new(handle: ThreadHandle, name: impl Into<String>, daemon: bool) -> Self {
        Self {
            handle,
            name: name.into(),
            daemon,
            state: AtomicU8::new(RunState::New.encode()),
            started: AtomicBool::new(false),
            host: Mutex::new(None),
            control: OnceLock::new(),
            inbox: Mutex::new(VecDeque::new()),
            has_pending: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            parker: Parker::default(),
            in_poll: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            terminated: Condvar::new(),
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn run_state(&self) -> RunState {
        RunState::decode(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        self.state.store(state.encode(), Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.run_state().is_alive()
    }

    /// Whether `Runtime::start` was ever called for this thread.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Claims the right to launch this thread. Only the first call succeeds.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    // region host attachment

    pub fn host_id(&self) -> Option<ThreadId> {
        self.host.lock().as_ref().map(|h| h.id)
    }

    /// Whether the calling host thread is the one running this guest thread.
    pub fn is_current(&self) -> bool {
        self.host_id() == Some(thread::current().id())
    }

    pub(crate) fn attach_current(&self) -> ThreadId {
        let current = thread::current();
        let id = current.id();
        *self.host.lock() = Some(HostThread {
            id,
            thread: current,
        });
        id
    }

    pub(crate) fn detach(&self) {
        self.host.lock().take();
    }

    // endregion host attachment

    /// The control block, created on first use.
    pub fn control(&self) -> &ControlSupport {
        self.control.get_or_init(ControlSupport::new)
    }

    /// The control block, if anyone ever asked for it.
    pub fn control_if_present(&self) -> Option<&ControlSupport> {
        self.control.get()
    }

    // region pending actions

    pub(crate) fn push_action(&self, action: PendingAction) {
        let mut inbox = self.inbox.lock();
        inbox.push_back(action);
        self.has_pending.store(true, Ordering::Release);
    }

    pub fn has_pending_actions(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    pub(crate) fn pop_action(&self) -> Option<PendingAction> {
        let mut inbox = self.inbox.lock();
        let action = inbox.pop_front();
        if inbox.is_empty() {
            self.has_pending.store(false, Ordering::Release);
        }
        action
    }

    pub(crate) fn discard_actions(&self) -> usize {
        let mut inbox = self.inbox.lock();
        let dropped = inbox.len();
        inbox.clear();
        self.has_pending.store(false, Ordering::Release);
        dropped
    }

    /// Marks the thread as inside a poll; returns false if it already was.
    pub(crate) fn enter_poll(&self) -> bool {
        !self.in_poll.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn leave_poll(&self) {
        self.in_poll.store(false, Ordering::Relaxed);
    }

    pub(crate) fn is_in_poll(&self) -> bool {
        self.in_poll.load(Ordering::Relaxed)
    }

    // endregion pending actions

    // region interruption

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::Release);
    }

    pub(crate) fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Best-effort wake of whatever this thread is blocked in.
    ///
    /// Interruptible waits see the wake flag; host code parked with
    /// `std::thread::park` gets an unpark. Anything else is not reached.
    pub(crate) fn wake_host(&self) {
        self.parker.wake();
        let host = self.host.lock().as_ref().map(|h| h.thread.clone());
        if let Some(thread) = host {
            thread.unpark();
        }
    }

    pub(crate) fn take_host_wake(&self) -> bool {
        self.parker.take()
    }

    pub(crate) fn park_until(
        &self,
        deadline: Option<Instant>,
        slice: Duration,
        ready: impl Fn() -> bool,
    ) -> WakeReason {
        self.parker.park_until(deadline, slice, ready)
    }

    // endregion interruption

    // region termination

    pub(crate) fn mark_terminated(&self) {
        let _guard = self.lifecycle.lock();
        self.set_run_state(RunState::Terminated);
        // Notify waiting threads you are done working
        self.terminated.notify_all();
    }

    /// Blocks the calling host thread until this thread terminates.
    ///
    /// Returns false if `timeout` elapsed first. Not a safepoint; guest code
    /// should use [`ThreadContext::join`](crate::ThreadContext::join).
    pub fn wait_terminated(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lifecycle.lock();
        while self.run_state() != RunState::Terminated {
            match deadline {
                Some(d) => {
                    if self.terminated.wait_until(&mut guard, d).timed_out() {
                        return self.run_state() == RunState::Terminated;
                    }
                }
                None => self.terminated.wait(&mut guard),
            }
        }
        true
    }

    /// Waits for termination in slices, returning early when `woken` says so.
    pub(crate) fn wait_terminated_sliced(
        &self,
        deadline: Option<Instant>,
        slice: Duration,
        woken: impl Fn() -> bool,
    ) -> WakeReason {
        let mut guard = self.lifecycle.lock();
        loop {
            if self.run_state() == RunState::Terminated {
                return WakeReason::Ready;
            }
            if woken() {
                return WakeReason::Woken;
            }
            let now = Instant::now();
            let wait = match deadline {
                Some(d) if now >= d => return WakeReason::TimedOut,
                Some(d) => (d - now).min(slice),
                None => slice,
            };
            self.terminated.wait_for(&mut guard, wait);
        }
    }

    // endregion termination
}

impl fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestThread")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("state", &self.run_state())
            .field("host", &self.host_id())
            .field("control", &self.control_if_present().map(|c| c.state()))
            .finish()
    }
}
