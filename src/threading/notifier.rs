use crate::{
    exceptions::ControlSignal,
    metrics::ControlMetrics,
    runtime::Runtime,
    sync::Arc,
    threading::GuestThread,
};
use enum_dispatch::enum_dispatch;
use std::{fmt, thread};

/// What a running target gets handed when it performs a pending action.
pub struct ActionAccess<'a> {
    pub runtime: &'a Runtime,
    pub thread: &'a GuestThread,
}

/// Work queued on a guest thread and performed by that thread at its next
/// safepoint.
#[enum_dispatch]
pub trait ThreadLocalAction {
    fn perform(&mut self, access: &ActionAccess<'_>) -> Result<(), ControlSignal>;

    fn name(&self) -> &'static str;
}

#[enum_dispatch(ThreadLocalAction)]
pub enum PendingAction {
    StopAction,
    SuspendAction,
    CallbackAction,
}

impl fmt::Debug for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingAction({})", self.name())
    }
}

/// Forces a stop/kill check on the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopAction;

impl ThreadLocalAction for StopAction {
    fn perform(&mut self, access: &ActionAccess<'_>) -> Result<(), ControlSignal> {
        access.runtime.handle_stop(access.thread)
    }

    fn name(&self) -> &'static str {
        "stop"
    }
}

/// Makes the target park on its suspend lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuspendAction;

impl ThreadLocalAction for SuspendAction {
    fn perform(&mut self, access: &ActionAccess<'_>) -> Result<(), ControlSignal> {
        if access.runtime.handle_suspend(access.thread) {
            // Killed while suspended
            access.runtime.handle_stop(access.thread)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "suspend"
    }
}

type Callback = Box<dyn FnOnce(&ActionAccess<'_>) -> Result<(), ControlSignal> + Send>;

/// Arbitrary code to run on the target thread. Runs at most once.
pub struct CallbackAction {
    name: &'static str,
    callback: Option<Callback>,
}

impl CallbackAction {
    pub fn new<F>(name: &'static str, callback: F) -> Self
    where
        F: FnOnce(&ActionAccess<'_>) -> Result<(), ControlSignal> + Send + 'static,
    {
        Self {
            name,
            callback: Some(Box::new(callback)),
        }
    }
}

impl ThreadLocalAction for CallbackAction {
    fn perform(&mut self, access: &ActionAccess<'_>) -> Result<(), ControlSignal> {
        match self.callback.take() {
            Some(callback) => callback(access),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// How a request reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Target has no host thread yet
    Deferred,
    /// Target is the calling thread
    Inline,
    /// Target runs on another host thread
    Remote,
}

impl Delivery {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Delivery::Deferred => "deferred",
            Delivery::Inline => "inline",
            Delivery::Remote => "remote",
        }
    }
}

/// Hands pending actions to guest threads and wakes them.
#[derive(Debug)]
pub struct AsyncNotifier {
    metrics: Arc<ControlMetrics>,
}

impl AsyncNotifier {
    pub fn new(metrics: Arc<ControlMetrics>) -> Self {
        Self { metrics }
    }

    pub(crate) fn route(&self, target: &GuestThread) -> Delivery {
        match target.host_id() {
            None => Delivery::Deferred,
            Some(id) if id == thread::current().id() => Delivery::Inline,
            Some(_) => Delivery::Remote,
        }
    }

    /// Queues `action` on `target` without waking it.
    pub fn submit(&self, target: &GuestThread, action: impl Into<PendingAction>) {
        let action = action.into();
        tracing::trace!("queueing {} action on thread {}", action.name(), target.handle());
        target.push_action(action);
        ControlMetrics::bump(&self.metrics.actions_submitted);
    }

    /// Best-effort wake. Harmless if the target is not blocked.
    pub fn wake(&self, target: &GuestThread) {
        target.wake_host();
        ControlMetrics::bump(&self.metrics.wakeups_sent);
    }

    pub fn notify(&self, target: &GuestThread, action: impl Into<PendingAction>) {
        self.submit(target, action);
        self.wake(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::ThreadHandle;

    #[test]
    fn test_route_unattached_is_deferred() {
        let notifier = AsyncNotifier::new(Arc::new(ControlMetrics::new()));
        let thread = GuestThread::new(ThreadHandle::new(1), "t", false);
        assert_eq!(notifier.route(&thread), Delivery::Deferred);

        thread.attach_current();
        assert_eq!(notifier.route(&thread), Delivery::Inline);
        thread.detach();
    }

    #[test]
    fn test_route_other_host_is_remote() {
        let notifier = AsyncNotifier::new(Arc::new(ControlMetrics::new()));
        let thread = Arc::new(GuestThread::new(ThreadHandle::new(2), "t", false));
        let t2 = thread.clone();
        std::thread::spawn(move || {
            t2.attach_current();
        })
        .join()
        .unwrap();
        assert_eq!(notifier.route(&thread), Delivery::Remote);
    }

    #[test]
    fn test_notify_queues_and_wakes() {
        let metrics = Arc::new(ControlMetrics::new());
        let notifier = AsyncNotifier::new(metrics.clone());
        let thread = GuestThread::new(ThreadHandle::new(3), "t", false);
        notifier.notify(&thread, StopAction);
        notifier.submit(&thread, CallbackAction::new("noop", |_| Ok(())));

        assert!(thread.has_pending_actions());
        assert_eq!(thread.pop_action().map(|a| a.name()), Some("stop"));
        assert_eq!(thread.pop_action().map(|a| a.name()), Some("noop"));
        assert!(!thread.has_pending_actions());
        assert!(thread.take_host_wake());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.actions_submitted, 2);
        assert_eq!(snapshot.wakeups_sent, 1);
    }
}
