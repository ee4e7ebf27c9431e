use crate::sync::{AtomicU64, Ordering};
use serde::Serialize;
use std::{fmt, time::Duration};

/// Thread control counters.
///
/// Every counter is independent and updated with `Ordering::Relaxed`; a
/// snapshot is not a consistent cut across counters.
#[derive(Debug, Default)]
pub struct ControlMetrics {
    pub safepoint_polls: AtomicU64,
    pub blocking_transitions: AtomicU64,
    pub stop_requests: AtomicU64,
    /// Stop requests refused because the target was not in NORMAL
    pub stop_rejections: AtomicU64,
    pub kill_requests: AtomicU64,
    pub stops_delivered: AtomicU64,
    pub kills_delivered: AtomicU64,
    pub suspend_requests: AtomicU64,
    pub resume_requests: AtomicU64,
    pub self_suspensions: AtomicU64,
    /// Total time spent parked in self-suspension (in microseconds)
    pub suspended_total_us: AtomicU64,
    pub actions_submitted: AtomicU64,
    pub actions_performed: AtomicU64,
    pub wakeups_sent: AtomicU64,
    pub threads_started: AtomicU64,
    pub threads_terminated: AtomicU64,
    pub stillborn_threads: AtomicU64,
}

impl ControlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspension(&self, duration: Duration) {
        self.self_suspensions.fetch_add(1, Ordering::Relaxed);
        self.suspended_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            safepoint_polls: load(&self.safepoint_polls),
            blocking_transitions: load(&self.blocking_transitions),
            stop_requests: load(&self.stop_requests),
            stop_rejections: load(&self.stop_rejections),
            kill_requests: load(&self.kill_requests),
            stops_delivered: load(&self.stops_delivered),
            kills_delivered: load(&self.kills_delivered),
            suspend_requests: load(&self.suspend_requests),
            resume_requests: load(&self.resume_requests),
            self_suspensions: load(&self.self_suspensions),
            suspended_total_us: load(&self.suspended_total_us),
            actions_submitted: load(&self.actions_submitted),
            actions_performed: load(&self.actions_performed),
            wakeups_sent: load(&self.wakeups_sent),
            threads_started: load(&self.threads_started),
            threads_terminated: load(&self.threads_terminated),
            stillborn_threads: load(&self.stillborn_threads),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub safepoint_polls: u64,
    pub blocking_transitions: u64,
    pub stop_requests: u64,
    pub stop_rejections: u64,
    pub kill_requests: u64,
    pub stops_delivered: u64,
    pub kills_delivered: u64,
    pub suspend_requests: u64,
    pub resume_requests: u64,
    pub self_suspensions: u64,
    pub suspended_total_us: u64,
    pub actions_submitted: u64,
    pub actions_performed: u64,
    pub wakeups_sent: u64,
    pub threads_started: u64,
    pub threads_terminated: u64,
    pub stillborn_threads: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Thread Control Statistics:")?;
        writeln!(f, "  Safepoint polls:        {:>10}", self.safepoint_polls)?;
        writeln!(f, "  Blocking transitions:   {:>10}", self.blocking_transitions)?;
        writeln!(
            f,
            "  Stop requests:          {:>10} (rejected: {}, delivered: {})",
            self.stop_requests, self.stop_rejections, self.stops_delivered
        )?;
        writeln!(
            f,
            "  Kill requests:          {:>10} (delivered: {})",
            self.kill_requests, self.kills_delivered
        )?;
        writeln!(
            f,
            "  Suspend/resume:         {:>10} / {}",
            self.suspend_requests, self.resume_requests
        )?;
        writeln!(
            f,
            "  Self-suspensions:       {:>10} ({} μs parked)",
            self.self_suspensions, self.suspended_total_us
        )?;
        writeln!(
            f,
            "  Pending actions:        {:>10} submitted, {} performed",
            self.actions_submitted, self.actions_performed
        )?;
        writeln!(f, "  Wakeups sent:           {:>10}", self.wakeups_sent)?;
        writeln!(
            f,
            "  Threads:                {:>10} started, {} terminated, {} stillborn",
            self.threads_started, self.threads_terminated, self.stillborn_threads
        )?;
        Ok(())
    }
}
