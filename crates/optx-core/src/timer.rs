//! Time source and cancelable deferred actions.
//!
//! Every wait in the engine (gateway-timeout grace, controller restore,
//! executor force-stop) is a one-shot task on a [`Scheduler`], addressed by a
//! [`TimerHandle`]. Nothing in the core blocks or awaits on time directly.
//!
//! Two schedulers are provided:
//! - [`TokioScheduler`]: spawns a sleeping task on the tokio runtime
//! - [`ManualScheduler`]: virtual time advanced explicitly, for tests

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::trace;

use crate::error::{CoreError, Result};

/// Clock abstraction for testability.
pub trait Clock: Send + Sync {
    /// Returns current time in milliseconds.
    ///
    /// The epoch is implementation defined; only differences are meaningful.
    fn now_ms(&self) -> u64;
}

/// Wall clock, milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Work deferred onto a scheduler.
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Clock that can also run a task once after a delay.
pub trait Scheduler: Clock {
    /// Run `task` once after `delay`, unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: DeferredTask) -> TimerHandle;
}

// ============================================================================
// Timer handle
// ============================================================================

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a scheduled one-shot task.
///
/// Exactly one of `cancel` and firing wins. Cancelling a fired or already
/// cancelled timer is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Cancel the task. Returns true if this call prevented it from running.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Claim the right to run the task. Called by scheduler implementations.
    pub fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tokio scheduler
// ============================================================================

/// Scheduler backed by the tokio timer wheel.
///
/// `now_ms` counts from construction on the tokio clock, so paused-time tests
/// see consistent timestamps.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    origin: tokio::time::Instant,
}

impl TokioScheduler {
    /// Bind to the runtime of the calling context.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| CoreError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(handle))
    }

    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioScheduler {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: DeferredTask) -> TimerHandle {
        let timer = TimerHandle::new();
        let guard = timer.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if guard.try_fire() {
                task();
            } else {
                trace!(delay_ms = delay.as_millis() as u64, "Timer cancelled before firing");
            }
        });
        timer
    }
}

// ============================================================================
// Manual scheduler
// ============================================================================

struct ManualInner {
    now_ms: u64,
    seq: u64,
    queue: BTreeMap<(u64, u64), (TimerHandle, DeferredTask)>,
}

/// Deterministic scheduler driven by explicit `advance` calls.
///
/// Tasks due at the same instant run in scheduling order. The clock reads the
/// task's due time while it runs, so tasks scheduled from inside a task are
/// relative to that instant.
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now_ms: start_ms,
                seq: 0,
                queue: BTreeMap::new(),
            }),
        }
    }

    /// Advance virtual time, running every task that falls due.
    ///
    /// Returns the number of tasks that ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.inner.lock().now_ms + by.as_millis() as u64;
        self.advance_to(target)
    }

    /// Advance virtual time to `target_ms` (no-op if already past it).
    pub fn advance_to(&self, target_ms: u64) -> usize {
        let mut fired = 0;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                let due = match inner.queue.keys().next() {
                    Some(&(due, seq)) if due <= target_ms => (due, seq),
                    _ => {
                        inner.now_ms = inner.now_ms.max(target_ms);
                        break;
                    }
                };
                inner.now_ms = inner.now_ms.max(due.0);
                inner.queue.remove(&due)
            };
            // Run outside the lock: tasks commonly schedule follow-ups.
            if let Some((timer, task)) = next {
                if timer.try_fire() {
                    task();
                    fired += 1;
                }
            }
        }
        fired
    }

    /// Number of scheduled tasks that have neither fired nor been cancelled.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .queue
            .values()
            .filter(|(timer, _)| timer.is_pending())
            .count()
    }
}

impl Clock for ManualScheduler {
    fn now_ms(&self) -> u64 {
        self.inner.lock().now_ms
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: DeferredTask) -> TimerHandle {
        let timer = TimerHandle::new();
        let mut inner = self.inner.lock();
        let due = inner.now_ms + delay.as_millis() as u64;
        let seq = inner.seq;
        inner.seq += 1;
        inner.queue.insert((due, seq), (timer.clone(), task));
        timer
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ManualScheduler")
            .field("now_ms", &inner.now_ms)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> DeferredTask {
        let c = counter.clone();
        Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_timer_cancel_is_idempotent() {
        let timer = TimerHandle::new();
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.try_fire());
        assert!(timer.is_cancelled());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let timer = TimerHandle::new();
        assert!(timer.try_fire());
        assert!(!timer.cancel());
        assert!(!timer.is_pending());
    }

    #[test]
    fn test_manual_scheduler_runs_due_tasks_only() {
        let sched = ManualScheduler::new(1_000);
        let counter = Arc::new(AtomicUsize::new(0));

        sched.schedule(Duration::from_millis(100), counter_task(&counter));
        sched.schedule(Duration::from_millis(500), counter_task(&counter));

        assert_eq!(sched.advance(Duration::from_millis(99)), 0);
        assert_eq!(sched.advance(Duration::from_millis(1)), 1);
        assert_eq!(sched.now_ms(), 1_100);
        assert_eq!(sched.pending_count(), 1);

        assert_eq!(sched.advance(Duration::from_secs(1)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(sched.now_ms(), 2_100);
    }

    #[test]
    fn test_manual_scheduler_skips_cancelled() {
        let sched = ManualScheduler::new(0);
        let counter = Arc::new(AtomicUsize::new(0));

        let timer = sched.schedule(Duration::from_millis(10), counter_task(&counter));
        timer.cancel();

        assert_eq!(sched.pending_count(), 0);
        assert_eq!(sched.advance(Duration::from_millis(20)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_scheduler_nested_schedule() {
        let sched = Arc::new(ManualScheduler::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_sched = sched.clone();
        let inner_counter = counter.clone();
        sched.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                // Due at 10 + 5 = 15.
                inner_sched.schedule(Duration::from_millis(5), counter_task(&inner_counter));
            }),
        );

        assert_eq!(sched.advance(Duration::from_millis(14)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(sched.advance(Duration::from_millis(1)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_after_delay() {
        let sched = TokioScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let timer = sched.schedule(Duration::from_millis(50), counter_task(&counter));
        let cancelled = sched.schedule(Duration::from_millis(50), counter_task(&counter));
        cancelled.cancel();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
        assert!(sched.now_ms() >= 60);
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(matches!(TokioScheduler::current(), Err(CoreError::NoRuntime(_))));
    }
}
