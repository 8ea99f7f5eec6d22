//! The single-threaded cooperative event loop that coordinates timers,
//! microtasks, and in-flight outbound fetches for one instance.
//!
//! Every operation here is synchronous from the caller's point of view — the
//! loop itself never spawns a thread. It is driven by [`LoadedInstance`](crate::instance::LoadedInstance)
//! between a handler invocation and the moment its returned promise settles,
//! via repeated calls to [`JsRuntime::evaluate`](worker_js_runtime::JsRuntime::evaluate)
//! and [`JsRuntime::pump_microtasks`](worker_js_runtime::JsRuntime::pump_microtasks),
//! so it never needs to know which JS engine backs the instance.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock a shared event loop, recovering from a poisoned mutex rather than
/// propagating the panic — a borrower panicking mid-drain shouldn't leave
/// the event loop permanently unusable for the rest of the instance's life.
pub(crate) fn lock(event_loop: &Mutex<EventLoop>) -> MutexGuard<'_, EventLoop> {
    event_loop.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A single pending `setTimeout`/`setInterval`-style timer.
#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

/// An outbound `fetch()` the worker is waiting on. Resolution is driven by
/// whatever binding issued the request; the event loop only tracks whether
/// one is still outstanding so it knows not to report the loop as idle.
#[derive(Debug)]
pub struct PendingFetch {
    /// Opaque id correlating this entry with the binding that owns it.
    pub id: u64,
    /// When the fetch was registered, used for diagnostics only.
    pub started_at: Instant,
}

/// Per-instance event loop state: a timer min-heap plus a set of in-flight
/// fetches. Reset (not recreated) between requests served by the same pooled
/// instance (§4.3 release).
#[derive(Debug, Default)]
pub struct EventLoop {
    timers: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
    pending_fetches: Vec<PendingFetch>,
}

impl EventLoop {
    /// Create a fresh, empty event loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer that fires `delay_ms` from now. `id` is whatever the
    /// JS-side `setTimeout` shim assigned; the loop only needs it back to
    /// call `__fireTimer(id)`.
    pub fn schedule_timer(&mut self, id: u64, delay_ms: u64) {
        self.cancelled.remove(&id);
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        self.timers.push(TimerEntry { deadline, id });
    }

    /// Cancel a previously scheduled timer. A no-op if it already fired or
    /// was never scheduled — matches `clearTimeout`'s JS semantics.
    pub fn cancel_timer(&mut self, id: u64) {
        self.cancelled.insert(id);
    }

    /// Register a fetch as outstanding so the loop won't report idle while
    /// it's pending.
    pub fn register_pending_fetch(&mut self, id: u64) {
        self.pending_fetches.push(PendingFetch {
            id,
            started_at: Instant::now(),
        });
    }

    /// Mark a previously registered fetch as resolved.
    pub fn resolve_fetch(&mut self, id: u64) {
        self.pending_fetches.retain(|f| f.id != id);
    }

    /// The earliest still-live timer deadline, skipping cancelled entries.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.timers.peek() {
            if self.cancelled.remove(&top.id) {
                self.timers.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    /// Pop every timer id due at or before `now`, skipping cancelled ones.
    fn pop_due(&mut self, now: Instant) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().expect("peeked entry must pop");
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            due.push(entry.id);
        }
        due
    }

    /// Whether the loop has nothing left to wait on.
    pub fn is_idle(&self) -> bool {
        self.timers.is_empty() && self.pending_fetches.is_empty()
    }

    /// Drive the loop forward until `is_settled` reports the handler's
    /// promise has resolved, an outer `deadline` passes, or the loop goes
    /// idle with nothing left pending.
    ///
    /// `fire_timer` is called once per due timer id (expected to evaluate
    /// `__fireTimer(id)` against the instance's runtime); `pump_microtasks`
    /// is called after every timer batch so `.then()` chains make progress.
    pub fn drain_until<FireTimer, PumpMicrotasks, IsSettled>(
        &mut self,
        deadline: Instant,
        mut fire_timer: FireTimer,
        mut pump_microtasks: PumpMicrotasks,
        mut is_settled: IsSettled,
    ) where
        FireTimer: FnMut(u64) -> anyhow::Result<()>,
        PumpMicrotasks: FnMut(),
        IsSettled: FnMut() -> bool,
    {
        pump_microtasks();
        loop {
            if is_settled() {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            let now = Instant::now();
            let due = self.pop_due(now);
            if due.is_empty() {
                if self.is_idle() {
                    return;
                }
                let wake_at = self
                    .next_deadline()
                    .map(|d| d.min(deadline))
                    .unwrap_or(deadline);
                if wake_at > now {
                    std::thread::sleep((wake_at - now).min(deadline.saturating_duration_since(now)));
                }
                continue;
            }
            for id in due {
                if let Err(err) = fire_timer(id) {
                    tracing::warn!(timer_id = id, %err, "timer callback failed");
                }
            }
            pump_microtasks();
        }
    }

    /// Clear all timers and pending fetches. Called as part of an instance's
    /// release back into the pool (§4.3), alongside the fixed JS cleanup
    /// script that wipes per-request globals.
    pub fn reset(&mut self) {
        self.timers.clear();
        self.cancelled.clear();
        self.pending_fetches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_with_no_timers_or_fetches() {
        let loop_ = EventLoop::new();
        assert!(loop_.is_idle());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut loop_ = EventLoop::new();
        loop_.schedule_timer(1, 0);
        loop_.cancel_timer(1);
        let due = loop_.pop_due(Instant::now() + Duration::from_millis(5));
        assert!(due.is_empty());
    }

    #[test]
    fn due_timer_is_popped_in_order() {
        let mut loop_ = EventLoop::new();
        loop_.schedule_timer(2, 10);
        loop_.schedule_timer(1, 0);
        let due = loop_.pop_due(Instant::now() + Duration::from_millis(20));
        assert_eq!(due, vec![1, 2]);
    }

    #[test]
    fn pending_fetch_keeps_loop_busy() {
        let mut loop_ = EventLoop::new();
        loop_.register_pending_fetch(7);
        assert!(!loop_.is_idle());
        loop_.resolve_fetch(7);
        assert!(loop_.is_idle());
    }

    #[test]
    fn reset_clears_everything() {
        let mut loop_ = EventLoop::new();
        loop_.schedule_timer(1, 1000);
        loop_.register_pending_fetch(2);
        loop_.reset();
        assert!(loop_.is_idle());
    }

    #[test]
    fn drain_until_stops_when_settled() {
        let mut loop_ = EventLoop::new();
        loop_.schedule_timer(1, 5);
        let mut fired = Vec::new();
        loop_.drain_until(
            Instant::now() + Duration::from_secs(1),
            |id| {
                fired.push(id);
                Ok(())
            },
            || {},
            || true,
        );
        assert!(fired.is_empty());
    }

    #[test]
    fn drain_until_fires_due_timer_before_settling() {
        let mut loop_ = EventLoop::new();
        loop_.schedule_timer(1, 1);
        let mut fired = Vec::new();
        let mut calls = 0;
        loop_.drain_until(
            Instant::now() + Duration::from_millis(200),
            |id| {
                fired.push(id);
                Ok(())
            },
            || {},
            || {
                calls += 1;
                calls > 1 && !fired.is_empty()
            },
        );
        assert_eq!(fired, vec![1]);
    }
}
