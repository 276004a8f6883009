// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

/// Clock seam so scheduler time can be virtualized in tests.
pub trait TimeBridge: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Monotonic-enough wall clock for production use.
#[derive(Default)]
pub struct SystemClock;

impl TimeBridge for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic scheduler tests.
pub struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
}

impl VirtualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl TimeBridge for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Context handed to schedule callbacks.
#[derive(Debug, Clone)]
pub struct ScheduleTick {
    /// Completed model turns at fire time.
    pub step_count: u64,
    pub at: DateTime<Utc>,
}

/// Schedule callbacks are synchronous — the typical body is a non-blocking
/// `agent.send(..., reminder)` — and always run on the owning agent's
/// dispatch queue, never in parallel with a model turn.
pub type ScheduleCallback = Arc<dyn Fn(ScheduleTick) + Send + Sync>;

/// A due time-based callback handed to the agent actor.
pub struct ScheduledFire {
    pub callback: ScheduleCallback,
    pub tick: ScheduleTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

enum Trigger {
    EverySteps { n: u64 },
    At { when: DateTime<Utc> },
    Every { period: chrono::Duration, next: DateTime<Utc> },
}

struct Entry {
    id: TaskId,
    trigger: Trigger,
    callback: ScheduleCallback,
}

/// Per-agent scheduler: step-count and wall-clock triggers.
///
/// Step triggers fire inline from the orchestrator after each completed
/// model turn.  Time triggers are collected by the cooperative ticker
/// ([`Scheduler::poll_timers`]) and dispatched onto the agent actor's queue.
pub struct Scheduler {
    clock: Arc<dyn TimeBridge>,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    dispatch: mpsc::UnboundedSender<ScheduledFire>,
    step_count: AtomicU64,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn TimeBridge>, dispatch: mpsc::UnboundedSender<ScheduledFire>) -> Self {
        Self {
            clock,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dispatch,
            step_count: AtomicU64::new(0),
        }
    }

    fn insert(&self, trigger: Trigger, callback: ScheduleCallback) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push(Entry {
            id,
            trigger,
            callback,
        });
        id
    }

    /// Fire whenever the orchestrator completes another `n` model turns.
    pub fn every_steps(
        &self,
        n: u64,
        callback: impl Fn(ScheduleTick) + Send + Sync + 'static,
    ) -> TaskId {
        self.insert(Trigger::EverySteps { n: n.max(1) }, Arc::new(callback))
    }

    /// Fire once at `when` on the bridge clock.
    pub fn at(
        &self,
        when: DateTime<Utc>,
        callback: impl Fn(ScheduleTick) + Send + Sync + 'static,
    ) -> TaskId {
        self.insert(Trigger::At { when }, Arc::new(callback))
    }

    /// Fire repeatedly with the given period.
    pub fn every(
        &self,
        period: Duration,
        callback: impl Fn(ScheduleTick) + Send + Sync + 'static,
    ) -> TaskId {
        let period = chrono::Duration::from_std(period)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let next = self.clock.now() + period;
        self.insert(Trigger::Every { period, next }, Arc::new(callback))
    }

    pub fn cancel(&self, id: TaskId) {
        self.entries.lock().unwrap().retain(|e| e.id != id);
    }

    pub fn step_count(&self) -> u64 {
        self.step_count.load(Ordering::Relaxed)
    }

    /// Called by the orchestrator after each completed model turn; runs due
    /// step callbacks inline (already on the dispatch queue).
    pub fn on_step(&self) {
        let step_count = self.step_count.fetch_add(1, Ordering::Relaxed) + 1;
        let due: Vec<ScheduleCallback> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|entry| match entry.trigger {
                Trigger::EverySteps { n } if step_count % n == 0 => {
                    Some(Arc::clone(&entry.callback))
                }
                _ => None,
            })
            .collect();
        let tick = ScheduleTick {
            step_count,
            at: self.clock.now(),
        };
        for callback in due {
            callback(tick.clone());
        }
    }

    /// Advance time-based triggers; due callbacks are dispatched to the
    /// agent actor rather than run here.
    pub fn poll_timers(&self) {
        let now = self.clock.now();
        let step_count = self.step_count();
        let mut fires = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain_mut(|entry| match &mut entry.trigger {
                Trigger::At { when } => {
                    if *when <= now {
                        fires.push(Arc::clone(&entry.callback));
                        false
                    } else {
                        true
                    }
                }
                Trigger::Every { period, next } => {
                    while *next <= now {
                        fires.push(Arc::clone(&entry.callback));
                        *next += *period;
                    }
                    true
                }
                Trigger::EverySteps { .. } => true,
            });
        }
        for callback in fires {
            debug!("dispatching due timer callback");
            let _ = self.dispatch.send(ScheduledFire {
                callback,
                tick: ScheduleTick {
                    step_count,
                    at: now,
                },
            });
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn scheduler_with_clock(
        clock: Arc<dyn TimeBridge>,
    ) -> (Arc<Scheduler>, mpsc::UnboundedReceiver<ScheduledFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Scheduler::new(clock, tx)), rx)
    }

    #[tokio::test]
    async fn every_steps_fires_on_multiples() {
        let (scheduler, _rx) = scheduler_with_clock(Arc::new(SystemClock));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        scheduler.every_steps(2, move |_tick| {
            f.fetch_add(1, Ordering::Relaxed);
        });
        scheduler.on_step(); // 1
        scheduler.on_step(); // 2 → fire
        scheduler.on_step(); // 3
        scheduler.on_step(); // 4 → fire
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn at_fires_once_when_clock_passes() {
        let clock = Arc::new(VirtualClock::default());
        let (scheduler, mut rx) = scheduler_with_clock(clock.clone());
        scheduler.at(clock.now() + chrono::Duration::seconds(10), |_tick| {});

        scheduler.poll_timers();
        assert!(rx.try_recv().is_err(), "not due yet");

        clock.advance(Duration::from_secs(11));
        scheduler.poll_timers();
        assert!(rx.try_recv().is_ok(), "due after advance");

        scheduler.poll_timers();
        assert!(rx.try_recv().is_err(), "one-shot fires once");
    }

    #[tokio::test]
    async fn every_fires_per_elapsed_period() {
        let clock = Arc::new(VirtualClock::default());
        let (scheduler, mut rx) = scheduler_with_clock(clock.clone());
        scheduler.every(Duration::from_secs(5), |_tick| {});

        clock.advance(Duration::from_secs(16));
        scheduler.poll_timers();
        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 3, "three periods elapsed");
    }

    #[tokio::test]
    async fn cancel_removes_entry() {
        let clock = Arc::new(VirtualClock::default());
        let (scheduler, mut rx) = scheduler_with_clock(clock.clone());
        let id = scheduler.at(clock.now() + chrono::Duration::seconds(1), |_tick| {});
        scheduler.cancel(id);
        clock.advance(Duration::from_secs(5));
        scheduler.poll_timers();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tick_reports_step_count() {
        let (scheduler, _rx) = scheduler_with_clock(Arc::new(SystemClock));
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        scheduler.every_steps(1, move |tick| {
            s.store(tick.step_count, Ordering::Relaxed);
        });
        scheduler.on_step();
        scheduler.on_step();
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
