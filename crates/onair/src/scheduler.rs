//! Time-based command scheduler
//!
//! One scheduler per device instance. Entries are queued for a time and a
//! lane; a single wake loop claims every entry whose time has come and hands
//! it to the dispatcher according to the [`DispatchMode`]:
//!
//! - **Burst**: every due entry is invoked at once, across all lanes. Nothing
//!   waits for an earlier send to finish.
//! - **InOrder**: a lane holds at most one in-flight entry. The next due entry
//!   of that lane stays pending (and cancellable) until the previous send has
//!   settled. Lanes never wait on each other.
//!
//! Claiming and cancelling happen under the same lock, so an entry is either
//! claimed for firing or cancelled, never both.
//!
//! The loop sleeps until the earliest pending entry, but never longer than
//! `max_wake_ms`, and is woken early by `queue`, `clear_*`, and lane release.
//!
//! Failures and timing diagnostics go to a [`SchedulerObserver`]. Nothing is
//! retried here; the next timeline update re-plans.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onairconf::SchedulerConfig;
pub use onairconf::DispatchMode;

use crate::clock::Clock;
use crate::error::{panic_message, DispatchError, SchedulingError};
use crate::primitives::{EntryId, LaneId, Timestamp};

pub type DispatchFuture = BoxFuture<'static, Result<(), DispatchError>>;

type Job<A> = Box<dyn FnOnce(A) -> DispatchFuture + Send>;

/// Scheduler settings fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub mode: DispatchMode,
    pub slow_sent_ms: Option<u64>,
    pub slow_fulfilled_ms: Option<u64>,
    pub max_wake_ms: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            mode: config.dispatch,
            slow_sent_ms: config.slow_sent_ms,
            slow_fulfilled_ms: config.slow_fulfilled_ms,
            max_wake_ms: config.max_wake_ms.max(1),
        }
    }
}

/// Read-only view of one pending entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEntry<A> {
    pub id: EntryId,
    pub time: Timestamp,
    pub lane: LaneId,
    pub added_at: Timestamp,
    pub args: A,
}

/// Everything the scheduler reports about dispatched entries.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<A> {
    /// Dispatched later than `slow_sent_ms` after its planned time.
    SlowSent {
        id: EntryId,
        lane: LaneId,
        planned_send: Timestamp,
        actual_send: Timestamp,
        added_at: Timestamp,
        /// How far ahead of its planned time the entry was queued.
        lead_ms: i64,
    },
    /// Settled later than `slow_fulfilled_ms` after its planned time.
    SlowFulfilled {
        id: EntryId,
        lane: LaneId,
        planned_send: Timestamp,
        fulfilled_at: Timestamp,
    },
    DispatchFailed {
        id: EntryId,
        lane: LaneId,
        planned_send: Timestamp,
        args: A,
        error: DispatchError,
    },
    /// The entry's send finished, successfully or not.
    Settled {
        id: EntryId,
        lane: LaneId,
        planned_send: Timestamp,
        ok: bool,
    },
}

/// Receives scheduler diagnostics and failures.
pub trait SchedulerObserver<A>: Send + Sync {
    fn publish(&self, event: SchedulerEvent<A>);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl<A: fmt::Debug> SchedulerObserver<A> for TracingObserver {
    fn publish(&self, event: SchedulerEvent<A>) {
        log_event(&event);
    }
}

/// Shared log formatting for scheduler events.
pub fn log_event<A: fmt::Debug>(event: &SchedulerEvent<A>) {
    match event {
        SchedulerEvent::SlowSent {
            id,
            lane,
            planned_send,
            actual_send,
            lead_ms,
            ..
        } => warn!(
            entry.id = %id,
            lane = %lane,
            planned_send = planned_send.0,
            actual_send = actual_send.0,
            lead_ms,
            "slow sent command"
        ),
        SchedulerEvent::SlowFulfilled {
            id,
            lane,
            planned_send,
            fulfilled_at,
        } => warn!(
            entry.id = %id,
            lane = %lane,
            planned_send = planned_send.0,
            fulfilled_at = fulfilled_at.0,
            "slow fulfilled command"
        ),
        SchedulerEvent::DispatchFailed {
            id,
            lane,
            args,
            error,
            ..
        } => error!(
            entry.id = %id,
            lane = %lane,
            origin = ?error.origin,
            args = ?args,
            error = %error,
            "dispatch failed"
        ),
        SchedulerEvent::Settled { id, lane, ok, .. } => {
            debug!(entry.id = %id, lane = %lane, ok, "entry settled")
        }
    }
}

/// Forwards events into an unbounded channel. Mostly for tests and for
/// owners that want to react to failures.
pub struct ChannelObserver<A> {
    tx: mpsc::UnboundedSender<SchedulerEvent<A>>,
}

impl<A> ChannelObserver<A> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent<A>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<A: Send> SchedulerObserver<A> for ChannelObserver<A> {
    fn publish(&self, event: SchedulerEvent<A>) {
        let _ = self.tx.send(event);
    }
}

struct Entry<A> {
    id: EntryId,
    time: Timestamp,
    lane: LaneId,
    added_at: Timestamp,
    args: A,
    job: Job<A>,
}

struct Inner<A> {
    pending: BTreeMap<(Timestamp, EntryId), Entry<A>>,
    busy_lanes: HashSet<LaneId>,
    next_id: u64,
    disposed: bool,
}

/// Per-device, multi-lane, time-ordered executor.
pub struct Scheduler<A> {
    inner: Mutex<Inner<A>>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
    observer: Arc<dyn SchedulerObserver<A>>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl<A> Scheduler<A>
where
    A: Clone + Send + 'static,
{
    pub fn new(
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
        observer: Arc<dyn SchedulerObserver<A>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                busy_lanes: HashSet::new(),
                next_id: 0,
                disposed: false,
            }),
            clock,
            options,
            observer,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, Inner<A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `job(args)` to run once the clock reaches `time`.
    ///
    /// `job` itself is called synchronously at dispatch; the future it returns
    /// is driven on the tokio runtime.
    pub fn queue<F, Fut>(
        &self,
        time: Timestamp,
        lane: LaneId,
        args: A,
        job: F,
    ) -> Result<EntryId, SchedulingError>
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        if time.0 < 0 {
            return Err(SchedulingError::NegativeTime(time));
        }

        let added_at = self.clock.now();
        let id = {
            let mut inner = self.lock();
            if inner.disposed {
                return Err(SchedulingError::Disposed);
            }
            let id = EntryId(inner.next_id);
            inner.next_id += 1;
            inner.pending.insert(
                (time, id),
                Entry {
                    id,
                    time,
                    lane,
                    added_at,
                    args,
                    job: Box::new(move |args| job(args).boxed()),
                },
            );
            id
        };

        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel every pending entry with `entry.time > time`, all lanes.
    pub fn clear_queue_after(&self, time: Timestamp) -> usize {
        self.clear_from((time + 1, EntryId(0)))
    }

    /// Cancel every pending entry with `entry.time >= time`, all lanes.
    pub fn clear_queue_now_and_after(&self, time: Timestamp) -> usize {
        self.clear_from((time, EntryId(0)))
    }

    fn clear_from(&self, key: (Timestamp, EntryId)) -> usize {
        let removed = {
            let mut inner = self.lock();
            inner.pending.split_off(&key).len()
        };
        if removed > 0 {
            debug!(from = key.0 .0, removed, "cleared queued entries");
            self.wake.notify_one();
        }
        removed
    }

    /// Snapshot of pending entries in fire order.
    pub fn get_queue(&self) -> Vec<QueuedEntry<A>> {
        self.lock()
            .pending
            .values()
            .map(|e| QueuedEntry {
                id: e.id,
                time: e.time,
                lane: e.lane.clone(),
                added_at: e.added_at,
                args: e.args.clone(),
            })
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn earliest_pending(&self) -> Option<Timestamp> {
        self.lock().pending.keys().next().map(|(t, _)| *t)
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Cancel everything and stop the wake loop. In-flight sends are left to
    /// finish. Safe to call more than once.
    pub fn dispose(&self) {
        let cancelled = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.busy_lanes.clear();
            std::mem::take(&mut inner.pending).len()
        };
        self.shutdown.cancel();
        debug!(cancelled, "scheduler disposed");
    }

    /// Spawn the wake loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!(mode = %self.options.mode, "scheduler wake loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.tick();
            let delay = self.next_wake_delay();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("scheduler wake loop stopped");
    }

    /// How long the loop may sleep: until the earliest entry it could
    /// actually claim, capped at `max_wake_ms`.
    pub fn next_wake_delay(&self) -> Duration {
        let now = self.clock.now();
        let inner = self.lock();
        let earliest = inner
            .pending
            .values()
            .find(|e| {
                self.options.mode == DispatchMode::Burst || !inner.busy_lanes.contains(&e.lane)
            })
            .map(|e| e.time);

        let millis = match earliest {
            Some(time) => now.until(time).min(self.options.max_wake_ms),
            None => self.options.max_wake_ms,
        };
        Duration::from_millis(millis)
    }

    /// One wake evaluation: claim every due entry allowed by the dispatch
    /// mode and start it. Returns how many entries were dispatched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn tick(self: &Arc<Self>) -> usize {
        let now = self.clock.now();
        let claimed = self.claim_due(now);
        let count = claimed.len();
        for entry in claimed {
            self.dispatch(entry, now);
        }
        count
    }

    fn claim_due(&self, now: Timestamp) -> Vec<Entry<A>> {
        let mut inner = self.lock();
        if inner.disposed {
            return Vec::new();
        }

        let due = inner.pending.range(..=(now, EntryId(u64::MAX)));
        let keys: Vec<(Timestamp, EntryId)> = match self.options.mode {
            DispatchMode::Burst => due.map(|(k, _)| *k).collect(),
            DispatchMode::InOrder => {
                let mut lanes = HashSet::new();
                due.filter(|(_, e)| {
                    !inner.busy_lanes.contains(&e.lane) && lanes.insert(e.lane.clone())
                })
                .map(|(k, _)| *k)
                .collect()
            }
        };

        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = inner.pending.remove(&key) {
                if self.options.mode == DispatchMode::InOrder {
                    inner.busy_lanes.insert(entry.lane.clone());
                }
                claimed.push(entry);
            }
        }
        claimed
    }

    fn dispatch(self: &Arc<Self>, entry: Entry<A>, now: Timestamp) {
        let Entry {
            id,
            time,
            lane,
            added_at,
            args,
            job,
        } = entry;

        if let Some(limit) = self.options.slow_sent_ms {
            if now - time > i64::try_from(limit).unwrap_or(i64::MAX) {
                self.observer.publish(SchedulerEvent::SlowSent {
                    id,
                    lane: lane.clone(),
                    planned_send: time,
                    actual_send: now,
                    added_at,
                    lead_ms: time - added_at,
                });
            }
        }

        let failure_args = args.clone();
        let invoked = std::panic::catch_unwind(AssertUnwindSafe(move || job(args)));
        let future = match invoked {
            Ok(future) => future,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.settle(
                    id,
                    time,
                    lane,
                    failure_args,
                    Err(DispatchError::new(format!("entry {}", id), message)),
                );
                return;
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(DispatchError::new(
                    format!("entry {}", id),
                    panic_message(panic.as_ref()),
                )),
            };
            this.settle(id, time, lane, failure_args, result);
        });
    }

    fn settle(
        &self,
        id: EntryId,
        planned_send: Timestamp,
        lane: LaneId,
        args: A,
        result: Result<(), DispatchError>,
    ) {
        if self.options.mode == DispatchMode::InOrder {
            self.lock().busy_lanes.remove(&lane);
            self.wake.notify_one();
        }

        let now = self.clock.now();
        if let Some(limit) = self.options.slow_fulfilled_ms {
            if now - planned_send > i64::try_from(limit).unwrap_or(i64::MAX) {
                self.observer.publish(SchedulerEvent::SlowFulfilled {
                    id,
                    lane: lane.clone(),
                    planned_send,
                    fulfilled_at: now,
                });
            }
        }

        let ok = result.is_ok();
        if let Err(error) = result {
            self.observer.publish(SchedulerEvent::DispatchFailed {
                id,
                lane: lane.clone(),
                planned_send,
                args,
                error,
            });
        }
        self.observer.publish(SchedulerEvent::Settled {
            id,
            lane,
            planned_send,
            ok,
        });
    }
}
