//! Deterministic virtual-time scheduler for tests.
//!
//! Actions are queued against a virtual clock and only run when the test
//! advances time ([`VirtualScheduler::advance_time_to`],
//! [`VirtualScheduler::advance_time_by`]) or triggers what is already due
//! ([`VirtualScheduler::trigger_actions`]). Everything runs inline on the
//! caller's thread.
//!
//! # Invariants
//!
//! - **I1 (total order):** actions run in ascending `(due_ms, seq)` order
//! - **I2 (stable ties):** actions with equal due times run in scheduling order
//! - **I3 (fixpoint):** a sweep drains actions scheduled by running actions
//!   when they fall inside the window, before the clock is committed
//! - **I4 (never inline):** `schedule*` only enqueues, even with zero delay
//! - **I5 (clock-neutral trigger):** `trigger_actions` leaves `now_ms` unchanged

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::config::{ErrorPolicy, SchedulerConfig};
use crate::error::{ActionFailure, ActionFailures, Error, Result};

/// A unit of scheduled work.
pub type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Monotonically increasing sequence counter for deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    /// Create the initial sequence value.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Get the next sequence value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Identity of a scheduled action, unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(u64);

impl ActionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action:{}", self.0)
    }
}

/// A source of virtual "now".
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

impl<C: Clock> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        self.as_ref().now_ms()
    }
}

/// Scheduling strategy that producers route their delay-based work through.
pub trait TimerScheduler: Clock + Clone + 'static {
    /// Non-owning form of the scheduler. Producer state that lives inside the
    /// queue holds this, so queued work never keeps its own scheduler alive.
    type WeakHandle: Send + Sync + 'static;

    /// Enqueue `action` to run once `delay` has elapsed on this scheduler's clock.
    fn schedule_action(&self, delay: Duration, action: Action) -> Result<ActionHandle>;

    fn downgrade(&self) -> Self::WeakHandle;

    /// `None` once every owning handle is gone.
    fn upgrade(weak: &Self::WeakHandle) -> Option<Self>;
}

/// Caller-side handle to a scheduled action.
#[derive(Debug, Clone)]
pub struct ActionHandle {
    id: ActionId,
    due_ms: u64,
    cancelled: Arc<AtomicBool>,
}

impl ActionHandle {
    #[must_use]
    pub const fn id(&self) -> ActionId {
        self.id
    }

    #[must_use]
    pub const fn due_ms(&self) -> u64 {
        self.due_ms
    }

    /// Mark the action cancelled so it never runs.
    ///
    /// Returns `true` if this call changed the flag. Cancelling an action that
    /// is already running does not interrupt it.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, atomic::Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::SeqCst)
    }
}

/// An entry in the pending-action heap.
struct ScheduledAction {
    id: ActionId,
    due_ms: u64,
    seq: Seq,
    cancelled: Arc<AtomicBool>,
    action: Action,
}

impl ScheduledAction {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(atomic::Ordering::SeqCst)
    }
}

impl fmt::Debug for ScheduledAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledAction")
            .field("id", &self.id)
            .field("due_ms", &self.due_ms)
            .field("seq", &self.seq)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

// Order by (due_ms, seq) ascending - min-heap needs reversed comparison.
impl PartialEq for ScheduledAction {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for ScheduledAction {}

impl PartialOrd for ScheduledAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledAction {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.due_ms.cmp(&self.due_ms) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Summary of one successful sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Actions that ran to completion.
    pub executed: usize,
    /// Cancelled actions inside the sweep window, discarded instead of run.
    pub skipped_cancelled: usize,
    /// Clock value after the sweep.
    pub now_ms: u64,
}

impl SweepReport {
    fn absorb(&mut self, other: Self) {
        self.executed += other.executed;
        self.skipped_cancelled += other.skipped_cancelled;
        self.now_ms = other.now_ms;
    }
}

#[derive(Debug, Clone, Copy)]
enum SweepKind {
    Trigger,
    AdvanceTo(u64),
}

impl SweepKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::AdvanceTo(_) => "advance",
        }
    }
}

struct SchedulerState {
    now_ms: u64,
    seq: Seq,
    next_action_id: u64,
    queue: BinaryHeap<ScheduledAction>,
    sweeping: bool,
}

impl SchedulerState {
    const fn next_seq(&mut self) -> Seq {
        let current = self.seq;
        self.seq = self.seq.next();
        current
    }

    /// Pop the next non-cancelled action due at or before `target_ms`.
    ///
    /// The clock moves forward to the action's due time so that work scheduled
    /// from inside the action is anchored there. It never moves backward here.
    fn pop_due(&mut self, target_ms: u64, skipped: &mut usize) -> Option<ScheduledAction> {
        while let Some(top) = self.queue.peek() {
            if top.due_ms > target_ms {
                return None;
            }
            if top.is_cancelled() {
                let entry = self.queue.pop()?;
                *skipped += 1;
                tracing::trace!(
                    event = "scheduler.action.skip_cancelled",
                    action_id = %entry.id,
                    due_ms = entry.due_ms,
                    "Skipped cancelled action"
                );
                continue;
            }
            let entry = self.queue.pop()?;
            self.now_ms = self.now_ms.max(entry.due_ms);
            return Some(entry);
        }
        None
    }

    fn has_due(&self, target_ms: u64) -> bool {
        self.queue
            .iter()
            .any(|entry| !entry.is_cancelled() && entry.due_ms <= target_ms)
    }

    fn live_entries(&self) -> impl Iterator<Item = &ScheduledAction> {
        self.queue.iter().filter(|entry| !entry.is_cancelled())
    }
}

/// Clears the in-progress flag when a sweep ends, however it ends.
struct SweepGuard<'a> {
    state: &'a Mutex<SchedulerState>,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sweeping = false;
    }
}

/// Virtual-time scheduler owned by a single test.
///
/// Cloning yields another handle to the same clock and queue, which is how
/// actions and producers schedule follow-up work.
#[derive(Clone)]
pub struct VirtualScheduler {
    state: Arc<Mutex<SchedulerState>>,
    config: Arc<SchedulerConfig>,
}

impl VirtualScheduler {
    /// Create a scheduler with default configuration, clock at 0.
    #[must_use]
    pub fn new() -> Self {
        Self::build(SchedulerConfig::default())
    }

    /// Create a scheduler configured from `VTIME_*` environment variables.
    ///
    /// Malformed or zero values fall back to the defaults, so the result is
    /// always valid.
    #[must_use]
    pub fn from_env() -> Self {
        Self::build(SchedulerConfig::from_env())
    }

    /// Create a scheduler from an explicit configuration, rejecting invalid ones.
    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SchedulerConfig) -> Self {
        let state = SchedulerState {
            now_ms: config.epoch_ms,
            seq: Seq::zero(),
            next_action_id: 1,
            queue: BinaryHeap::new(),
            sweeping: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// A handle that does not keep the clock and queue alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            state: Arc::downgrade(&self.state),
            config: Arc::clone(&self.config),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    /// Sequence number the next scheduled action will receive.
    #[must_use]
    pub fn current_seq(&self) -> Seq {
        self.lock().seq
    }

    /// Schedule `action` at the current time. It runs on the next sweep.
    pub fn schedule<F>(&self, action: F) -> ActionHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut state = self.lock();
        let due_ms = state.now_ms;
        Self::push(&mut state, due_ms, 0, Box::new(action))
    }

    /// Schedule `action` to run `delay` after the current time.
    ///
    /// Sub-millisecond precision is truncated.
    pub fn schedule_after<F>(&self, delay: Duration, action: F) -> Result<ActionHandle>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.schedule_boxed(duration_ms(delay), Box::new(action))
    }

    /// Schedule with a signed millisecond delay; negative delays are rejected.
    pub fn schedule_after_ms<F>(&self, delay_ms: i64, action: F) -> Result<ActionHandle>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let delay_ms = u64::try_from(delay_ms).map_err(|_| Error::NegativeDelay { delay_ms })?;
        self.schedule_boxed(delay_ms, Box::new(action))
    }

    fn schedule_boxed(&self, delay_ms: u64, action: Action) -> Result<ActionHandle> {
        let mut state = self.lock();
        let now_ms = state.now_ms;
        let due_ms = now_ms
            .checked_add(delay_ms)
            .ok_or(Error::DueTimeOverflow { now_ms, delay_ms })?;
        Ok(Self::push(&mut state, due_ms, delay_ms, action))
    }

    fn push(state: &mut SchedulerState, due_ms: u64, delay_ms: u64, action: Action) -> ActionHandle {
        let id = ActionId(state.next_action_id);
        state.next_action_id += 1;
        let seq = state.next_seq();
        let cancelled = Arc::new(AtomicBool::new(false));

        state.queue.push(ScheduledAction {
            id,
            due_ms,
            seq,
            cancelled: Arc::clone(&cancelled),
            action,
        });

        tracing::trace!(
            event = "scheduler.action.schedule",
            action_id = %id,
            delay_ms,
            due_ms,
            %seq,
            "Action scheduled"
        );

        ActionHandle {
            id,
            due_ms,
            cancelled,
        }
    }

    /// Cancel a scheduled action. Returns `true` if it was not already cancelled.
    pub fn cancel(&self, handle: &ActionHandle) -> bool {
        let cancelled = handle.cancel();
        tracing::trace!(
            event = "scheduler.action.cancel",
            action_id = %handle.id,
            cancelled,
            "Action cancelled"
        );
        cancelled
    }

    /// Run every action already due, without moving the clock.
    pub fn trigger_actions(&self) -> Result<SweepReport> {
        self.sweep(SweepKind::Trigger)
    }

    /// Run every action due at or before `target_ms`, then set the clock to it.
    ///
    /// `target_ms` may be earlier than the current time; already executed
    /// actions are not replayed.
    pub fn advance_time_to(&self, target_ms: u64) -> Result<SweepReport> {
        self.sweep(SweepKind::AdvanceTo(target_ms))
    }

    /// Same as `advance_time_to(now + delay)`.
    pub fn advance_time_by(&self, delay: Duration) -> Result<SweepReport> {
        let delay_ms = duration_ms(delay);
        let now_ms = self.now_ms();
        let target_ms = now_ms
            .checked_add(delay_ms)
            .ok_or(Error::DueTimeOverflow { now_ms, delay_ms })?;
        self.advance_time_to(target_ms)
    }

    /// Advance from one due time to the next until nothing is pending.
    ///
    /// Bounded by the configured iteration limit across all the sweeps, so a
    /// producer that never completes is reported instead of looping forever.
    pub fn run_until_idle(&self) -> Result<SweepReport> {
        let limit = self.config.max_sweep_iterations;
        let mut total = SweepReport {
            now_ms: self.now_ms(),
            ..SweepReport::default()
        };
        while let Some(next_due_ms) = self.next_due_ms() {
            if total.executed >= limit {
                return Err(Error::SweepLimitExceeded {
                    limit,
                    now_ms: self.now_ms(),
                    failures: None,
                });
            }
            let target_ms = next_due_ms.max(self.now_ms());
            total.absorb(self.advance_time_to(target_ms)?);
        }
        Ok(total)
    }

    fn sweep(&self, kind: SweepKind) -> Result<SweepReport> {
        let (start_ms, target_ms) = {
            let mut state = self.lock();
            if state.sweeping {
                return Err(Error::ReentrantSweep);
            }
            state.sweeping = true;
            let target_ms = match kind {
                SweepKind::Trigger => state.now_ms,
                SweepKind::AdvanceTo(target_ms) => target_ms,
            };
            (state.now_ms, target_ms)
        };
        let _guard = SweepGuard {
            state: &*self.state,
        };

        tracing::debug!(
            event = "scheduler.sweep.start",
            kind = kind.label(),
            start_ms,
            target_ms,
            "Sweep started"
        );

        let limit = self.config.max_sweep_iterations;
        let mut report = SweepReport::default();
        let mut failures = Vec::new();

        loop {
            let ran = report.executed + failures.len();
            let next = {
                let mut state = self.lock();
                if ran >= limit && state.has_due(target_ms) {
                    let now_ms = state.now_ms;
                    drop(state);
                    tracing::warn!(
                        event = "scheduler.sweep.limit",
                        limit,
                        now_ms,
                        target_ms,
                        failed = failures.len(),
                        "Sweep iteration limit reached"
                    );
                    return Err(Error::SweepLimitExceeded {
                        limit,
                        now_ms,
                        failures: (!failures.is_empty()).then(|| ActionFailures::new(failures)),
                    });
                }
                state.pop_due(target_ms, &mut report.skipped_cancelled)
            };
            let Some(ScheduledAction {
                id,
                due_ms,
                seq,
                action,
                ..
            }) = next
            else {
                break;
            };

            tracing::trace!(
                event = "scheduler.action.run",
                action_id = %id,
                due_ms,
                %seq,
                "Running action"
            );

            let outcome = panic::catch_unwind(AssertUnwindSafe(action))
                .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())));

            match outcome {
                Ok(()) => report.executed += 1,
                Err(error) => {
                    tracing::warn!(
                        event = "scheduler.action.failed",
                        action_id = %id,
                        due_ms,
                        %seq,
                        error = %format!("{error:#}"),
                        "Scheduled action failed"
                    );
                    failures.push(ActionFailure {
                        id,
                        due_ms,
                        seq,
                        error,
                    });
                    if self.config.error_policy == ErrorPolicy::FailFast {
                        return Err(Error::ActionsFailed(ActionFailures::new(failures)));
                    }
                }
            }
        }

        self.lock().now_ms = target_ms;
        report.now_ms = target_ms;

        tracing::debug!(
            event = "scheduler.sweep.done",
            kind = kind.label(),
            executed = report.executed,
            failed = failures.len(),
            skipped_cancelled = report.skipped_cancelled,
            now_ms = target_ms,
            "Sweep finished"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(Error::ActionsFailed(ActionFailures::new(failures)))
        }
    }

    /// Number of queued actions that have not been cancelled.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().live_entries().count()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.lock().live_entries().next().is_some()
    }

    /// Due time of the earliest non-cancelled action, if any.
    #[must_use]
    pub fn next_due_ms(&self) -> Option<u64> {
        self.lock().live_entries().map(|entry| entry.due_ms).min()
    }

    /// Virtual time remaining until the next action is due.
    #[must_use]
    pub fn time_until_next(&self) -> Option<Duration> {
        let state = self.lock();
        let now_ms = state.now_ms;
        state
            .live_entries()
            .map(|entry| entry.due_ms)
            .min()
            .map(|due_ms| Duration::from_millis(due_ms.saturating_sub(now_ms)))
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualScheduler {
    fn now_ms(&self) -> u64 {
        Self::now_ms(self)
    }
}

impl TimerScheduler for VirtualScheduler {
    type WeakHandle = WeakScheduler;

    fn schedule_action(&self, delay: Duration, action: Action) -> Result<ActionHandle> {
        self.schedule_boxed(duration_ms(delay), action)
    }

    fn downgrade(&self) -> WeakScheduler {
        Self::downgrade(self)
    }

    fn upgrade(weak: &WeakScheduler) -> Option<Self> {
        weak.upgrade()
    }
}

/// Non-owning handle to a [`VirtualScheduler`].
#[derive(Clone)]
pub struct WeakScheduler {
    state: Weak<Mutex<SchedulerState>>,
    config: Arc<SchedulerConfig>,
}

impl WeakScheduler {
    #[must_use]
    pub fn upgrade(&self) -> Option<VirtualScheduler> {
        self.state.upgrade().map(|state| VirtualScheduler {
            state,
            config: Arc::clone(&self.config),
        })
    }
}

impl fmt::Debug for WeakScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakScheduler")
            .field("alive", &(self.state.strong_count() > 0))
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for VirtualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualScheduler")
            .field("now_ms", &state.now_ms)
            .field("seq", &state.seq)
            .field("queued", &state.queue.len())
            .field("sweeping", &state.sweeping)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn panic_error(payload: &(dyn Any + Send)) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow::anyhow!("action panicked: {message}")
}
