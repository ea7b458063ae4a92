//! Time-driven producers that schedule all their work on a [`TimerScheduler`].
//!
//! Under a [`crate::VirtualScheduler`] nothing is emitted until the test moves
//! the clock, which makes these producers fully deterministic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::observer::{Observer, Subscription};
use crate::scheduler::TimerScheduler;

/// Emit `0, 1, 2, ...` every `period`, the first value one period after
/// subscription. Periods under one millisecond are rejected.
pub fn interval<S: TimerScheduler>(scheduler: &S, period: Duration) -> Result<Interval<S>> {
    if period.as_millis() == 0 {
        return Err(Error::InvalidPeriod);
    }
    Ok(Interval {
        scheduler: scheduler.clone(),
        period,
        limit: None,
    })
}

/// Emit `value` once after `delay`, then complete.
pub fn timer<S: TimerScheduler, T>(scheduler: &S, delay: Duration, value: T) -> Timer<S, T> {
    Timer {
        scheduler: scheduler.clone(),
        delay,
        value,
    }
}

#[derive(Debug, Clone)]
pub struct Interval<S> {
    scheduler: S,
    period: Duration,
    limit: Option<u64>,
}

impl<S: TimerScheduler> Interval<S> {
    /// Complete after `count` values and release the subscription.
    #[must_use]
    pub fn take(mut self, count: u64) -> Self {
        self.limit = Some(count);
        self
    }

    pub fn subscribe<O>(self, observer: O) -> Result<Subscription>
    where
        O: Observer<u64> + 'static,
    {
        let subscription = Subscription::new();
        observer.on_subscribe(subscription.clone());

        if self.limit == Some(0) {
            observer.on_complete();
            subscription.dispose();
            return Ok(subscription);
        }

        let state = Arc::new(IntervalState {
            scheduler: self.scheduler.downgrade(),
            period: self.period,
            limit: self.limit,
            emitted: AtomicU64::new(0),
            observer,
            subscription: subscription.clone(),
        });
        if let Err(err) = state.schedule_next(&self.scheduler) {
            subscription.dispose();
            return Err(err);
        }
        Ok(subscription)
    }
}

// Queued ticks own this state, so it holds the scheduler weakly.
struct IntervalState<S: TimerScheduler, O> {
    scheduler: S::WeakHandle,
    period: Duration,
    limit: Option<u64>,
    emitted: AtomicU64,
    observer: O,
    subscription: Subscription,
}

impl<S, O> IntervalState<S, O>
where
    S: TimerScheduler,
    O: Observer<u64> + 'static,
{
    fn schedule_next(self: &Arc<Self>, scheduler: &S) -> Result<()> {
        let next = Arc::clone(self);
        let handle = scheduler.schedule_action(self.period, Box::new(move || next.tick()))?;
        self.subscription.set_pending(handle);
        Ok(())
    }

    fn tick(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.subscription.is_disposed() {
            return Ok(());
        }
        let Some(scheduler) = S::upgrade(&self.scheduler) else {
            self.subscription.dispose();
            return Ok(());
        };

        let value = self.emitted.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(
            event = "source.interval.tick",
            value,
            now_ms = scheduler.now_ms(),
            "Interval tick"
        );
        self.observer.on_next(value);

        if self.limit.is_some_and(|limit| value + 1 >= limit) {
            self.observer.on_complete();
            self.subscription.dispose();
            return Ok(());
        }
        if self.subscription.is_disposed() {
            return Ok(());
        }
        if let Err(err) = self.schedule_next(&scheduler) {
            self.subscription.dispose();
            self.observer.on_error(anyhow::Error::new(err).context("interval reschedule failed"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Timer<S, T> {
    scheduler: S,
    delay: Duration,
    value: T,
}

impl<S: TimerScheduler, T: Send + 'static> Timer<S, T> {
    pub fn subscribe<O>(self, observer: O) -> Result<Subscription>
    where
        O: Observer<T> + 'static,
    {
        let subscription = Subscription::new();
        observer.on_subscribe(subscription.clone());

        let fired = subscription.clone();
        let Self { scheduler, delay, value } = self;
        let scheduled = scheduler.schedule_action(
            delay,
            Box::new(move || {
                if !fired.is_disposed() {
                    observer.on_next(value);
                    observer.on_complete();
                    fired.dispose();
                }
                Ok(())
            }),
        );
        match scheduled {
            Ok(handle) => subscription.set_pending(handle),
            Err(err) => {
                subscription.dispose();
                return Err(err);
            }
        }
        Ok(subscription)
    }
}
