//! Recording observer for assertions in tests.
//!
//! A [`TestProbe`] keeps every notification it receives: values in arrival
//! order, each error, and each completion. It never enforces the
//! single-termination contract itself, so a producer that terminates twice is
//! visible as two recorded terminations.
//!
//! Recording is safe from any thread. [`TestProbe::await_terminal_event`]
//! blocks the caller until a termination is recorded or the timeout elapses.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::observer::{Observer, Subscription};

/// The thread that delivered a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryThread {
    pub id: ThreadId,
    pub name: Option<String>,
}

impl DeliveryThread {
    fn current() -> Self {
        let current = thread::current();
        Self {
            id: current.id(),
            name: current.name().map(str::to_string),
        }
    }
}

struct ProbeLog<T> {
    values: Vec<T>,
    errors: Vec<anyhow::Error>,
    completions: usize,
    last_thread: Option<DeliveryThread>,
    subscription: Option<Subscription>,
}

impl<T> ProbeLog<T> {
    fn terminal_count(&self) -> usize {
        self.errors.len() + self.completions
    }
}

impl<T> Default for ProbeLog<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            errors: Vec::new(),
            completions: 0,
            last_thread: None,
            subscription: None,
        }
    }
}

pub struct TestProbe<T> {
    log: Mutex<ProbeLog<T>>,
    signal: Condvar,
}

impl<T> Default for TestProbe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TestProbe<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Mutex::new(ProbeLog::default()),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProbeLog<T>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, update: impl FnOnce(&mut ProbeLog<T>)) {
        {
            let mut log = self.lock();
            update(&mut log);
            log.last_thread = Some(DeliveryThread::current());
        }
        self.signal.notify_all();
    }

    #[must_use]
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().values.clone()
    }

    #[must_use]
    pub fn value_count(&self) -> usize {
        self.lock().values.len()
    }

    /// Recorded errors, rendered with their full context chain.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.lock()
            .errors
            .iter()
            .map(|error| format!("{error:#}"))
            .collect()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }

    /// Number of completion notifications received.
    #[must_use]
    pub fn completions(&self) -> usize {
        self.lock().completions
    }

    /// Errors plus completions.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.lock().terminal_count()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminal_count() > 0
    }

    /// Thread that delivered the most recent notification.
    #[must_use]
    pub fn last_thread(&self) -> Option<DeliveryThread> {
        self.lock().last_thread.clone()
    }

    #[must_use]
    pub fn subscription(&self) -> Option<Subscription> {
        self.lock().subscription.clone()
    }

    /// Dispose the upstream subscription, if one was received.
    pub fn dispose(&self) {
        if let Some(subscription) = self.subscription() {
            subscription.dispose();
        }
    }

    /// Block until an error or completion has been recorded.
    ///
    /// `None` waits indefinitely. On timeout, returns [`Error::AwaitTimeout`]
    /// and leaves everything recorded so far intact.
    pub fn await_terminal_event(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_until(timeout, |log| log.terminal_count() > 0)
    }

    /// Block until at least `count` values arrived or the stream terminated.
    pub fn await_count(&self, count: usize, timeout: Option<Duration>) -> Result<()> {
        self.wait_until(timeout, |log| {
            log.values.len() >= count || log.terminal_count() > 0
        })
    }

    fn wait_until(
        &self,
        timeout: Option<Duration>,
        ready: impl Fn(&ProbeLog<T>) -> bool,
    ) -> Result<()> {
        let log = self.lock();
        let Some(timeout) = timeout else {
            let _log = self
                .signal
                .wait_while(log, |log| !ready(log))
                .unwrap_or_else(PoisonError::into_inner);
            return Ok(());
        };

        let (_log, wait) = self
            .signal
            .wait_timeout_while(log, timeout, |log| !ready(log))
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() {
            tracing::debug!(
                event = "probe.await.timeout",
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Probe wait timed out"
            );
            return Err(Error::AwaitTimeout(timeout));
        }
        Ok(())
    }

    #[track_caller]
    pub fn assert_no_errors(&self) -> &Self {
        let errors = self.errors();
        assert!(errors.is_empty(), "expected no errors, got {errors:?}");
        self
    }

    /// Exactly one termination, of either kind.
    #[track_caller]
    pub fn assert_terminated_once(&self) -> &Self {
        let log = self.lock();
        let (errors, completions) = (log.errors.len(), log.completions);
        drop(log);
        assert!(
            errors + completions == 1,
            "expected exactly one terminal event, got {completions} completion(s) and {errors} error(s)"
        );
        self
    }

    /// Exactly one completion and no errors.
    #[track_caller]
    pub fn assert_complete(&self) -> &Self {
        self.assert_no_errors();
        let completions = self.completions();
        assert!(
            completions == 1,
            "expected exactly one completion, got {completions}"
        );
        self
    }

    #[track_caller]
    pub fn assert_not_terminated(&self) -> &Self {
        let count = self.terminal_count();
        assert!(count == 0, "expected no terminal event, got {count}");
        self
    }

    /// Exactly one error whose rendered message contains `needle`.
    #[track_caller]
    pub fn assert_error_message(&self, needle: &str) -> &Self {
        let errors = self.errors();
        assert!(
            errors.len() == 1 && errors[0].contains(needle),
            "expected one error containing {needle:?}, got {errors:?}"
        );
        self
    }

    /// The upstream subscription exists and has released its resources.
    #[track_caller]
    pub fn assert_released(&self) -> &Self {
        match self.subscription() {
            Some(subscription) => assert!(
                subscription.is_disposed(),
                "expected the subscription to be released"
            ),
            None => panic!("expected a subscription, but none was received"),
        }
        self
    }

    #[track_caller]
    pub fn assert_values(&self, expected: &[T]) -> &Self
    where
        T: PartialEq + fmt::Debug,
    {
        let log = self.lock();
        assert!(
            log.values.as_slice() == expected,
            "recorded values differ\n  expected: {expected:?}\n  recorded: {:?}",
            log.values
        );
        drop(log);
        self
    }
}

impl<T: Send> Observer<T> for TestProbe<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        let mut log = self.lock();
        log.last_thread = Some(DeliveryThread::current());
        if log.subscription.is_some() {
            drop(log);
            tracing::warn!(
                event = "probe.subscribe.duplicate",
                "Probe already subscribed; disposing the extra subscription"
            );
            subscription.dispose();
            return;
        }
        log.subscription = Some(subscription);
    }

    fn on_next(&self, value: T) {
        self.record(|log| log.values.push(value));
    }

    fn on_error(&self, error: anyhow::Error) {
        self.record(|log| log.errors.push(error));
    }

    fn on_complete(&self) {
        self.record(|log| log.completions += 1);
    }
}

impl<T> fmt::Debug for TestProbe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log = self.lock();
        f.debug_struct("TestProbe")
            .field("values", &log.values.len())
            .field("errors", &log.errors.len())
            .field("completions", &log.completions)
            .field("subscribed", &log.subscription.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn records_values_in_arrival_order() {
        let probe = TestProbe::new();
        probe.on_next(3);
        probe.on_next(1);
        probe.on_next(2);

        assert_eq!(probe.values(), vec![3, 1, 2]);
        probe.assert_values(&[3, 1, 2]).assert_no_errors().assert_not_terminated();
    }

    #[test]
    fn multiple_terminations_are_kept_as_data() {
        let probe = TestProbe::<u8>::new();
        probe.on_complete();
        probe.on_error(anyhow::anyhow!("late error"));
        probe.on_complete();

        assert_eq!(probe.completions(), 2);
        assert_eq!(probe.error_count(), 1);
        assert_eq!(probe.terminal_count(), 3);
        assert_eq!(probe.errors(), vec!["late error".to_string()]);
    }

    #[test]
    #[should_panic(expected = "expected exactly one terminal event, got 2 completion(s)")]
    fn terminated_once_rejects_double_completion() {
        let probe = TestProbe::<u8>::new();
        probe.on_complete();
        probe.on_complete();
        probe.assert_terminated_once();
    }

    #[test]
    #[should_panic(expected = "recorded values differ")]
    fn assert_values_reports_mismatch() {
        let probe = TestProbe::new();
        probe.on_next("a");
        probe.assert_values(&["a", "b"]);
    }

    #[test]
    fn error_chain_is_rendered() {
        let probe = TestProbe::<u8>::new();
        probe.on_error(anyhow::anyhow!("socket closed").context("upstream failed"));
        probe
            .assert_error_message("upstream failed: socket closed")
            .assert_terminated_once();
    }

    #[test]
    fn await_times_out_without_losing_values() {
        let probe = TestProbe::new();
        probe.on_next(7_u32);

        let err = probe
            .await_terminal_event(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::AwaitTimeout(d) if d == Duration::from_millis(20)));
        assert_eq!(probe.values(), vec![7]);
    }

    #[test]
    fn await_returns_immediately_once_terminated() {
        let probe = TestProbe::<u8>::new();
        probe.on_complete();
        let start = Instant::now();
        probe.await_terminal_event(None).unwrap();
        probe.await_terminal_event(Some(Duration::ZERO)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn await_is_released_from_another_thread() {
        let probe = Arc::new(TestProbe::new());
        let producer = Arc::clone(&probe);
        let handle = thread::Builder::new()
            .name("probe-producer".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_millis(10));
                producer.on_next(1_u32);
                producer.on_complete();
            })
            .unwrap();

        probe.await_terminal_event(Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();

        probe.assert_values(&[1]).assert_complete();
        let delivered_by = probe.last_thread().unwrap();
        assert_eq!(delivered_by.name.as_deref(), Some("probe-producer"));
        assert_ne!(delivered_by.id, thread::current().id());
    }

    #[test]
    fn subscribe_counts_as_a_delivery() {
        let probe = Arc::new(TestProbe::<u8>::new());
        assert!(probe.last_thread().is_none());

        let subscriber = Arc::clone(&probe);
        thread::Builder::new()
            .name("subscriber".to_string())
            .spawn(move || subscriber.on_subscribe(Subscription::new()))
            .unwrap()
            .join()
            .unwrap();

        let delivered_by = probe.last_thread().unwrap();
        assert_eq!(delivered_by.name.as_deref(), Some("subscriber"));
        assert!(probe.subscription().is_some());
    }

    #[test]
    fn await_count_waits_for_values() {
        let probe = Arc::new(TestProbe::new());
        let producer = Arc::clone(&probe);
        let handle = thread::spawn(move || {
            for value in 0..3_u32 {
                producer.on_next(value);
            }
        });

        probe.await_count(3, Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();
        assert_eq!(probe.value_count(), 3);
        assert!(!probe.is_terminated());
    }

    #[test]
    fn released_requires_disposed_subscription() {
        let probe = TestProbe::<u8>::new();
        let subscription = Subscription::new();
        probe.on_subscribe(subscription.clone());
        assert!(!subscription.is_disposed());

        probe.dispose();
        probe.assert_released();
    }

    #[test]
    #[should_panic(expected = "expected a subscription")]
    fn released_without_subscription_panics() {
        TestProbe::<u8>::new().assert_released();
    }

    #[test]
    fn duplicate_subscription_is_disposed() {
        let probe = TestProbe::<u8>::new();
        let first = Subscription::new();
        let second = Subscription::new();
        probe.on_subscribe(first.clone());
        probe.on_subscribe(second.clone());

        assert!(!first.is_disposed());
        assert!(second.is_disposed());
    }

    #[test]
    fn debug_summarises_counts() {
        let probe = TestProbe::new();
        probe.on_next(1_u8);
        let debug = format!("{probe:?}");
        assert!(debug.contains("values: 1"), "{debug}");
    }
}
