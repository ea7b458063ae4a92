//! Error types for the virtual-time scheduler and test probe.

use std::fmt;
use std::time::Duration;

use crate::scheduler::{ActionId, Seq};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by scheduler, probe and producer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("negative delay rejected: {delay_ms}ms")]
    NegativeDelay { delay_ms: i64 },

    #[error("due time overflows the virtual clock (now={now_ms}ms, delay={delay_ms}ms)")]
    DueTimeOverflow { now_ms: u64, delay_ms: u64 },

    #[error("producer period must be non-zero")]
    InvalidPeriod,

    /// `failures` holds any actions that failed earlier in the same sweep.
    #[error(
        "sweep exceeded {limit} actions (clock at {now_ms}ms); runaway rescheduling?{}",
        failure_suffix(.failures.as_ref())
    )]
    SweepLimitExceeded {
        limit: usize,
        now_ms: u64,
        failures: Option<ActionFailures>,
    },

    #[error("a sweep is already in progress on this scheduler")]
    ReentrantSweep,

    #[error("{0}")]
    ActionsFailed(ActionFailures),

    #[error("no terminal event within {0:?}")]
    AwaitTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Failures collected during a sweep, if this is an action failure.
    #[must_use]
    pub const fn action_failures(&self) -> Option<&ActionFailures> {
        match self {
            Self::ActionsFailed(failures)
            | Self::SweepLimitExceeded {
                failures: Some(failures),
                ..
            } => Some(failures),
            _ => None,
        }
    }
}

fn failure_suffix(failures: Option<&ActionFailures>) -> String {
    failures.map_or_else(String::new, |failures| format!(" ({failures})"))
}

/// A single action that returned an error or panicked while running.
#[derive(Debug)]
pub struct ActionFailure {
    pub id: ActionId,
    pub due_ms: u64,
    pub seq: Seq,
    pub error: anyhow::Error,
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action {} (due {}ms, {}) failed: {:#}",
            self.id, self.due_ms, self.seq, self.error
        )
    }
}

/// Every failure from one sweep, in execution order. Never empty.
#[derive(Debug)]
pub struct ActionFailures(Vec<ActionFailure>);

impl ActionFailures {
    pub(crate) fn new(failures: Vec<ActionFailure>) -> Self {
        debug_assert!(!failures.is_empty(), "action failure list must not be empty");
        Self(failures)
    }

    /// The earliest failure of the sweep.
    #[must_use]
    pub fn first(&self) -> &ActionFailure {
        &self.0[0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionFailure> {
        self.0.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<ActionFailure> {
        self.0
    }
}

impl fmt::Display for ActionFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            1 => write!(f, "{}", self.first()),
            n => write!(f, "{n} scheduled actions failed; first: {}", self.first()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: u64, message: &str) -> ActionFailure {
        ActionFailure {
            id: ActionId::new(id),
            due_ms: 20,
            seq: Seq::zero(),
            error: anyhow::anyhow!(message.to_string()),
        }
    }

    #[test]
    fn single_failure_display() {
        let err = Error::ActionsFailed(ActionFailures::new(vec![failure(3, "boom")]));
        assert_eq!(
            err.to_string(),
            "action action:3 (due 20ms, seq:0) failed: boom"
        );
    }

    #[test]
    fn multiple_failures_surface_first() {
        let failures = ActionFailures::new(vec![failure(1, "first"), failure(2, "second")]);
        let err = Error::ActionsFailed(failures);
        let text = err.to_string();
        assert!(text.starts_with("2 scheduled actions failed"), "{text}");
        assert!(text.contains("first"), "{text}");
        assert!(!text.contains("second"), "{text}");
        assert_eq!(err.action_failures().map(ActionFailures::len), Some(2));
    }

    #[test]
    fn sweep_limit_carries_earlier_failures() {
        let err = Error::SweepLimitExceeded {
            limit: 4,
            now_ms: 0,
            failures: Some(ActionFailures::new(vec![failure(1, "disk full")])),
        };
        let text = err.to_string();
        assert!(text.starts_with("sweep exceeded 4 actions"), "{text}");
        assert!(text.contains("disk full"), "{text}");
        assert_eq!(err.action_failures().map(ActionFailures::len), Some(1));

        let bare = Error::SweepLimitExceeded {
            limit: 4,
            now_ms: 0,
            failures: None,
        };
        assert!(bare.action_failures().is_none());
        assert!(bare.to_string().ends_with("runaway rescheduling?"));
    }

    #[test]
    fn non_action_errors_have_no_failures() {
        assert!(Error::ReentrantSweep.action_failures().is_none());
        assert_eq!(
            Error::NegativeDelay { delay_ms: -5 }.to_string(),
            "negative delay rejected: -5ms"
        );
    }
}
