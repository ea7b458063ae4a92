//! Common test infrastructure for the integration suites.
//!
//! - One-time `tracing` setup (`RUST_LOG` controls verbosity, default `warn`)
//! - A small harness that owns the test's scheduler and logs test phases

use std::sync::{Arc, Mutex, Once};
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use vtime::{SchedulerConfig, VirtualScheduler};

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Per-test harness: a fresh scheduler plus phase logging.
#[allow(dead_code)]
pub struct TestHarness {
    name: String,
    scheduler: VirtualScheduler,
    started: Instant,
}

#[allow(dead_code)]
impl TestHarness {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, SchedulerConfig::from_env())
    }

    pub fn with_config(name: impl Into<String>, config: SchedulerConfig) -> Self {
        init_tracing();
        let name = name.into();
        tracing::info!(test = %name, ?config, "Test started");
        Self {
            name,
            scheduler: VirtualScheduler::with_config(config).expect("valid scheduler config"),
            started: Instant::now(),
        }
    }

    pub const fn scheduler(&self) -> &VirtualScheduler {
        &self.scheduler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log a test section start (useful for organizing multi-phase tests).
    pub fn section(&self, name: &str) {
        tracing::info!(
            test = %self.name,
            now_ms = self.scheduler.now_ms(),
            "=== {name} ==="
        );
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        tracing::debug!(
            test = %self.name,
            elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Test finished"
        );
    }
}

/// Execution log shared between a test and the actions it schedules.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

#[allow(dead_code)]
impl Trace {
    /// An action that appends `label` when it runs.
    pub fn record(&self, label: &str) -> impl FnOnce() -> anyhow::Result<()> + Send + 'static {
        let trace = self.clone();
        let label = label.to_string();
        move || {
            trace.push(label);
            Ok(())
        }
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("trace lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("trace lock").clone()
    }
}
