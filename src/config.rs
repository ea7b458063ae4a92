//! Scheduler configuration.
//!
//! Defaults suit almost every test. Overrides come from JSON5 text or from
//! `VTIME_*` environment variables; unknown or malformed environment values
//! fall back to the default rather than failing the test run.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_SWEEP_ITERATIONS: usize = 100_000;

const ENV_EPOCH_MS: &str = "VTIME_EPOCH_MS";
const ENV_MAX_SWEEP_ITERATIONS: &str = "VTIME_MAX_SWEEP_ITERATIONS";
const ENV_ERROR_POLICY: &str = "VTIME_ERROR_POLICY";

/// What a sweep does when a scheduled action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Run the remaining eligible actions, then report every failure.
    #[default]
    Continue,
    /// Stop at the first failure and leave the rest queued.
    FailFast,
}

impl ErrorPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" | "aggregate" | "collect" => Some(Self::Continue),
            "fail-fast" | "fail_fast" | "failfast" | "abort" | "stop" => Some(Self::FailFast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Virtual time the clock starts at.
    pub epoch_ms: u64,
    /// Upper bound on actions executed by a single sweep.
    pub max_sweep_iterations: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            epoch_ms: 0,
            max_sweep_iterations: DEFAULT_MAX_SWEEP_ITERATIONS,
            error_policy: ErrorPolicy::Continue,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with any `VTIME_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(epoch_ms) = lookup(ENV_EPOCH_MS).and_then(|v| v.trim().parse().ok()) {
            config.epoch_ms = epoch_ms;
        }
        if let Some(limit) = lookup(ENV_MAX_SWEEP_ITERATIONS)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|limit| *limit > 0)
        {
            config.max_sweep_iterations = limit;
        }
        if let Some(policy) = lookup(ENV_ERROR_POLICY)
            .as_deref()
            .and_then(ErrorPolicy::parse)
        {
            config.error_policy = policy;
        }
        config
    }

    /// Parse a JSON5 document such as `{ epochMs: 1000, errorPolicy: "fail_fast" }`.
    pub fn from_json5(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text).map_err(|err| Error::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sweep_iterations == 0 {
            return Err(Error::config("maxSweepIterations must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_epoch_ms(mut self, epoch_ms: u64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    #[must_use]
    pub const fn with_max_sweep_iterations(mut self, limit: usize) -> Self {
        self.max_sweep_iterations = limit;
        self
    }

    #[must_use]
    pub const fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.epoch_ms, 0);
        assert_eq!(config.max_sweep_iterations, DEFAULT_MAX_SWEEP_ITERATIONS);
        assert_eq!(config.error_policy, ErrorPolicy::Continue);
    }

    #[test]
    fn env_overrides_apply() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            (ENV_EPOCH_MS, "1500"),
            (ENV_MAX_SWEEP_ITERATIONS, " 64 "),
            (ENV_ERROR_POLICY, "Fail-Fast"),
        ]));
        assert_eq!(config.epoch_ms, 1500);
        assert_eq!(config.max_sweep_iterations, 64);
        assert_eq!(config.error_policy, ErrorPolicy::FailFast);
    }

    #[test]
    fn malformed_env_values_fall_back_to_defaults() {
        let config = SchedulerConfig::from_lookup(lookup_from(&[
            (ENV_EPOCH_MS, "soon"),
            (ENV_MAX_SWEEP_ITERATIONS, "0"),
            (ENV_ERROR_POLICY, "explode"),
        ]));
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn json5_partial_document() {
        let config = SchedulerConfig::from_json5(
            r#"{
                // start a minute in
                epochMs: 60000,
                errorPolicy: "fail_fast",
            }"#,
        )
        .expect("parse config");
        assert_eq!(config.epoch_ms, 60_000);
        assert_eq!(config.error_policy, ErrorPolicy::FailFast);
        assert_eq!(config.max_sweep_iterations, DEFAULT_MAX_SWEEP_ITERATIONS);
    }

    #[test]
    fn json5_rejects_zero_iteration_limit() {
        let err = SchedulerConfig::from_json5("{ maxSweepIterations: 0 }").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[test]
    fn json5_rejects_garbage() {
        let err = SchedulerConfig::from_json5("{ epochMs: ").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }
}
