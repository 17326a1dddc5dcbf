use crate::errors::PipestanceError;
use pipestance_store::FailureKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl RetryBackoffConfig {
    /// Wait before pipestance retry `attempt` (1-based). The initial delay
    /// grows by `backoff_factor` per attempt up to `max_delay_ms`; jitter
    /// scales the result into `[0.5, 1.5)` of itself, seeded per engine.
    pub fn delay(&self, attempt: u32, seed: u64) -> Duration {
        let steps = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let grown = self.initial_delay_ms as f64 * self.backoff_factor.powi(steps);
        let capped = grown.min(self.max_delay_ms as f64).max(0.0);
        let spread = if self.jitter {
            0.5 + unit_interval(seed, attempt)
        } else {
            1.0
        };
        Duration::from_millis((capped * spread).round() as u64)
    }
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// Pipestance-level automatic reset-and-retry budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_auto_retries: u32,
    pub backoff: RetryBackoffConfig,
    /// Regular expressions matched against the failing unit's error text and
    /// stderr. A match marks the failure transient.
    pub transient_patterns: Vec<String>,
}

impl RetryConfig {
    /// Whether another reset-and-retry fits in the budget after `attempts`
    /// retries already made.
    pub fn has_budget(&self, attempts: u32) -> bool {
        attempts < self.max_auto_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_auto_retries: 0,
            backoff: RetryBackoffConfig::default(),
            transient_patterns: Vec::new(),
        }
    }
}

/// Decides whether a failed pipestance is worth an automatic retry.
pub trait FailureClassifier: Send + Sync {
    fn is_transient(&self, kind: FailureKind, message: &str, log_excerpt: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct RegexFailureClassifier {
    patterns: Vec<Regex>,
}

impl RegexFailureClassifier {
    pub fn new<I, S>(patterns: I) -> Result<Self, PipestanceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|err| {
                    PipestanceError::Config(format!(
                        "invalid transient pattern '{}': {err}",
                        pattern.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }
}

impl FailureClassifier for RegexFailureClassifier {
    fn is_transient(&self, kind: FailureKind, message: &str, log_excerpt: &str) -> bool {
        if kind == FailureKind::Assert {
            return false;
        }
        self.patterns
            .iter()
            .any(|pattern| pattern.is_match(message) || pattern.is_match(log_excerpt))
    }
}

/// Splitmix64 finalizer over the seed and attempt, mapped into `[0, 1)`.
fn unit_interval(seed: u64, attempt: u32) -> f64 {
    let mut z = seed.wrapping_add(u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
