// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policy.
//!
//! Wire errors 5001 (timeout), 5002 (agent unavailable), and 5005
//! (resource limit) are transient and re-dispatch with exponential
//! backoff; everything else fails immediately. Exhausting the budget
//! turns the task terminal with reason `retry_budget_exceeded`.

use std::time::Duration;
use steward_core::WireErrorCode;
use steward_core::config::OrchestratorConfig;

/// What to do about one observed failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-dispatch after this delay; the caller increments the retry
    /// counter exactly once per observed failure.
    RetryAfter(Duration),
    /// The code is non-retryable; fail now.
    FailImmediately,
    /// The budget is exhausted; fail with `retry_budget_exceeded`.
    BudgetExhausted,
}

/// Stateless retry policy derived from configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_seconds: Vec<u64>,
}

impl RetryPolicy {
    /// Build the policy from configuration.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            backoff_seconds: config.retry_backoff_seconds.clone(),
        }
    }

    /// The configured retry budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do about a failure with the given code, given how
    /// many retries the task has already consumed.
    #[must_use]
    pub fn decide(&self, code: WireErrorCode, retries_consumed: u32) -> RetryDecision {
        if !code.is_retryable() {
            return RetryDecision::FailImmediately;
        }
        if retries_consumed >= self.max_attempts {
            return RetryDecision::BudgetExhausted;
        }
        let idx = (retries_consumed as usize).min(self.backoff_seconds.len() - 1);
        RetryDecision::RetryAfter(Duration::from_secs(self.backoff_seconds[idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&OrchestratorConfig::default())
    }

    #[test]
    fn retryable_codes_get_the_backoff_ladder() {
        let policy = policy();
        assert_eq!(
            policy.decide(WireErrorCode::Timeout, 0),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(WireErrorCode::AgentUnavailable, 1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(WireErrorCode::ResourceLimit, 2),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
    }

    #[test]
    fn budget_exhaustion_after_max_attempts() {
        let policy = policy();
        assert_eq!(
            policy.decide(WireErrorCode::Timeout, 3),
            RetryDecision::BudgetExhausted
        );
        assert_eq!(
            policy.decide(WireErrorCode::Timeout, 2),
            RetryDecision::RetryAfter(Duration::from_secs(4)),
            "the third retry is still within budget"
        );
    }

    #[test]
    fn non_retryable_codes_fail_immediately() {
        let policy = policy();
        for code in [
            WireErrorCode::InvalidMessage,
            WireErrorCode::AuthFailed,
            WireErrorCode::UnsupportedWorkType,
            WireErrorCode::UnsupportedProtocolVersion,
        ] {
            assert_eq!(policy.decide(code, 0), RetryDecision::FailImmediately);
        }
    }

    #[test]
    fn backoff_clamps_to_last_step() {
        let mut config = OrchestratorConfig::default();
        config.retry_max_attempts = 6;
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(
            policy.decide(WireErrorCode::Timeout, 5),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
    }
}
