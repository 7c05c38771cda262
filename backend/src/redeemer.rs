//! Bounded retry around a single delegation redemption.
//!
//! Waits grow exponentially between attempts with uniform jitter and are
//! capped at [`RetryPolicy::max_backoff`]. Permanent failures stop the loop
//! immediately.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::{DelegationExecutor, ExecutionParams, RedemptionError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    /// Uniform jitter as a fraction of the wait, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-indexed), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// [`Self::backoff`] with jitter applied, never above `max_backoff`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread).min(self.max_backoff)
    }
}

/// Redeems a delegation through the executor, retrying transient failures.
#[derive(Clone)]
pub struct RetryingRedeemer {
    executor: Arc<dyn DelegationExecutor>,
    policy: RetryPolicy,
}

impl RetryingRedeemer {
    pub fn new(executor: Arc<dyn DelegationExecutor>, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    /// Returns the transaction hash, or the last error once attempts run out
    /// or a permanent error is seen.
    pub async fn redeem(
        &self,
        subscription_id: Uuid,
        delegation: &[u8],
        params: &ExecutionParams,
    ) -> Result<String, RedemptionError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.jittered(attempt - 1);
                warn!(
                    %subscription_id,
                    attempt = attempt + 1,
                    delay = ?delay,
                    "Retrying redemption"
                );
                tokio::time::sleep(delay).await;
            }

            match self.executor.redeem(delegation, params).await {
                Ok(tx_hash) => {
                    info!(%subscription_id, attempt = attempt + 1, tx_hash = %tx_hash, "Delegation redeemed");
                    return Ok(tx_hash);
                }
                Err(e) if e.is_permanent() => {
                    warn!(
                        %subscription_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Permanent redemption failure, not retrying"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        %subscription_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Transient redemption failure"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RedemptionError::Transient("no redemption attempt was made".into())))
    }
}
