//! Per-subscription redemption state machine.
//!
//! Every call starts with the idempotency gate: the subscription is
//! re-fetched through the caller's query handle and compared against `now`,
//! so overlapping or retried runs never redeem the same period twice.
//! Only then is the delegation redeemed and the outcome applied: counters
//! and the next redemption date move together, the status changes only on
//! the final payment, and exactly one event is appended.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::executor::{ExecutionParams, RedemptionError, token_amount};
use crate::metrics::Metrics;
use crate::models::{
    DelegationDatum, EventType, Network, Price, Subscription, SubscriptionStatus, Token, Wallet,
};
use crate::period;
use crate::redeemer::RetryingRedeemer;
use crate::store::{NewSubscriptionEvent, Queries, StoreError};

/// Status applied when the final payment of a fixed-term subscription fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalFailureStatus {
    #[default]
    Overdue,
    Failed,
}

impl FromStr for FinalFailureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overdue" => Ok(Self::Overdue),
            "failed" => Ok(Self::Failed),
            other => Err(format!("expected `overdue` or `failed`, got `{other}`")),
        }
    }
}

impl From<FinalFailureStatus> for SubscriptionStatus {
    fn from(value: FinalFailureStatus) -> Self {
        match value {
            FinalFailureStatus::Overdue => SubscriptionStatus::Overdue,
            FinalFailureStatus::Failed => SubscriptionStatus::Failed,
        }
    }
}

/// What happened to one subscription in one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Redeemed {
        transaction_hash: String,
        next_redemption: DateTime<Utc>,
    },
    /// The final payment succeeded and the subscription is complete.
    Completed { transaction_hash: String },
    Failed { error: String },
    /// Funds moved on-chain but the subscription could not be updated.
    /// Needs reconciliation.
    BookkeepingFailed {
        transaction_hash: String,
        error: String,
    },
    AlreadyCompleted,
    AlreadyFailed,
    /// Another run already redeemed this period.
    AlreadyAdvanced { next_redemption: DateTime<Utc> },
    /// Not in a redeemable status.
    Skipped { status: SubscriptionStatus },
}

/// Everything a redemption needs besides the subscription row.
#[derive(Debug, Clone)]
pub struct ResolvedSubscription {
    pub price: Price,
    pub merchant_wallet: Wallet,
    pub token: Token,
    pub network: Network,
    pub delegation: DelegationDatum,
}

/// Load the catalogue, wallet and delegation rows a subscription points at.
pub async fn resolve<Q: Queries + ?Sized>(
    queries: &mut Q,
    subscription: &Subscription,
) -> Result<ResolvedSubscription, StoreError> {
    let price = queries.get_price(subscription.price_id).await?;
    let product = queries.get_product(subscription.product_id).await?;
    let merchant_wallet = queries.get_wallet(product.wallet_id).await?;
    let product_token = queries
        .get_product_token(subscription.product_token_id)
        .await?;
    let token = queries.get_token(product_token.token_id).await?;
    let network = queries.get_network(product_token.network_id).await?;
    let delegation = queries.get_delegation(subscription.delegation_id).await?;

    Ok(ResolvedSubscription {
        price,
        merchant_wallet,
        token,
        network,
        delegation,
    })
}

#[derive(Clone)]
pub struct SubscriptionProcessor {
    redeemer: RetryingRedeemer,
    final_failure_status: FinalFailureStatus,
    metrics: Arc<Metrics>,
}

impl SubscriptionProcessor {
    pub fn new(
        redeemer: RetryingRedeemer,
        final_failure_status: FinalFailureStatus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            redeemer,
            final_failure_status,
            metrics,
        }
    }

    /// Process one subscription against the given query handle.
    ///
    /// Redemption failures are reported through the outcome. `Err` is
    /// returned only for store errors that stop this unit of work.
    #[instrument(skip_all, fields(subscription_id = %id))]
    pub async fn process<Q: Queries + ?Sized>(
        &self,
        queries: &mut Q,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, StoreError> {
        let subscription = queries.get_subscription(id).await?;

        if let Some(outcome) = idempotency_gate(&subscription, now) {
            info!(?outcome, "Skipping subscription");
            return Ok(outcome);
        }

        if subscription.term_fulfilled() {
            warn!(
                total_redemptions = subscription.total_redemptions,
                term = ?subscription.total_term_length,
                "Term already fulfilled, completing without redemption"
            );
            queries
                .update_status(id, SubscriptionStatus::Completed)
                .await?;
            return Ok(ProcessOutcome::AlreadyCompleted);
        }

        let resolved = match resolve(queries, &subscription).await {
            Ok(resolved) => resolved,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let message = format!("failed to resolve subscription references: {e}");
                return self
                    .reject(queries, &subscription, 0, message, now)
                    .await;
            }
        };

        let amount_in_cents = resolved.price.unit_amount_in_pennies;
        let Some(amount) = token_amount(amount_in_cents, resolved.token.decimals) else {
            let message = format!(
                "cannot convert {amount_in_cents} cents to {} units",
                resolved.token.symbol
            );
            return self
                .reject(queries, &subscription, amount_in_cents, message, now)
                .await;
        };

        let payload = match resolved.delegation.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                let message = format!("failed to encode delegation: {e}");
                return self
                    .reject(queries, &subscription, amount_in_cents, message, now)
                    .await;
            }
        };

        let params = ExecutionParams {
            merchant_address: resolved.merchant_wallet.wallet_address.clone(),
            token_contract_address: resolved.token.contract_address.clone(),
            token_decimals: resolved.token.decimals,
            amount,
            chain_id: resolved.network.chain_id,
            network_name: resolved.network.name.clone(),
        };
        let is_final = subscription.is_final_payment();

        self.metrics.record_attempt();
        let start = Instant::now();

        match self.redeemer.redeem(id, &payload, &params).await {
            Ok(tx_hash) => {
                self.metrics
                    .record_redemption(start.elapsed().as_millis() as u64);
                self.apply_success(queries, &subscription, &resolved, tx_hash, is_final, now)
                    .await
            }
            Err(err) => {
                self.metrics.record_failure();
                self.apply_failure(queries, &subscription, amount_in_cents, err, is_final, now)
                    .await
            }
        }
    }

    async fn apply_success<Q: Queries + ?Sized>(
        &self,
        queries: &mut Q,
        subscription: &Subscription,
        resolved: &ResolvedSubscription,
        tx_hash: String,
        is_final: bool,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, StoreError> {
        let id = subscription.id;
        let amount_in_cents = resolved.price.unit_amount_in_pennies;
        let next_redemption = period::next_redemption(resolved.price.interval_type, now);

        let booked = queries
            .increment_redemption(id, amount_in_cents, next_redemption, is_final)
            .await;

        if let Err(e) = booked {
            self.metrics.record_bookkeeping_failure();
            error!(
                tx_hash = %tx_hash,
                error = %e,
                "Redemption succeeded on-chain but the subscription was not updated; reconciliation required"
            );
            if e.is_fatal() {
                return Err(e);
            }
            let message = format!("redemption {tx_hash} succeeded but bookkeeping failed: {e}");
            queries
                .create_failed_redemption_event(
                    id,
                    amount_in_cents,
                    message.clone(),
                    now,
                    serde_json::json!({
                        "transaction_hash": tx_hash,
                        "reconciliation_required": true,
                        "is_final": is_final,
                    }),
                )
                .await?;
            return Ok(ProcessOutcome::BookkeepingFailed {
                transaction_hash: tx_hash,
                error: message,
            });
        }

        let event_type = if is_final {
            EventType::Completed
        } else {
            EventType::Redeemed
        };
        queries
            .create_subscription_event(NewSubscriptionEvent {
                subscription_id: id,
                event_type,
                transaction_hash: Some(tx_hash.clone()),
                error_message: None,
                amount_in_cents,
                occurred_at: now,
                metadata: serde_json::json!({
                    "next_redemption": next_redemption,
                    "is_final": is_final,
                }),
            })
            .await?;

        let explorer = resolved.network.explorer_url(&tx_hash);
        if is_final {
            self.metrics.record_completion();
            info!(tx_hash = %tx_hash, explorer = ?explorer, "Final payment redeemed, subscription completed");
            Ok(ProcessOutcome::Completed {
                transaction_hash: tx_hash,
            })
        } else {
            info!(
                tx_hash = %tx_hash,
                next_redemption = %next_redemption,
                explorer = ?explorer,
                "Subscription redeemed"
            );
            Ok(ProcessOutcome::Redeemed {
                transaction_hash: tx_hash,
                next_redemption,
            })
        }
    }

    async fn apply_failure<Q: Queries + ?Sized>(
        &self,
        queries: &mut Q,
        subscription: &Subscription,
        amount_in_cents: i64,
        err: RedemptionError,
        is_final: bool,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, StoreError> {
        let id = subscription.id;
        let mut status = subscription.status;

        if is_final {
            let target = SubscriptionStatus::from(self.final_failure_status);
            match queries.update_status(id, target).await {
                Ok(updated) => status = updated.status,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, to = %target, "Failed to update status after final payment failure"),
            }
        }

        error!(
            error = %err,
            permanent = err.is_permanent(),
            is_final,
            status = %status,
            "Redemption failed"
        );

        queries
            .create_failed_redemption_event(
                id,
                amount_in_cents,
                err.to_string(),
                now,
                serde_json::json!({
                    "is_final": is_final,
                    "permanent": err.is_permanent(),
                    "status": status,
                }),
            )
            .await?;

        Ok(ProcessOutcome::Failed {
            error: err.to_string(),
        })
    }

    /// Record a failure detected before anything was sent for redemption.
    async fn reject<Q: Queries + ?Sized>(
        &self,
        queries: &mut Q,
        subscription: &Subscription,
        amount_in_cents: i64,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, StoreError> {
        error!(error = %message, "Cannot redeem subscription");
        self.metrics.record_failure();
        queries
            .create_subscription_event(NewSubscriptionEvent {
                subscription_id: subscription.id,
                event_type: EventType::FailedValidation,
                transaction_hash: None,
                error_message: Some(message.clone()),
                amount_in_cents,
                occurred_at: now,
                metadata: serde_json::json!({ "stage": "preparation" }),
            })
            .await?;
        Ok(ProcessOutcome::Failed { error: message })
    }
}

/// Short-circuit outcome for a subscription that must not be redeemed now.
fn idempotency_gate(subscription: &Subscription, now: DateTime<Utc>) -> Option<ProcessOutcome> {
    match subscription.status {
        SubscriptionStatus::Completed => return Some(ProcessOutcome::AlreadyCompleted),
        SubscriptionStatus::Failed => return Some(ProcessOutcome::AlreadyFailed),
        _ => {}
    }

    if let Some(next) = subscription.next_redemption_date {
        if next > now {
            return Some(ProcessOutcome::AlreadyAdvanced {
                next_redemption: next,
            });
        }
    }

    if !subscription.status.is_redeemable() {
        return Some(ProcessOutcome::Skipped {
            status: subscription.status,
        });
    }

    None
}
