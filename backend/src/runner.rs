//! Batch redemption of due subscriptions.
//!
//! Two entry points share the per-subscription algorithm:
//!
//! - [`DueBatchRunner::process_due`] holds one transaction across the whole
//!   batch, including every call to the executor, and commits once at the
//!   end. A store failure that breaks the transaction rolls back the entire
//!   batch; a failed redemption does not.
//! - [`DueBatchRunner::redeem_due`] and [`DueBatchRunner::redeem_ids`] use
//!   the direct store handle, so each subscription's changes stand on their
//!   own.
//!
//! Subscriptions are processed one at a time. Overlapping runs are not
//! locked out; the processor's idempotency gate keeps them from redeeming
//! the same period twice.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::models::SubscriptionEvent;
use crate::processor::{ProcessOutcome, SubscriptionProcessor};
use crate::store::{Queries, Store, StoreError, Transaction};

/// Per-run counters. Every processed subscription lands in at most one of
/// `succeeded`, `failed` or `completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub completed: u32,
}

impl RunResult {
    pub fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Redeemed { .. } | ProcessOutcome::AlreadyAdvanced { .. } => {
                self.succeeded += 1
            }
            ProcessOutcome::Completed { .. } | ProcessOutcome::AlreadyCompleted => {
                self.completed += 1
            }
            ProcessOutcome::Failed { .. }
            | ProcessOutcome::BookkeepingFailed { .. }
            | ProcessOutcome::AlreadyFailed => self.failed += 1,
            ProcessOutcome::Skipped { .. } => {}
        }
    }
}

/// Infrastructure failure that aborted a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to list due subscriptions: {0}")]
    Scan(#[source] StoreError),
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("batch aborted at subscription {subscription_id}: {source}")]
    Aborted {
        subscription_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] StoreError),
    #[error("batch exceeded its deadline of {0:?} and was rolled back")]
    DeadlineExceeded(Duration),
}

pub struct DueBatchRunner<S: Store> {
    store: S,
    processor: SubscriptionProcessor,
    metrics: Arc<Metrics>,
    batch_timeout: Option<Duration>,
}

impl<S: Store> DueBatchRunner<S> {
    pub fn new(
        store: S,
        processor: SubscriptionProcessor,
        metrics: Arc<Metrics>,
        batch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            processor,
            metrics,
            batch_timeout,
        }
    }

    /// Redeem every due subscription inside a single transaction.
    #[instrument(skip(self))]
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<RunResult, RunError> {
        let _run = self.metrics.start_run();

        let result = match self.batch_timeout {
            Some(limit) => tokio::time::timeout(limit, self.process_due_in_tx(now))
                .await
                .unwrap_or(Err(RunError::DeadlineExceeded(limit))),
            None => self.process_due_in_tx(now).await,
        };

        match &result {
            Ok(result) => info!(?result, "Transactional batch committed"),
            Err(e) => {
                self.metrics.record_run_failure();
                error!(error = %e, "Transactional batch rolled back");
            }
        }
        result
    }

    async fn process_due_in_tx(&self, now: DateTime<Utc>) -> Result<RunResult, RunError> {
        let mut direct = self.store.clone();
        let due = direct
            .list_due_for_redemption(now)
            .await
            .map_err(RunError::Scan)?;
        if due.is_empty() {
            info!("No subscriptions due");
            return Ok(RunResult::default());
        }
        info!(count = due.len(), "Processing due subscriptions");

        let mut tx = self.store.begin().await.map_err(RunError::Begin)?;
        let mut result = RunResult::default();

        for subscription in &due {
            result.total += 1;
            match self.processor.process(&mut tx, subscription.id, now).await {
                Ok(outcome) => result.record(&outcome),
                Err(e) if e.is_fatal() => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Rollback failed");
                    }
                    return Err(RunError::Aborted {
                        subscription_id: subscription.id,
                        source: e,
                    });
                }
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Failed to process subscription");
                    result.failed += 1;
                }
            }
        }

        tx.commit().await.map_err(RunError::Commit)?;
        Ok(result)
    }

    /// Redeem every due subscription, committing each one independently.
    #[instrument(skip(self))]
    pub async fn redeem_due(&self, now: DateTime<Utc>) -> Result<RunResult, RunError> {
        let _run = self.metrics.start_run();
        let mut direct = self.store.clone();
        let due = direct
            .list_due_for_redemption(now)
            .await
            .map_err(|e| {
                self.metrics.record_run_failure();
                RunError::Scan(e)
            })?;

        let ids: Vec<Uuid> = due.iter().map(|s| s.id).collect();
        let result = self.redeem_each(&ids, now).await;
        info!(?result, "Non-transactional batch finished");
        Ok(result)
    }

    /// Redeem an explicit list of subscriptions, committing each one
    /// independently. Unknown ids count as failed.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn redeem_ids(&self, ids: &[Uuid], now: DateTime<Utc>) -> RunResult {
        let _run = self.metrics.start_run();
        let result = self.redeem_each(ids, now).await;
        info!(?result, "Manual redemption finished");
        result
    }

    /// Redeem one subscription through the same idempotency gate.
    pub async fn redeem_one(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, StoreError> {
        let mut direct = self.store.clone();
        self.processor.process(&mut direct, id, now).await
    }

    /// The audit log of one subscription.
    pub async fn events(&self, id: Uuid) -> Result<Vec<SubscriptionEvent>, StoreError> {
        let mut direct = self.store.clone();
        direct.get_subscription(id).await?;
        direct.list_subscription_events(id).await
    }

    async fn redeem_each(&self, ids: &[Uuid], now: DateTime<Utc>) -> RunResult {
        let mut direct = self.store.clone();
        let mut result = RunResult::default();

        for &id in ids {
            result.total += 1;
            match self.processor.process(&mut direct, id, now).await {
                Ok(outcome) => result.record(&outcome),
                Err(e) => {
                    error!(subscription_id = %id, error = %e, "Failed to process subscription");
                    result.failed += 1;
                }
            }
        }
        result
    }
}
