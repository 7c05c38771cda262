//! Periodic transactional batch runs.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::runner::DueBatchRunner;
use crate::store::Store;

/// Run `process_due` every `period` until `shutdown` flips to `true` or its
/// sender is dropped.
///
/// A tick is skipped while another batch run, scheduled or triggered over
/// HTTP, is still in progress.
pub async fn run_scheduler<S: Store>(
    runner: Arc<DueBatchRunner<S>>,
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = period.as_secs(), "Batch scheduler started");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if metrics.runs_in_progress() > 0 {
                    warn!("Previous batch still running, skipping tick");
                    continue;
                }
                match runner.process_due(Utc::now()).await {
                    Ok(result) => info!(?result, "Scheduled batch finished"),
                    Err(e) => error!(error = %e, "Scheduled batch failed"),
                }
            }
        }
    }

    info!("Batch scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{FinalFailureStatus, SubscriptionProcessor};
    use crate::redeemer::{RetryPolicy, RetryingRedeemer};
    use crate::store::MemoryStore;
    use crate::testing::{Fixture, MockExecutor};
    use chrono::Duration as ChronoDuration;

    fn setup(executor: Arc<MockExecutor>) -> (Arc<DueBatchRunner<MemoryStore>>, Arc<Metrics>) {
        let mut fixture = Fixture::new();
        fixture.subscription_mut().next_redemption_date = Some(Utc::now() - ChronoDuration::days(1));
        let metrics = Arc::new(Metrics::new());
        let processor = SubscriptionProcessor::new(
            RetryingRedeemer::new(executor, RetryPolicy::default()),
            FinalFailureStatus::Overdue,
            metrics.clone(),
        );
        let runner = DueBatchRunner::new(fixture.store(), processor, metrics.clone(), None);
        (Arc::new(runner), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_runs_a_batch_and_shutdown_stops_the_loop() {
        let executor = MockExecutor::succeeding();
        let (runner, metrics) = setup(executor.clone());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_scheduler(
            runner,
            metrics.clone(),
            Duration::from_secs(60),
            rx,
        ));
        tokio::time::sleep(Duration::from_secs(90)).await;

        // The second tick found nothing due.
        assert_eq!(executor.call_count(), 1);
        assert_eq!(metrics.to_json()["runs_started"], 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_stops_the_loop() {
        let executor = MockExecutor::succeeding();
        let (runner, metrics) = setup(executor);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_scheduler(
            runner,
            metrics,
            Duration::from_secs(60),
            rx,
        ));
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop once the sender is gone")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_skipped_while_a_run_is_active() {
        let executor = MockExecutor::succeeding();
        let (runner, metrics) = setup(executor.clone());
        let (tx, rx) = watch::channel(false);

        let busy = metrics.start_run();
        let handle = tokio::spawn(run_scheduler(
            runner,
            metrics.clone(),
            Duration::from_secs(60),
            rx,
        ));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(executor.call_count(), 0);

        drop(busy);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(executor.call_count(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
