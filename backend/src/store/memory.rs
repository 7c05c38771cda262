//! In-memory implementation of the store contract.
//!
//! A transaction takes the store's write lock for its whole lifetime and
//! works on a private copy of the tables, so other handles block until it
//! commits or rolls back. Commit publishes the copy; dropping the handle
//! discards it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use super::{NewSubscriptionEvent, Queries, Store, StoreError, Transaction};
use crate::models::{
    DelegationDatum, Network, Price, Product, ProductToken, Subscription, SubscriptionEvent,
    SubscriptionStatus, Token, Wallet,
};

/// Initial contents of a [`MemoryStore`], typically loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub subscriptions: Vec<Subscription>,
    pub events: Vec<SubscriptionEvent>,
    pub products: Vec<Product>,
    pub prices: Vec<Price>,
    pub product_tokens: Vec<ProductToken>,
    pub tokens: Vec<Token>,
    pub networks: Vec<Network>,
    pub wallets: Vec<Wallet>,
    pub delegations: Vec<DelegationDatum>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    subscriptions: HashMap<Uuid, Subscription>,
    events: Vec<SubscriptionEvent>,
    products: HashMap<Uuid, Product>,
    prices: HashMap<Uuid, Price>,
    product_tokens: HashMap<Uuid, ProductToken>,
    tokens: HashMap<Uuid, Token>,
    networks: HashMap<Uuid, Network>,
    wallets: HashMap<Uuid, Wallet>,
    delegations: HashMap<Uuid, DelegationDatum>,
}

fn index<T>(rows: Vec<T>, id: impl Fn(&T) -> Uuid) -> HashMap<Uuid, T> {
    rows.into_iter().map(|row| (id(&row), row)).collect()
}

fn lookup<T: Clone>(
    rows: &HashMap<Uuid, T>,
    entity: &'static str,
    id: Uuid,
) -> Result<T, StoreError> {
    rows.get(&id)
        .cloned()
        .ok_or_else(|| StoreError::not_found(entity, id))
}

impl From<Seed> for Tables {
    fn from(seed: Seed) -> Self {
        Self {
            subscriptions: index(seed.subscriptions, |s| s.id),
            events: seed.events,
            products: index(seed.products, |p| p.id),
            prices: index(seed.prices, |p| p.id),
            product_tokens: index(seed.product_tokens, |p| p.id),
            tokens: index(seed.tokens, |t| t.id),
            networks: index(seed.networks, |n| n.id),
            wallets: index(seed.wallets, |w| w.id),
            delegations: index(seed.delegations, |d| d.id),
        }
    }
}

impl Tables {
    fn live_subscription(&mut self, id: Uuid) -> Result<&mut Subscription, StoreError> {
        self.subscriptions
            .get_mut(&id)
            .filter(|s| s.deleted_at.is_none())
            .ok_or_else(|| StoreError::not_found("subscription", id))
    }

    fn get_subscription(&mut self, id: Uuid) -> Result<Subscription, StoreError> {
        self.live_subscription(id).map(|s| s.clone())
    }

    fn list_due_for_redemption(&self, now: DateTime<Utc>) -> Vec<Subscription> {
        let mut due: Vec<Subscription> = self
            .subscriptions
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_redemption_date, s.id));
        due
    }

    fn increment_redemption(
        &mut self,
        id: Uuid,
        amount_in_cents: i64,
        next_redemption_date: DateTime<Utc>,
        complete: bool,
    ) -> Result<Subscription, StoreError> {
        let sub = self.live_subscription(id)?;
        if !sub.status.is_redeemable() {
            return Err(StoreError::Conflict(format!(
                "subscription {id} is {} and cannot be redeemed",
                sub.status
            )));
        }
        if sub.term_fulfilled() {
            return Err(StoreError::Conflict(format!(
                "subscription {id} already has {} of {:?} redemptions",
                sub.total_redemptions, sub.total_term_length
            )));
        }
        sub.total_redemptions += 1;
        sub.total_amount_in_cents += amount_in_cents;
        sub.next_redemption_date = Some(next_redemption_date);
        if complete {
            sub.status = SubscriptionStatus::Completed;
        }
        sub.updated_at = Utc::now();
        Ok(sub.clone())
    }

    fn update_status(
        &mut self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<Subscription, StoreError> {
        let sub = self.live_subscription(id)?;
        if sub.status.is_terminal() && sub.status != status {
            return Err(StoreError::Conflict(format!(
                "subscription {id} is {} and cannot move to {status}",
                sub.status
            )));
        }
        sub.status = status;
        sub.updated_at = Utc::now();
        Ok(sub.clone())
    }

    fn create_subscription_event(
        &mut self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError> {
        if !self.subscriptions.contains_key(&event.subscription_id) {
            return Err(StoreError::not_found("subscription", event.subscription_id));
        }
        let row = SubscriptionEvent {
            id: Uuid::new_v4(),
            subscription_id: event.subscription_id,
            event_type: event.event_type,
            transaction_hash: event.transaction_hash,
            error_message: event.error_message,
            amount_in_cents: event.amount_in_cents,
            occurred_at: event.occurred_at,
            metadata: event.metadata,
        };
        self.events.push(row.clone());
        Ok(row)
    }

    fn list_subscription_events(&self, subscription_id: Uuid) -> Vec<SubscriptionEvent> {
        self.events
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect()
    }
}

/// Implements [`Queries`] for a handle with an async `access()` yielding the tables.
macro_rules! forward_queries {
    ($ty:ty) => {
        #[async_trait]
        impl Queries for $ty {
            async fn get_subscription(&mut self, id: Uuid) -> Result<Subscription, StoreError> {
                self.access().await.get_subscription(id)
            }

            async fn list_due_for_redemption(
                &mut self,
                now: DateTime<Utc>,
            ) -> Result<Vec<Subscription>, StoreError> {
                Ok(self.access().await.list_due_for_redemption(now))
            }

            async fn increment_redemption(
                &mut self,
                id: Uuid,
                amount_in_cents: i64,
                next_redemption_date: DateTime<Utc>,
                complete: bool,
            ) -> Result<Subscription, StoreError> {
                self.access()
                    .await
                    .increment_redemption(id, amount_in_cents, next_redemption_date, complete)
            }

            async fn update_status(
                &mut self,
                id: Uuid,
                status: SubscriptionStatus,
            ) -> Result<Subscription, StoreError> {
                self.access().await.update_status(id, status)
            }

            async fn create_subscription_event(
                &mut self,
                event: NewSubscriptionEvent,
            ) -> Result<SubscriptionEvent, StoreError> {
                self.access().await.create_subscription_event(event)
            }

            async fn list_subscription_events(
                &mut self,
                subscription_id: Uuid,
            ) -> Result<Vec<SubscriptionEvent>, StoreError> {
                Ok(self.access().await.list_subscription_events(subscription_id))
            }

            async fn get_product(&mut self, id: Uuid) -> Result<Product, StoreError> {
                lookup(&self.access().await.products, "product", id)
            }

            async fn get_price(&mut self, id: Uuid) -> Result<Price, StoreError> {
                lookup(&self.access().await.prices, "price", id)
            }

            async fn get_product_token(&mut self, id: Uuid) -> Result<ProductToken, StoreError> {
                lookup(&self.access().await.product_tokens, "product token", id)
            }

            async fn get_token(&mut self, id: Uuid) -> Result<Token, StoreError> {
                lookup(&self.access().await.tokens, "token", id)
            }

            async fn get_network(&mut self, id: Uuid) -> Result<Network, StoreError> {
                lookup(&self.access().await.networks, "network", id)
            }

            async fn get_wallet(&mut self, id: Uuid) -> Result<Wallet, StoreError> {
                lookup(&self.access().await.wallets, "wallet", id)
            }

            async fn get_delegation(&mut self, id: Uuid) -> Result<DelegationDatum, StoreError> {
                lookup(&self.access().await.delegations, "delegation", id)
            }
        }
    };
}

/// Direct store handle. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn from_seed(seed: Seed) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::from(seed))),
        }
    }

    /// Load a JSON seed document from disk. `~` is expanded.
    pub fn from_seed_file(path: &str) -> Result<Self> {
        let path = shellexpand::tilde(path).to_string();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read seed file {path}"))?;
        let seed: Seed = serde_json::from_str(&raw)
            .with_context(|| format!("invalid seed file {path}"))?;
        Ok(Self::from_seed(seed))
    }
}

impl MemoryStore {
    async fn access(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().await
    }
}

forward_queries!(MemoryStore);

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx { guard, working })
    }
}

/// Transaction handle. Holds the store lock until committed or dropped.
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

impl MemoryTx {
    async fn access(&mut self) -> &mut Tables {
        &mut self.working
    }
}

forward_queries!(MemoryTx);

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTx { mut guard, working } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use crate::testing::Fixture;
    use chrono::Duration;

    fn event(subscription_id: Uuid, now: DateTime<Utc>) -> NewSubscriptionEvent {
        NewSubscriptionEvent {
            subscription_id,
            event_type: EventType::Redeemed,
            transaction_hash: Some("0x1".into()),
            error_message: None,
            amount_in_cents: 100,
            occurred_at: now,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn due_listing_filters_status_date_and_deletion() {
        let now = Fixture::now();
        let mut seed = Fixture::new().seed();
        let template = seed.subscriptions[0].clone();

        let mut future = template.clone();
        future.id = Uuid::new_v4();
        future.next_redemption_date = Some(now + Duration::hours(1));

        let mut canceled = template.clone();
        canceled.id = Uuid::new_v4();
        canceled.status = SubscriptionStatus::Canceled;

        let mut deleted = template.clone();
        deleted.id = Uuid::new_v4();
        deleted.deleted_at = Some(now);

        let mut overdue = template.clone();
        overdue.id = Uuid::new_v4();
        overdue.status = SubscriptionStatus::Overdue;
        overdue.next_redemption_date = Some(now);

        seed.subscriptions.extend([future, canceled, deleted, overdue.clone()]);
        let mut store = MemoryStore::from_seed(seed);

        let due = store.list_due_for_redemption(now).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![template.id, overdue.id]);
    }

    #[tokio::test]
    async fn increment_updates_counters_together() {
        let fixture = Fixture::new();
        let id = fixture.subscription_id;
        let mut store = fixture.store();
        let next = Fixture::now() + Duration::days(30);

        let updated = store
            .increment_redemption(id, 1_500, next, false)
            .await
            .unwrap();
        assert_eq!(updated.total_redemptions, 2);
        assert_eq!(updated.total_amount_in_cents, 3_499);
        assert_eq!(updated.next_redemption_date, Some(next));
        assert_eq!(updated.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn completing_increment_sets_status_in_the_same_write() {
        let mut fixture = Fixture::new();
        let id = fixture.subscription_id;
        fixture.subscription_mut().total_term_length = Some(2);
        let mut store = fixture.store();

        let updated = store
            .increment_redemption(id, 1_999, Fixture::now(), true)
            .await
            .unwrap();
        assert_eq!(updated.total_redemptions, 2);
        assert_eq!(updated.status, SubscriptionStatus::Completed);
        assert_eq!(store.get_subscription(id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn increment_past_the_term_is_a_conflict() {
        let mut fixture = Fixture::new();
        let id = fixture.subscription_id;
        fixture.subscription_mut().total_term_length = Some(1);
        let mut store = fixture.store();

        let err = store
            .increment_redemption(id, 1_999, Fixture::now(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get_subscription(id).await.unwrap().total_redemptions, 1);
    }

    #[tokio::test]
    async fn terminal_status_cannot_change() {
        let fixture = Fixture::new();
        let id = fixture.subscription_id;
        let mut store = fixture.store();

        store.update_status(id, SubscriptionStatus::Completed).await.unwrap();
        let err = store
            .update_status(id, SubscriptionStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .increment_redemption(id, 100, Fixture::now(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn committed_work_is_published() {
        let fixture = Fixture::new();
        let id = fixture.subscription_id;
        let mut store = fixture.store();

        let mut tx = store.begin().await.unwrap();
        tx.update_status(id, SubscriptionStatus::Overdue).await.unwrap();
        tx.create_subscription_event(event(id, Fixture::now())).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.get_subscription(id).await.unwrap().status,
            SubscriptionStatus::Overdue
        );
        assert_eq!(store.list_subscription_events(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rolled_back_or_dropped_work_is_discarded() {
        let fixture = Fixture::new();
        let id = fixture.subscription_id;
        let mut store = fixture.store();

        let mut tx = store.begin().await.unwrap();
        let inside = tx
            .increment_redemption(id, 100, Fixture::now(), false)
            .await
            .unwrap();
        assert_eq!(inside.total_redemptions, 2);
        tx.rollback().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.create_subscription_event(event(id, Fixture::now())).await.unwrap();
        }

        let sub = store.get_subscription(id).await.unwrap();
        assert_eq!(sub.total_redemptions, 1);
        assert_eq!(sub.total_amount_in_cents, 1_999);
        assert!(store.list_subscription_events(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_require_existing_subscription() {
        let mut store = Fixture::new().store();
        let err = store
            .create_subscription_event(event(Uuid::new_v4(), Fixture::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "subscription", .. }));
    }

    #[test]
    fn seed_file_loads_all_tables() {
        let seed = Fixture::new().seed();
        let path = std::env::temp_dir().join(format!("seed-{}.json", Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&seed).unwrap()).unwrap();

        let store = MemoryStore::from_seed_file(path.to_str().unwrap()).unwrap();
        let tables = store.tables.try_lock().unwrap();
        assert_eq!(tables.subscriptions.len(), 1);
        assert_eq!(tables.delegations.len(), 1);
        drop(tables);
        std::fs::remove_file(path).unwrap();
    }
}
