//! Storage boundary for the redemption engine.
//!
//! [`Queries`] is the query contract. It is implemented twice: by the direct
//! store handle, where every call is its own atomic unit, and by the
//! transaction handle returned from [`Store::begin`], where nothing is
//! visible to others until [`Transaction::commit`]. Callers pick the handle;
//! the processor is generic over either.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    DelegationDatum, EventType, Network, Price, Product, ProductToken, Subscription,
    SubscriptionEvent, SubscriptionStatus, Token, Wallet,
};

pub mod memory;

pub use memory::{MemoryStore, Seed};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Errors after which the surrounding transaction cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Fields of an event to append to the subscription log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscriptionEvent {
    pub subscription_id: Uuid,
    pub event_type: EventType,
    pub transaction_hash: Option<String>,
    pub error_message: Option<String>,
    pub amount_in_cents: i64,
    pub occurred_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait Queries: Send {
    async fn get_subscription(&mut self, id: Uuid) -> Result<Subscription, StoreError>;

    /// Active or overdue, not deleted, with `next_redemption_date <= now`.
    async fn list_due_for_redemption(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Add one redemption and its amount, and move the next redemption date,
    /// as a single operation. With `complete` set the status becomes
    /// `Completed` in the same operation.
    ///
    /// Fails with `Conflict` when the subscription is not redeemable or its
    /// term is already fulfilled.
    async fn increment_redemption(
        &mut self,
        id: Uuid,
        amount_in_cents: i64,
        next_redemption_date: DateTime<Utc>,
        complete: bool,
    ) -> Result<Subscription, StoreError>;

    async fn update_status(
        &mut self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<Subscription, StoreError>;

    async fn create_subscription_event(
        &mut self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError>;

    /// Append a `FailedRedemption` event. Never carries a transaction hash.
    async fn create_failed_redemption_event(
        &mut self,
        subscription_id: Uuid,
        amount_in_cents: i64,
        error_message: String,
        occurred_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<SubscriptionEvent, StoreError> {
        self.create_subscription_event(NewSubscriptionEvent {
            subscription_id,
            event_type: EventType::FailedRedemption,
            transaction_hash: None,
            error_message: Some(error_message),
            amount_in_cents,
            occurred_at,
            metadata,
        })
        .await
    }

    /// Events for a subscription in the order they were written.
    async fn list_subscription_events(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionEvent>, StoreError>;

    async fn get_product(&mut self, id: Uuid) -> Result<Product, StoreError>;
    async fn get_price(&mut self, id: Uuid) -> Result<Price, StoreError>;
    async fn get_product_token(&mut self, id: Uuid) -> Result<ProductToken, StoreError>;
    async fn get_token(&mut self, id: Uuid) -> Result<Token, StoreError>;
    async fn get_network(&mut self, id: Uuid) -> Result<Network, StoreError>;
    async fn get_wallet(&mut self, id: Uuid) -> Result<Wallet, StoreError>;
    async fn get_delegation(&mut self, id: Uuid) -> Result<DelegationDatum, StoreError>;
}

/// A store that can also open transactions.
#[async_trait]
pub trait Store: Queries + Clone + Sync + 'static {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

#[async_trait]
pub trait Transaction: Queries {
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard all work. Dropping an uncommitted transaction has the same
    /// effect.
    async fn rollback(self) -> Result<(), StoreError>;
}
