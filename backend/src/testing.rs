//! Test fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::executor::{DelegationExecutor, ExecutionParams, RedemptionError};
use crate::models::{
    DelegationDatum, IntervalType, Network, Price, PriceType, Product, ProductToken,
    Subscription, SubscriptionEvent, SubscriptionStatus, Token, Wallet,
};
use crate::store::{
    MemoryStore, NewSubscriptionEvent, Queries, Seed, Store, StoreError, Transaction,
};

/// A fully resolvable subscription graph: one monthly subscription that
/// became due yesterday, priced at 19.99 in a 6-decimal stablecoin.
pub struct Fixture {
    pub subscription_id: Uuid,
    seed: Seed,
}

impl Fixture {
    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    pub fn new() -> Self {
        let now = Self::now();
        let network = Network {
            id: Uuid::new_v4(),
            name: "base-sepolia".into(),
            chain_id: 84532,
            explorer_url: Some("https://sepolia.basescan.org".into()),
        };
        let token = Token {
            id: Uuid::new_v4(),
            network_id: network.id,
            name: "USD Coin".into(),
            symbol: "USDC".into(),
            contract_address: "0xusdc".into(),
            decimals: 6,
        };
        let wallet = Wallet {
            id: Uuid::new_v4(),
            wallet_address: "0xmerchant".into(),
            network_type: "evm".into(),
        };
        let product = Product {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            wallet_id: wallet.id,
            name: "Pro plan".into(),
            active: true,
        };
        let price = Price {
            id: Uuid::new_v4(),
            product_id: product.id,
            price_type: PriceType::Recurring,
            currency: "USD".into(),
            unit_amount_in_pennies: 1_999,
            interval_type: IntervalType::Monthly,
            term_length: Some(12),
            active: true,
        };
        let product_token = ProductToken {
            id: Uuid::new_v4(),
            product_id: product.id,
            network_id: network.id,
            token_id: token.id,
            active: true,
        };
        let delegation = DelegationDatum {
            id: Uuid::new_v4(),
            delegate: "0xplatform".into(),
            delegator: "0xcustomer".into(),
            authority: "0xroot".into(),
            caveats: vec![],
            salt: "0x01".into(),
            signature: "0xsigned".into(),
            created_at: now - Duration::days(60),
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            product_id: product.id,
            price_id: price.id,
            product_token_id: product_token.id,
            delegation_id: delegation.id,
            customer_wallet_id: None,
            status: SubscriptionStatus::Active,
            current_period_start: now - Duration::days(31),
            current_period_end: now + Duration::days(334),
            next_redemption_date: Some(now - Duration::days(1)),
            total_redemptions: 1,
            total_amount_in_cents: 1_999,
            total_term_length: None,
            metadata: serde_json::json!({}),
            created_at: now - Duration::days(31),
            updated_at: now - Duration::days(31),
            deleted_at: None,
        };

        Self {
            subscription_id: subscription.id,
            seed: Seed {
                subscriptions: vec![subscription],
                products: vec![product],
                prices: vec![price],
                product_tokens: vec![product_token],
                tokens: vec![token],
                networks: vec![network],
                wallets: vec![wallet],
                delegations: vec![delegation],
                ..Seed::default()
            },
        }
    }

    pub fn subscription_mut(&mut self) -> &mut Subscription {
        &mut self.seed.subscriptions[0]
    }

    pub fn price_mut(&mut self) -> &mut Price {
        &mut self.seed.prices[0]
    }

    pub fn token_mut(&mut self) -> &mut Token {
        &mut self.seed.tokens[0]
    }

    /// Add another due subscription sharing the catalogue, with its own
    /// delegation signed by `delegator`.
    pub fn add_subscription(&mut self, delegator: &str) -> Uuid {
        let mut delegation = self.seed.delegations[0].clone();
        delegation.id = Uuid::new_v4();
        delegation.delegator = delegator.to_string();

        let mut subscription = self.seed.subscriptions[0].clone();
        subscription.id = Uuid::new_v4();
        subscription.delegation_id = delegation.id;

        self.seed.delegations.push(delegation);
        self.seed.subscriptions.push(subscription.clone());
        subscription.id
    }

    pub fn seed(&self) -> Seed {
        self.seed.clone()
    }

    pub fn store(&self) -> MemoryStore {
        MemoryStore::from_seed(self.seed())
    }
}

type Responder = dyn Fn(usize, &[u8]) -> Result<String, RedemptionError> + Send + Sync;

/// Scripted executor that records every call and when it happened.
pub struct MockExecutor {
    responder: Box<Responder>,
    calls: Mutex<Vec<(Instant, ExecutionParams)>>,
}

impl MockExecutor {
    pub fn new(
        responder: impl Fn(usize, &[u8]) -> Result<String, RedemptionError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(|n, _| Ok(format!("0xtx{n}")))
    }

    pub fn failing(err: RedemptionError) -> Arc<Self> {
        Self::new(move |_, _| Err(err.clone()))
    }

    /// Fails permanently for delegations signed by `delegator`, succeeds otherwise.
    pub fn rejecting_delegator(delegator: &'static str) -> Arc<Self> {
        Self::new(move |n, payload| {
            let payload = String::from_utf8_lossy(payload);
            if payload.contains(delegator) {
                Err(RedemptionError::InsufficientFunds(format!("{delegator} has no balance")))
            } else {
                Ok(format!("0xtx{n}"))
            }
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_instants(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn last_params(&self) -> Option<ExecutionParams> {
        self.calls.lock().unwrap().last().map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl DelegationExecutor for MockExecutor {
    async fn redeem(
        &self,
        delegation: &[u8],
        params: &ExecutionParams,
    ) -> Result<String, RedemptionError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), params.clone()));
            calls.len()
        };
        (self.responder)(n, delegation)
    }
}

/// Store wrapper that fails named operations on demand. Transactions opened
/// through it share the same fault table.
#[derive(Clone)]
pub struct Faulty<Q> {
    inner: Q,
    faults: Arc<Mutex<HashMap<&'static str, StoreError>>>,
}

impl<Q> Faulty<Q> {
    pub fn new(inner: Q) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    pub fn fail(&self, op: &'static str, err: StoreError) {
        self.faults.lock().unwrap().insert(op, err);
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        match self.faults.lock().unwrap().get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<Q: Queries> Queries for Faulty<Q> {
    async fn get_subscription(&mut self, id: Uuid) -> Result<Subscription, StoreError> {
        self.check("get_subscription")?;
        self.inner.get_subscription(id).await
    }

    async fn list_due_for_redemption(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.check("list_due_for_redemption")?;
        self.inner.list_due_for_redemption(now).await
    }

    async fn increment_redemption(
        &mut self,
        id: Uuid,
        amount_in_cents: i64,
        next_redemption_date: DateTime<Utc>,
        complete: bool,
    ) -> Result<Subscription, StoreError> {
        self.check("increment_redemption")?;
        self.inner
            .increment_redemption(id, amount_in_cents, next_redemption_date, complete)
            .await
    }

    async fn update_status(
        &mut self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<Subscription, StoreError> {
        self.check("update_status")?;
        self.inner.update_status(id, status).await
    }

    async fn create_subscription_event(
        &mut self,
        event: NewSubscriptionEvent,
    ) -> Result<SubscriptionEvent, StoreError> {
        self.check("create_subscription_event")?;
        self.inner.create_subscription_event(event).await
    }

    async fn list_subscription_events(
        &mut self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionEvent>, StoreError> {
        self.inner.list_subscription_events(subscription_id).await
    }

    async fn get_product(&mut self, id: Uuid) -> Result<Product, StoreError> {
        self.check("get_product")?;
        self.inner.get_product(id).await
    }

    async fn get_price(&mut self, id: Uuid) -> Result<Price, StoreError> {
        self.inner.get_price(id).await
    }

    async fn get_product_token(&mut self, id: Uuid) -> Result<ProductToken, StoreError> {
        self.inner.get_product_token(id).await
    }

    async fn get_token(&mut self, id: Uuid) -> Result<Token, StoreError> {
        self.inner.get_token(id).await
    }

    async fn get_network(&mut self, id: Uuid) -> Result<Network, StoreError> {
        self.inner.get_network(id).await
    }

    async fn get_wallet(&mut self, id: Uuid) -> Result<Wallet, StoreError> {
        self.inner.get_wallet(id).await
    }

    async fn get_delegation(&mut self, id: Uuid) -> Result<DelegationDatum, StoreError> {
        self.inner.get_delegation(id).await
    }
}

#[async_trait]
impl<S: Store> Store for Faulty<S> {
    type Tx = Faulty<S::Tx>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.check("begin")?;
        Ok(Faulty {
            inner: self.inner.begin().await?,
            faults: self.faults.clone(),
        })
    }
}

#[async_trait]
impl<T: Transaction> Transaction for Faulty<T> {
    async fn commit(self) -> Result<(), StoreError> {
        self.check("commit")?;
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}
