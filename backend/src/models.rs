//! Domain records read and written by the redemption engine.
//!
//! Subscriptions, their append-only event log and the signed delegation are
//! owned by the engine. Products, prices, tokens, networks and wallets are
//! maintained elsewhere and only ever read here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Overdue,
    Suspended,
    Canceled,
    Expired,
    Failed,
    Completed,
}

impl SubscriptionStatus {
    /// Only active and overdue subscriptions may be redeemed.
    pub fn is_redeemable(self) -> bool {
        matches!(self, Self::Active | Self::Overdue)
    }

    /// Completed and failed subscriptions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Overdue => "overdue",
            Self::Suspended => "suspended",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Billing interval of a price.
///
/// Wire values follow the product catalogue (`1min`, `5mins`, `daily`,
/// `week`, `month`, `year`). Anything else decodes to [`IntervalType::Unknown`],
/// which the period calculator bills monthly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntervalType {
    OneMinute,
    FiveMinutes,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Unknown,
}

impl From<String> for IntervalType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "1min" => Self::OneMinute,
            "5mins" => Self::FiveMinutes,
            "daily" => Self::Daily,
            "week" => Self::Weekly,
            "month" => Self::Monthly,
            "year" => Self::Yearly,
            _ => Self::Unknown,
        }
    }
}

impl From<IntervalType> for String {
    fn from(value: IntervalType) -> Self {
        match value {
            IntervalType::OneMinute => "1min",
            IntervalType::FiveMinutes => "5mins",
            IntervalType::Daily => "daily",
            IntervalType::Weekly => "week",
            IntervalType::Monthly => "month",
            IntervalType::Yearly => "year",
            IntervalType::Unknown => "unknown",
        }
        .to_string()
    }
}

/// The billing agreement between a customer and a product price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub product_id: Uuid,
    pub price_id: Uuid,
    pub product_token_id: Uuid,
    pub delegation_id: Uuid,
    pub customer_wallet_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_redemption_date: Option<DateTime<Utc>>,
    pub total_redemptions: i32,
    pub total_amount_in_cents: i64,
    /// Number of redemptions contracted for fixed-term prices.
    pub total_term_length: Option<i32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Due when the next redemption instant has passed and the status allows it.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_none()
            && self.status.is_redeemable()
            && self.next_redemption_date.is_some_and(|next| next <= now)
    }

    /// True when one more successful redemption completes the contracted term.
    pub fn is_final_payment(&self) -> bool {
        self.total_term_length
            .is_some_and(|term| term > 0 && self.total_redemptions + 1 == term)
    }

    /// True when the contracted number of redemptions has already been taken.
    pub fn term_fulfilled(&self) -> bool {
        self.total_term_length
            .is_some_and(|term| term > 0 && self.total_redemptions >= term)
    }
}

/// Kinds of audit record in the subscription event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Redeemed,
    FailedRedemption,
    Completed,
    FailedValidation,
    FailedCustomerCreation,
    FailedWalletCreation,
    FailedDelegationStorage,
    FailedDuplicate,
    FailedSubscriptionDb,
    Failed,
}

/// Immutable audit record. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: EventType,
    /// Set on `Redeemed` and `Completed` only.
    pub transaction_hash: Option<String>,
    /// Set on failure event types only.
    pub error_message: Option<String>,
    pub amount_in_cents: i64,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Stored form of the signed spending authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationDatum {
    pub id: Uuid,
    pub delegate: String,
    pub delegator: String,
    pub authority: String,
    #[serde(default)]
    pub caveats: Vec<serde_json::Value>,
    pub salt: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct DelegationPayload<'a> {
    delegate: &'a str,
    delegator: &'a str,
    authority: &'a str,
    caveats: &'a [serde_json::Value],
    salt: &'a str,
    signature: &'a str,
}

impl DelegationDatum {
    /// Marshal the signed delegation into the bytes handed to the executor.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&DelegationPayload {
            delegate: &self.delegate,
            delegator: &self.delegator,
            authority: &self.authority,
            caveats: &self.caveats,
            salt: &self.salt,
            signature: &self.signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Merchant payout wallet.
    pub wallet_id: Uuid,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Recurring,
    OneOff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: Uuid,
    pub product_id: Uuid,
    pub price_type: PriceType,
    pub currency: String,
    pub unit_amount_in_pennies: i64,
    pub interval_type: IntervalType,
    pub term_length: Option<i32>,
    pub active: bool,
}

/// Links a product to a token accepted on a given network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductToken {
    pub id: Uuid,
    pub product_id: Uuid,
    pub network_id: Uuid,
    pub token_id: Uuid,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub network_id: Uuid,
    pub name: String,
    pub symbol: String,
    pub contract_address: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: Uuid,
    pub name: String,
    pub chain_id: u64,
    #[serde(default)]
    pub explorer_url: Option<String>,
}

impl Network {
    /// Explorer link for a transaction on this network, if one is configured.
    pub fn explorer_url(&self, tx_hash: &str) -> Option<String> {
        self.explorer_url
            .as_deref()
            .map(|base| format!("{}/tx/{tx_hash}", base.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub wallet_address: String,
    pub network_type: String,
}
