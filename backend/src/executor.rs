//! Boundary to the delegation-redemption service.
//!
//! The executor submits a signed delegation on-chain and either returns the
//! transaction hash or a [`RedemptionError`]. Failures are classified once,
//! at this boundary, so the retry loop never inspects message text.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Parameters for executing one redemption transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionParams {
    /// Merchant payout address receiving the funds.
    pub merchant_address: String,
    pub token_contract_address: String,
    pub token_decimals: u8,
    /// Amount in the token's smallest unit.
    pub amount: u128,
    pub chain_id: u64,
    pub network_name: String,
}

/// Classified redemption failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("delegation expired: {0}")]
    DelegationExpired(String),
    #[error("invalid delegation format: {0}")]
    InvalidDelegation(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("transient redemption failure: {0}")]
    Transient(String),
}

impl RedemptionError {
    /// Permanent failures can never succeed on retry.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transient(_))
    }

    /// Map a structured error code from the redemption service.
    pub fn from_code(code: &str, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        let err = match code.to_ascii_uppercase().as_str() {
            "INVALID_SIGNATURE" => Self::InvalidSignature(message),
            "DELEGATION_EXPIRED" => Self::DelegationExpired(message),
            "INVALID_DELEGATION" | "INVALID_DELEGATION_FORMAT" => Self::InvalidDelegation(message),
            "INVALID_TOKEN" => Self::InvalidToken(message),
            "UNAUTHORIZED" => Self::Unauthorized(message),
            "INSUFFICIENT_FUNDS" => Self::InsufficientFunds(message),
            "TRANSIENT" | "NONCE_COLLISION" | "TIMEOUT" => Self::Transient(message),
            _ => return None,
        };
        Some(err)
    }

    /// Classify a free-text failure message.
    ///
    /// Nonce collisions are checked first: they are transient even though
    /// the message starts with "invalid".
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if lower.contains("invalid account nonce") {
            Self::Transient(message)
        } else if lower.contains("invalid signature") {
            Self::InvalidSignature(message)
        } else if lower.contains("delegation expired") {
            Self::DelegationExpired(message)
        } else if lower.contains("invalid delegation format") {
            Self::InvalidDelegation(message)
        } else if lower.contains("invalid token") {
            Self::InvalidToken(message)
        } else if lower.contains("unauthorized") {
            Self::Unauthorized(message)
        } else if lower.contains("insufficient funds") {
            Self::InsufficientFunds(message)
        } else {
            Self::Transient(message)
        }
    }
}

/// Redeems signed delegations on-chain.
#[async_trait]
pub trait DelegationExecutor: Send + Sync {
    async fn redeem(
        &self,
        delegation: &[u8],
        params: &ExecutionParams,
    ) -> Result<String, RedemptionError>;
}

/// Convert a USD-cent price into a stablecoin amount in smallest units.
///
/// Returns `None` for negative amounts, on overflow, and when the price is
/// not exactly representable in the token (e.g. 150 cents of a 0-decimal
/// token). Amounts are never rounded.
pub fn token_amount(amount_in_cents: i64, decimals: u8) -> Option<u128> {
    let cents = u128::try_from(amount_in_cents).ok()?;
    let scale = 10u128.checked_pow(u32::from(decimals))?;
    let scaled = cents.checked_mul(scale)?;
    (scaled % 100 == 0).then_some(scaled / 100)
}
