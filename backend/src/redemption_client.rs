//! HTTP client for the delegation-redemption service.
//!
//! The service accepts a base64-encoded signed delegation plus the execution
//! parameters and answers with either a transaction hash or an error object.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::executor::{DelegationExecutor, ExecutionParams, RedemptionError};

/// Production [`DelegationExecutor`] backed by the redemption service API.
#[derive(Clone)]
pub struct RedemptionClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct RedeemRequest<'a> {
    delegation_data: String,
    merchant_address: &'a str,
    token_contract_address: &'a str,
    token_decimals: u8,
    /// Decimal string; smallest-unit amounts routinely exceed 2^53.
    token_amount: String,
    chain_id: u64,
    network_name: &'a str,
}

#[derive(Deserialize, Debug, Default)]
struct RedeemResponse {
    transaction_hash: Option<String>,
    error: Option<RedeemErrorBody>,
}

#[derive(Deserialize, Debug)]
struct RedeemErrorBody {
    code: Option<String>,
    message: String,
}

impl RedemptionClient {
    /// Create a client with the given per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn redeem_url(&self) -> String {
        format!("{}/api/v1/redeem", self.base_url)
    }
}

#[async_trait]
impl DelegationExecutor for RedemptionClient {
    async fn redeem(
        &self,
        delegation: &[u8],
        params: &ExecutionParams,
    ) -> Result<String, RedemptionError> {
        let req = RedeemRequest {
            delegation_data: base64::engine::general_purpose::STANDARD.encode(delegation),
            merchant_address: &params.merchant_address,
            token_contract_address: &params.token_contract_address,
            token_decimals: params.token_decimals,
            token_amount: params.amount.to_string(),
            chain_id: params.chain_id,
            network_name: &params.network_name,
        };

        let resp = self
            .http
            .post(self.redeem_url())
            .json(&req)
            .send()
            .await
            .map_err(|e| RedemptionError::Transient(format!("redemption request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RedemptionError::Transient(format!("failed to read response: {e}")))?;

        debug!(status = status.as_u16(), "Redemption service responded");
        interpret_response(status.as_u16(), &body)
    }
}

/// Turn a redemption service response into a transaction hash or a
/// classified error.
fn interpret_response(status: u16, body: &str) -> Result<String, RedemptionError> {
    let parsed: Option<RedeemResponse> = serde_json::from_str(body).ok();

    if let Some(RedeemResponse {
        error: Some(err), ..
    }) = parsed
    {
        return Err(err
            .code
            .as_deref()
            .and_then(|code| RedemptionError::from_code(code, err.message.clone()))
            .unwrap_or_else(|| RedemptionError::classify(err.message)));
    }

    if (200..300).contains(&status) {
        return match parsed.and_then(|r| r.transaction_hash) {
            Some(hash) if !hash.is_empty() => Ok(hash),
            _ => Err(RedemptionError::Transient(
                "redemption service returned no transaction hash".into(),
            )),
        };
    }

    if status >= 500 || status == 429 {
        return Err(RedemptionError::Transient(format!("HTTP {status}: {body}")));
    }

    Err(RedemptionError::classify(format!("HTTP {status}: {body}")))
}
