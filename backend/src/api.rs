//! Redemption endpoints.
//!
//! Run endpoints answer 200 whenever the run itself finished, even if some
//! subscriptions in it failed; those failures are in the payload. Only
//! malformed input, unknown subscriptions and infrastructure failures map
//! to error statuses.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, web};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::processor::ProcessOutcome;
use crate::runner::{DueBatchRunner, RunError};
use crate::store::{Store, StoreError};

pub struct ApiState<S: Store> {
    pub runner: Arc<DueBatchRunner<S>>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid subscription id: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::NotFound(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            Self::Internal(detail) => {
                error!(error = %detail, "Request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(serde_json::json!({ "error": message }))
    }
}

#[derive(Serialize)]
struct RedeemResponse {
    subscription_id: Uuid,
    #[serde(flatten)]
    outcome: ProcessOutcome,
}

#[derive(Deserialize)]
struct RedeemRequest {
    subscription_ids: Vec<Uuid>,
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(raw.to_string()))
}

/// Register the subscription routes for a store type.
pub fn configure<S: Store>(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/subscriptions")
            .route("/process-due", web::post().to(process_due::<S>))
            .route("/redeem-due", web::post().to(redeem_due::<S>))
            .route("/redeem", web::post().to(redeem_list::<S>))
            .route("/{id}/redeem", web::post().to(redeem_one::<S>))
            .route("/{id}/events", web::get().to(events::<S>)),
    );
}

/// `POST /subscriptions/{id}/redeem`
async fn redeem_one<S: Store>(
    state: web::Data<ApiState<S>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    let outcome = state.runner.redeem_one(id, Utc::now()).await?;
    Ok(HttpResponse::Ok().json(RedeemResponse {
        subscription_id: id,
        outcome,
    }))
}

/// `POST /subscriptions/process-due`
async fn process_due<S: Store>(state: web::Data<ApiState<S>>) -> Result<HttpResponse, ApiError> {
    let result = state.runner.process_due(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// `POST /subscriptions/redeem-due`
async fn redeem_due<S: Store>(state: web::Data<ApiState<S>>) -> Result<HttpResponse, ApiError> {
    let result = state.runner.redeem_due(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// `POST /subscriptions/redeem`
async fn redeem_list<S: Store>(
    state: web::Data<ApiState<S>>,
    body: web::Json<RedeemRequest>,
) -> Result<HttpResponse, ApiError> {
    let result = state
        .runner
        .redeem_ids(&body.subscription_ids, Utc::now())
        .await;
    Ok(HttpResponse::Ok().json(result))
}

/// `GET /subscriptions/{id}/events`
async fn events<S: Store>(
    state: web::Data<ApiState<S>>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    let events = state.runner.events(id).await?;
    Ok(HttpResponse::Ok().json(events))
}
