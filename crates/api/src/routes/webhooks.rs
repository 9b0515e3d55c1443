//! Stripe webhook receiver and ledger operations
//!
//! The ledger is shared by every account on the server; the `/api/webhooks`
//! routes are an operator tool behind normal authentication.

use axum::{
    extract::{Extension, Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use watchdesk_billing::{WebhookEventRecord, WebhookOutcome, WebhookReplayResult};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "Stripe-Signature";
const LEDGER_RESULTS: [&str; 5] = ["processing", "success", "error", "ignored", "unmatched"];

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// `POST /webhooks/stripe`
///
/// The body is taken as a raw string: the signature covers the exact bytes.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            ApiError::from(e)
        })?;

    let outcome = state
        .billing
        .webhooks
        .handle_event(&body, &event)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Stripe webhook processing failed"
            );
            ApiError::from(e)
        })?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub result: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let result = query.result.as_deref().map(str::trim).filter(|r| !r.is_empty());
    if let Some(result) = result {
        if !LEDGER_RESULTS.contains(&result) {
            return Err(ApiError::BadRequest(format!(
                "unknown result filter: {} (expected one of {})",
                result,
                LEDGER_RESULTS.join(", ")
            )));
        }
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    tracing::debug!(user_id = auth_user.user_id, result = ?result, "Listing webhook ledger");
    let events = state
        .billing
        .webhooks
        .list_events(result, limit, offset)
        .await?;
    Ok(Json(events))
}

pub async fn replay_event(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(user_id = auth_user.user_id, event_id = %event_id, "Replaying webhook event");
    let result = state.billing.webhooks.replay_event(&event_id).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub max_events: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReplayFailedResponse {
    pub replayed: usize,
    pub succeeded: usize,
    pub results: Vec<WebhookReplayResult>,
}

pub async fn replay_failed(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<ReplayFailedResponse>> {
    let results = state
        .billing
        .webhooks
        .replay_failed(query.max_events)
        .await?;
    let succeeded = results.iter().filter(|r| r.success).count();

    tracing::info!(
        user_id = auth_user.user_id,
        replayed = results.len(),
        succeeded = succeeded,
        "Replayed failed webhook events"
    );

    Ok(Json(ReplayFailedResponse {
        replayed: results.len(),
        succeeded,
        results,
    }))
}
