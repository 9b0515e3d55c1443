//! Public promo signup, rate limited per client IP

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::{
    auth::extract_ip_address,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_EMAIL_LEN: usize = 254;
const MAX_SOURCE_LEN: usize = 64;

#[derive(Debug, Deserialize)]
pub struct PromoSignupRequest {
    pub email: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PromoSignupResponse {
    pub success: bool,
    /// `false` when the email was already on the list
    pub new_signup: bool,
}

fn is_plausible_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.contains(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

pub async fn signup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PromoSignupRequest>,
) -> ApiResult<(StatusCode, Json<PromoSignupResponse>)> {
    let ip = extract_ip_address(&headers);
    let limit_key = ip.clone().unwrap_or_else(|| "unknown".to_string());

    let limit = state.promo_limiter.check(&limit_key).await;
    if !limit.allowed {
        tracing::warn!(ip = %limit_key, "Promo signup rate limited");
        return Err(ApiError::RateLimited {
            retry_after_seconds: limit.retry_after_seconds,
        });
    }

    let email = req.email.trim();
    if !is_plausible_email(email) {
        return Err(ApiError::BadRequest("a valid email is required".to_string()));
    }
    let source = req
        .source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_SOURCE_LEN).collect::<String>());

    let new_signup = state
        .billing
        .store
        .insert_promo_signup(email, source.as_deref(), ip.as_deref())
        .await?;

    tracing::info!(new_signup = new_signup, source = ?source, "Promo signup");

    let status = if new_signup {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(PromoSignupResponse {
            success: true,
            new_signup,
        }),
    ))
}
