//! API error type and its JSON rendering
//!
//! Every handler returns `ApiResult<T>`; the body of an error response is
//! always `{"error": <message>, "code": <status>}`, plus `remediation` when
//! the caller can fix a provider credential problem themselves.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use watchdesk_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("Payment provider credentials problem: {message}")]
    ProviderCredentials {
        message: String,
        remediation: &'static str,
    },

    #[error("Too many requests")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("Payment provider error: {0}")]
    BadGateway(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) | ApiError::ProviderCredentials { .. } => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        if let Some(remediation) = e.remediation() {
            return ApiError::ProviderCredentials {
                message: e.to_string(),
                remediation,
            };
        }

        match e {
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            BillingError::Provider(msg) => ApiError::BadGateway(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookSecretMissing => {
                ApiError::BadRequest("Webhook signing secret not configured".to_string())
            }
            BillingError::WebhookPayload(msg) => {
                ApiError::BadRequest(format!("Malformed webhook payload: {}", msg))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("database: {}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                json!({ "error": "Internal server error", "code": status.as_u16() })
            }
            ApiError::ProviderCredentials {
                message,
                remediation,
            } => {
                tracing::warn!(error = %message, "Payment provider rejected credentials");
                json!({
                    "error": message,
                    "code": status.as_u16(),
                    "remediation": remediation,
                })
            }
            ApiError::BadGateway(message) => {
                tracing::warn!(error = %message, "Payment provider request failed");
                json!({ "error": self.to_string(), "code": status.as_u16() })
            }
            other => json!({ "error": other.to_string(), "code": status.as_u16() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited {
            retry_after_seconds: Some(secs),
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_status_codes() {
        let cases = [
            (BillingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::NotFound("invoice 1".into()), StatusCode::NOT_FOUND),
            (BillingError::Provider("card_declined".into()), StatusCode::BAD_GATEWAY),
            (BillingError::ProviderAuth("bad key".into()), StatusCode::UNAUTHORIZED),
            (BillingError::ProviderNotConfigured("no key".into()), StatusCode::UNAUTHORIZED),
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (BillingError::Database("locked".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn credential_errors_carry_remediation() {
        let err = ApiError::from(BillingError::ProviderAuth("Invalid API Key".into()));
        assert!(matches!(err, ApiError::ProviderCredentials { .. }));
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_seconds: Some(42),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }
}
