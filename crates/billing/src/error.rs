//! Billing error types

use watchdesk_shared::MoneyError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Payment provider rejected credentials: {0}")]
    ProviderAuth(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook signing secret not configured")]
    WebhookSecretMissing,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// What the account owner should do to fix a provider credential problem.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            BillingError::ProviderNotConfigured(_) => Some(
                "Add your Stripe secret key in account settings, or set STRIPE_SECRET_KEY on the server.",
            ),
            BillingError::ProviderAuth(_) => Some(
                "Your Stripe secret key was rejected. Generate a new secret key in the Stripe dashboard \
                 (Developers > API keys) and update it in account settings.",
            ),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match e {
            stripe::StripeError::Stripe(ref request_error) if request_error.http_status == 401 => {
                BillingError::ProviderAuth(
                    request_error
                        .message
                        .clone()
                        .unwrap_or_else(|| "authentication failed".to_string()),
                )
            }
            other => BillingError::Provider(other.to_string()),
        }
    }
}

impl From<MoneyError> for BillingError {
    fn from(e: MoneyError) -> Self {
        BillingError::InvalidInput(e.to_string())
    }
}
