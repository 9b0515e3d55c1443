//! Billing configuration and the Stripe client wrapper

use std::str::FromStr;

use crate::error::{BillingError, BillingResult};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Which payment provider backs invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Stripe,
    /// Process-local fake, for tests and local development
    InMemory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::InMemory => "inmemory",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(ProviderKind::Stripe),
            "inmemory" | "in-memory" | "memory" => Ok(ProviderKind::InMemory),
            other => Err(BillingError::Config(format!(
                "Unknown PAYMENT_PROVIDER '{}' (expected 'stripe' or 'inmemory')",
                other
            ))),
        }
    }
}

/// Stripe configuration
#[derive(Debug, Clone, Default)]
pub struct StripeConfig {
    /// Platform-wide fallback key; users may carry their own
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    /// Accept unsigned webhooks when no secret is configured (development only)
    pub allow_unsigned_webhooks: bool,
}

impl StripeConfig {
    pub fn from_env() -> Self {
        Self {
            secret_key: non_empty_env("STRIPE_SECRET_KEY"),
            webhook_secret: non_empty_env("STRIPE_WEBHOOK_SECRET"),
            allow_unsigned_webhooks: std::env::var("ALLOW_UNSIGNED_WEBHOOKS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Everything the billing crate reads from the environment.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub provider: ProviderKind,
    pub stripe: StripeConfig,
    pub days_until_due: u32,
    /// How many recent unsettled invoices a listing re-fetches from the provider
    pub sync_on_read_limit: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Stripe,
            stripe: StripeConfig::default(),
            days_until_due: 30,
            sync_on_read_limit: 10,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let provider = match std::env::var("PAYMENT_PROVIDER") {
            Ok(value) => value.parse()?,
            Err(_) => ProviderKind::Stripe,
        };

        let days_until_due = parse_env("INVOICE_DAYS_UNTIL_DUE", 30u32)?;
        if days_until_due == 0 {
            return Err(BillingError::Config(
                "INVOICE_DAYS_UNTIL_DUE must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            provider,
            stripe: StripeConfig::from_env(),
            days_until_due,
            sync_on_read_limit: parse_env("SYNC_ON_READ_LIMIT", 10i64)?,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, value))),
        Err(_) => Ok(default),
    }
}

/// Stripe API client bound to one secret key
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    http: reqwest::Client,
    secret_key: String,
}

impl StripeClient {
    pub fn new(secret_key: &str) -> Self {
        Self {
            inner: stripe::Client::new(secret_key.to_string()),
            http: reqwest::Client::new(),
            secret_key: secret_key.to_string(),
        }
    }

    /// Typed SDK client
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    /// POST to a Stripe endpoint the SDK does not wrap and decode the JSON body.
    pub async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> BillingResult<T> {
        let url = format!("{}/{}", STRIPE_API_BASE, path.trim_start_matches('/'));

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("Failed to call Stripe API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                path = %path,
                error_body = %error_body,
                "Stripe API call failed"
            );
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(BillingError::ProviderAuth(error_body));
            }
            return Err(BillingError::Provider(format!(
                "Stripe API error ({}): {}",
                status, error_body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BillingError::Provider(format!("Failed to parse Stripe response: {}", e)))
    }
}
