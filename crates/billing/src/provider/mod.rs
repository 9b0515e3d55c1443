//! Payment provider abstraction
//!
//! The creation flow, explicit send/void actions and pull reconciliation all
//! talk to the provider through [`PaymentProvider`]. Stripe is the production
//! implementation; [`InMemoryProvider`] keeps remote state in process memory
//! for tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use watchdesk_shared::InvoiceStatus;

use crate::client::{BillingConfig, ProviderKind, StripeClient};
use crate::error::{BillingError, BillingResult};

pub mod memory;
pub mod stripe;

pub use self::memory::{FailPoint, InMemoryProvider};
pub use self::stripe::StripeProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRemoteCustomer {
    pub email: String,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewRemoteInvoice {
    pub customer_id: String,
    pub currency: String,
    pub days_until_due: u32,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewRemoteInvoiceItem {
    pub description: String,
    pub quantity: u64,
    pub unit_amount_cents: i64,
    pub currency: String,
}

/// Provider-side view of an invoice, already mapped to local types.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInvoice {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: InvoiceStatus,
    pub total_cents: i64,
    pub amount_paid_cents: Option<i64>,
    pub currency: String,
    pub hosted_url: Option<String>,
    pub pdf_url: Option<String>,
    pub payment_reference: Option<String>,
    pub due_date: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the provider reports the customer missing or deleted.
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<RemoteCustomer>>;

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<RemoteCustomer>>;

    async fn create_customer(&self, params: NewRemoteCustomer) -> BillingResult<RemoteCustomer>;

    async fn create_invoice(&self, params: NewRemoteInvoice) -> BillingResult<RemoteInvoice>;

    async fn add_invoice_item(
        &self,
        customer_id: &str,
        invoice_id: &str,
        item: NewRemoteInvoiceItem,
    ) -> BillingResult<()>;

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;

    async fn send_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice>;
}

/// Map a provider status string onto the local status model.
///
/// Stripe reports removed drafts as `deleted`; locally that is `void`.
pub fn status_from_provider(status: &str) -> InvoiceStatus {
    match status {
        "open" => InvoiceStatus::Open,
        "paid" => InvoiceStatus::Paid,
        "void" | "deleted" => InvoiceStatus::Void,
        "uncollectible" => InvoiceStatus::Uncollectible,
        "draft" => InvoiceStatus::Draft,
        other => {
            tracing::warn!(status = %other, "Unrecognized provider invoice status, treating as draft");
            InvoiceStatus::Draft
        }
    }
}

/// Hands out a provider client for a given account.
///
/// Stripe keys are per user with a platform-wide fallback, so the client is
/// built per call rather than shared.
#[derive(Clone)]
pub enum PaymentProviders {
    Stripe { fallback_secret_key: Option<String> },
    InMemory(Arc<InMemoryProvider>),
}

impl PaymentProviders {
    pub fn from_config(config: &BillingConfig) -> Self {
        match config.provider {
            ProviderKind::Stripe => PaymentProviders::Stripe {
                fallback_secret_key: config.stripe.secret_key.clone(),
            },
            ProviderKind::InMemory => PaymentProviders::InMemory(Arc::new(InMemoryProvider::new())),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            PaymentProviders::Stripe { .. } => ProviderKind::Stripe,
            PaymentProviders::InMemory(_) => ProviderKind::InMemory,
        }
    }

    /// Provider client for an account whose own key (if any) is `account_secret`.
    pub fn for_account(
        &self,
        account_secret: Option<&str>,
    ) -> BillingResult<Arc<dyn PaymentProvider>> {
        match self {
            PaymentProviders::Stripe {
                fallback_secret_key,
            } => {
                let key = account_secret
                    .filter(|k| !k.trim().is_empty())
                    .or(fallback_secret_key.as_deref())
                    .ok_or_else(|| {
                        BillingError::ProviderNotConfigured(
                            "no Stripe secret key on the account and no STRIPE_SECRET_KEY fallback"
                                .to_string(),
                        )
                    })?;
                Ok(Arc::new(StripeProvider::new(StripeClient::new(key))))
            }
            PaymentProviders::InMemory(provider) => Ok(provider.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_from_provider("open"), InvoiceStatus::Open);
        assert_eq!(status_from_provider("paid"), InvoiceStatus::Paid);
        assert_eq!(status_from_provider("deleted"), InvoiceStatus::Void);
        assert_eq!(status_from_provider("uncollectible"), InvoiceStatus::Uncollectible);
        assert_eq!(status_from_provider("something_new"), InvoiceStatus::Draft);
    }

    #[test]
    fn test_stripe_without_any_key_is_not_configured() {
        let providers = PaymentProviders::Stripe {
            fallback_secret_key: None,
        };
        let err = providers.for_account(None).err().unwrap();
        assert!(matches!(err, BillingError::ProviderNotConfigured(_)));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn test_account_key_preferred_over_fallback() {
        let providers = PaymentProviders::Stripe {
            fallback_secret_key: None,
        };
        let provider = providers.for_account(Some("sk_test_account")).unwrap();
        assert_eq!(provider.name(), "stripe");
    }

    #[test]
    fn test_in_memory_shares_one_instance() {
        let memory = Arc::new(InMemoryProvider::new());
        let providers = PaymentProviders::InMemory(memory);
        let a = providers.for_account(None).unwrap();
        let b = providers.for_account(Some("ignored")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
