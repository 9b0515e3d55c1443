// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Watchdesk Billing Module
//!
//! Invoicing through a hosted payment provider, with the local database
//! acting as a mirror of provider state.
//!
//! ## Features
//!
//! - **Invoice Creation**: resolve the remote customer, create/finalize/send
//!   the provider invoice, persist the local row and items in one transaction
//! - **Webhooks**: signature-verified Stripe events update local status, with
//!   a ledger for de-duplication and replay
//! - **Reconciliation**: pull sync of unsettled invoices on read and from the
//!   worker
//! - **Invariants**: read-only consistency checks over invoices and contacts

pub mod client;
pub mod customer;
pub mod error;
pub mod invariants;
pub mod invoices;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{BillingConfig, ProviderKind, StripeClient, StripeConfig};

// Customer
pub use customer::{BillingParty, CustomerResolution, CustomerService, CustomerSource};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{
    CreateInvoiceItemRequest, CreateInvoiceRequest, InvoiceService, InvoiceWithItems,
    ListInvoicesQuery,
};

// Provider
pub use provider::{
    FailPoint, InMemoryProvider, PaymentProvider, PaymentProviders, RemoteCustomer,
    RemoteInvoice, StripeProvider,
};

// Reconciliation
pub use reconcile::{ApplyOutcome, ReconciliationService, SyncReport};

// Store
pub use store::{
    BillingUser, ContactRecord, InvoiceItemRecord, InvoiceRecord, InvoiceStore, NewContact,
    UserCredentials,
};

// Webhooks
pub use webhooks::{
    sign_payload, verify_signature, WebhookEvent, WebhookEventRecord, WebhookHandler,
    WebhookOutcome, WebhookReplayResult,
};

use std::sync::Arc;

use sqlx::SqlitePool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: Arc<BillingConfig>,
    pub providers: PaymentProviders,
    pub store: InvoiceStore,
    pub customers: CustomerService,
    pub invoices: InvoiceService,
    pub reconciliation: ReconciliationService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: SqlitePool) -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: SqlitePool) -> Self {
        let providers = PaymentProviders::from_config(&config);
        Self::with_providers(config, providers, pool)
    }

    /// Create a billing service around an existing provider registry
    pub fn with_providers(
        config: BillingConfig,
        providers: PaymentProviders,
        pool: SqlitePool,
    ) -> Self {
        let config = Arc::new(config);
        let store = InvoiceStore::new(pool.clone());
        let customers = CustomerService::new(store.clone());
        let reconciliation = ReconciliationService::new(store.clone(), providers.clone());

        Self {
            invoices: InvoiceService::new(
                store.clone(),
                customers.clone(),
                reconciliation.clone(),
                providers.clone(),
                config.clone(),
            ),
            webhooks: WebhookHandler::new(store.clone(), config.stripe.clone()),
            invariants: InvariantChecker::new(pool),
            config,
            providers,
            store,
            customers,
            reconciliation,
        }
    }
}
