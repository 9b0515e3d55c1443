//! Pull reconciliation
//!
//! Re-fetches unsettled invoices from the provider and copies remote state
//! onto the local mirror. Used on the read path (a user's most recent
//! invoices before a listing) and by the worker's periodic sweep.

use std::collections::HashMap;

use serde::Serialize;
use watchdesk_shared::InvoiceStatus;

use crate::error::{BillingError, BillingResult};
use crate::provider::{PaymentProvider, PaymentProviders, RemoteInvoice};
use crate::store::{InvoiceRecord, InvoiceStore, InvoiceUpdate};

/// Result of applying an update to one local invoice
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(Box<InvoiceRecord>),
    /// Nothing would change
    Unchanged,
    /// The update would move the invoice backwards (e.g. out of `paid`)
    Stale,
}

/// Apply `update` to `current` unless it is a no-op or an illegal transition.
pub async fn apply_guarded(
    store: &InvoiceStore,
    current: &InvoiceRecord,
    update: &InvoiceUpdate,
) -> BillingResult<ApplyOutcome> {
    if let Some(next) = update.status {
        if !current.status.can_transition_to(next) {
            tracing::info!(
                invoice_id = current.id,
                current = %current.status,
                incoming = %next,
                "Ignoring stale invoice status"
            );
            return Ok(ApplyOutcome::Stale);
        }
    }

    if !update.differs_from(current) {
        return Ok(ApplyOutcome::Unchanged);
    }

    let updated = store.apply_update(current.id, update).await?;
    tracing::info!(
        invoice_id = updated.id,
        provider_invoice_id = %updated.provider_invoice_id,
        from = %current.status,
        to = %updated.status,
        "Invoice reconciled"
    );
    Ok(ApplyOutcome::Applied(Box::new(updated)))
}

/// Map a fetched remote invoice onto an update for `current`.
///
/// Stripe keeps a failed invoice `open` while it retries, so a pull never
/// moves `payment_failed` back to `open`. Only a settled remote status
/// (paid, void, uncollectible) or a webhook replaces it.
pub fn pull_update(current: &InvoiceRecord, remote: &RemoteInvoice) -> InvoiceUpdate {
    let mut update = InvoiceUpdate::from_remote(remote);
    if current.status == InvoiceStatus::PaymentFailed
        && update.status == Some(InvoiceStatus::Open)
    {
        update.status = None;
    }
    update
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: InvoiceStore,
    providers: PaymentProviders,
}

impl ReconciliationService {
    pub fn new(store: InvoiceStore, providers: PaymentProviders) -> Self {
        Self { store, providers }
    }

    /// Pull remote state for one invoice.
    pub async fn sync_invoice(
        &self,
        provider: &dyn PaymentProvider,
        invoice: &InvoiceRecord,
    ) -> BillingResult<ApplyOutcome> {
        let remote = provider.retrieve_invoice(&invoice.provider_invoice_id).await?;
        apply_guarded(&self.store, invoice, &pull_update(invoice, &remote)).await
    }

    /// Read-path sync: the caller's `limit` most recent unsettled invoices.
    ///
    /// Individual fetch failures are logged and counted, never returned.
    pub async fn sync_recent_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> BillingResult<SyncReport> {
        if limit <= 0 {
            return Ok(SyncReport::default());
        }

        let invoices = self.store.recent_unsettled(user_id, limit).await?;
        if invoices.is_empty() {
            return Ok(SyncReport::default());
        }

        let user = self
            .store
            .billing_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        let provider = self
            .providers
            .for_account(user.stripe_secret_key.as_deref())?;

        Ok(self.sync_batch(provider.as_ref(), &invoices).await)
    }

    /// Worker sweep across all users, least recently updated first.
    pub async fn sync_stale(&self, batch_size: i64) -> BillingResult<SyncReport> {
        let invoices = self.store.stale_unsettled(batch_size).await?;

        let mut by_user: HashMap<i64, Vec<InvoiceRecord>> = HashMap::new();
        for invoice in invoices {
            by_user.entry(invoice.user_id).or_default().push(invoice);
        }

        let mut report = SyncReport::default();
        for (user_id, invoices) in by_user {
            let provider = match self.store.billing_user(user_id).await {
                Ok(Some(user)) => self.providers.for_account(user.stripe_secret_key.as_deref()),
                Ok(None) => Err(BillingError::NotFound(format!("user {}", user_id))),
                Err(e) => Err(e),
            };
            let provider = match provider {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::warn!(
                        user_id = user_id,
                        error = %e,
                        skipped = invoices.len(),
                        "Cannot reconcile invoices for user"
                    );
                    report.checked += invoices.len();
                    report.failed += invoices.len();
                    continue;
                }
            };

            let partial = self.sync_batch(provider.as_ref(), &invoices).await;
            report.checked += partial.checked;
            report.updated += partial.updated;
            report.failed += partial.failed;
        }

        Ok(report)
    }

    async fn sync_batch(
        &self,
        provider: &dyn PaymentProvider,
        invoices: &[InvoiceRecord],
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for invoice in invoices {
            report.checked += 1;
            match self.sync_invoice(provider, invoice).await {
                Ok(ApplyOutcome::Applied(_)) => report.updated += 1,
                Ok(ApplyOutcome::Unchanged) | Ok(ApplyOutcome::Stale) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        invoice_id = invoice.id,
                        provider_invoice_id = %invoice.provider_invoice_id,
                        error = %e,
                        "Failed to refresh invoice from provider"
                    );
                }
            }
        }
        report
    }
}
