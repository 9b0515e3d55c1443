//! Invoice creation and lifecycle actions
//!
//! Creation is a straight sequence of provider calls followed by a single
//! local transaction. Remote objects created before a failing step are left
//! in place; the local database only ever sees fully created invoices.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use watchdesk_shared::{normalize_currency, to_minor_units, InvoiceStatus};

use crate::client::BillingConfig;
use crate::customer::{BillingParty, CustomerService};
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    NewRemoteInvoice, NewRemoteInvoiceItem, PaymentProvider, PaymentProviders, RemoteInvoice,
};
use crate::reconcile::{apply_guarded, ApplyOutcome, ReconciliationService};
use crate::store::{
    InvoiceItemRecord, InvoiceRecord, InvoiceStore, InvoiceUpdate, NewInvoice, NewInvoiceItem,
};

const DEFAULT_CURRENCY: &str = "usd";
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoiceItemRequest {
    pub description: String,
    pub quantity: i64,
    /// Decimal amount in the invoice currency
    pub unit_price: f64,
    #[serde(default)]
    pub watch_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoiceRequest {
    #[serde(default)]
    pub contact_id: Option<i64>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub due_in_days: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    pub items: Vec<CreateInvoiceItemRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListInvoicesQuery {
    pub status: Option<InvoiceStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceWithItems {
    #[serde(flatten)]
    pub invoice: InvoiceRecord,
    pub items: Vec<InvoiceItemRecord>,
}

/// Request after validation, amounts in minor units
struct ValidatedInvoice {
    currency: String,
    due_in_days: Option<u32>,
    items: Vec<NewInvoiceItem>,
}

fn validate(request: &CreateInvoiceRequest) -> BillingResult<ValidatedInvoice> {
    if request.items.is_empty() {
        return Err(BillingError::InvalidInput(
            "invoice needs at least one item".to_string(),
        ));
    }

    let has_email = request
        .customer_email
        .as_deref()
        .map(|e| !e.trim().is_empty())
        .unwrap_or(false);
    if request.contact_id.is_none() && !has_email {
        return Err(BillingError::InvalidInput(
            "either contact_id or customer_email is required".to_string(),
        ));
    }
    if let Some(email) = request.customer_email.as_deref().filter(|e| !e.trim().is_empty()) {
        if !email.contains('@') {
            return Err(BillingError::InvalidInput(format!(
                "invalid customer_email: {}",
                email
            )));
        }
    }
    if request.due_in_days == Some(0) {
        return Err(BillingError::InvalidInput(
            "due_in_days must be at least 1".to_string(),
        ));
    }

    let currency = normalize_currency(request.currency.as_deref().unwrap_or(DEFAULT_CURRENCY))?;

    let mut items = Vec::with_capacity(request.items.len());
    let mut running_total: i64 = 0;
    for (index, item) in request.items.iter().enumerate() {
        let description = item.description.trim();
        if description.is_empty() {
            return Err(BillingError::InvalidInput(format!(
                "item {} needs a description",
                index + 1
            )));
        }
        if item.quantity < 1 {
            return Err(BillingError::InvalidInput(format!(
                "item {} quantity must be at least 1",
                index + 1
            )));
        }

        let unit_price_cents = to_minor_units(item.unit_price, &currency)?;
        let total_cents = unit_price_cents
            .checked_mul(item.quantity)
            .ok_or_else(|| BillingError::InvalidInput(format!("item {} total is too large", index + 1)))?;
        running_total = running_total
            .checked_add(total_cents)
            .ok_or_else(|| BillingError::InvalidInput("invoice total is too large".to_string()))?;

        items.push(NewInvoiceItem {
            watch_id: item.watch_id,
            description: description.to_string(),
            quantity: item.quantity,
            unit_price_cents,
            total_cents,
        });
    }

    Ok(ValidatedInvoice {
        currency,
        due_in_days: request.due_in_days,
        items,
    })
}

#[derive(Clone)]
pub struct InvoiceService {
    store: InvoiceStore,
    customers: CustomerService,
    reconciliation: ReconciliationService,
    providers: PaymentProviders,
    config: Arc<BillingConfig>,
}

impl InvoiceService {
    pub fn new(
        store: InvoiceStore,
        customers: CustomerService,
        reconciliation: ReconciliationService,
        providers: PaymentProviders,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            customers,
            reconciliation,
            providers,
            config,
        }
    }

    async fn provider_for(&self, user_id: i64) -> BillingResult<Arc<dyn PaymentProvider>> {
        let user = self
            .store
            .billing_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        self.providers
            .for_account(user.stripe_secret_key.as_deref())
    }

    async fn owned_invoice(&self, user_id: i64, invoice_id: i64) -> BillingResult<InvoiceRecord> {
        self.store
            .get_invoice(user_id, invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))
    }

    async fn with_items(&self, invoice: InvoiceRecord) -> BillingResult<InvoiceWithItems> {
        let items = self.store.invoice_items(invoice.id).await?;
        Ok(InvoiceWithItems { invoice, items })
    }

    /// Create, finalize and send a provider invoice, then mirror it locally.
    pub async fn create_invoice(
        &self,
        user_id: i64,
        request: CreateInvoiceRequest,
    ) -> BillingResult<InvoiceWithItems> {
        let validated = validate(&request)?;

        let contact = match request.contact_id {
            Some(contact_id) => Some(
                self.store
                    .get_contact(user_id, contact_id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("contact {}", contact_id)))?,
            ),
            None => None,
        };

        let email = request
            .customer_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .or_else(|| contact.as_ref().and_then(|c| c.email.as_deref()))
            .ok_or_else(|| {
                BillingError::InvalidInput(
                    "contact has no email; provide customer_email".to_string(),
                )
            })?
            .to_string();
        let name = request
            .customer_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| contact.as_ref().map(|c| c.name.clone()));

        let provider = self.provider_for(user_id).await?;

        let customer = self
            .customers
            .resolve(
                provider.as_ref(),
                &BillingParty {
                    user_id,
                    contact: contact.as_ref(),
                    email: &email,
                    name: name.as_deref(),
                },
            )
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        if let Some(contact) = &contact {
            metadata.insert("contact_id".to_string(), contact.id.to_string());
        }

        let draft = provider
            .create_invoice(NewRemoteInvoice {
                customer_id: customer.customer_id.clone(),
                currency: validated.currency.clone(),
                days_until_due: validated.due_in_days.unwrap_or(self.config.days_until_due),
                description: request.description.clone(),
                metadata,
            })
            .await?;

        for item in &validated.items {
            provider
                .add_invoice_item(
                    &customer.customer_id,
                    &draft.id,
                    NewRemoteInvoiceItem {
                        description: item.description.clone(),
                        quantity: item.quantity as u64,
                        unit_amount_cents: item.unit_price_cents,
                        currency: validated.currency.clone(),
                    },
                )
                .await?;
        }

        let finalized = provider.finalize_invoice(&draft.id).await?;
        let sent = provider.send_invoice(&finalized.id).await?;

        // Send responses can omit fields populated at finalization
        let remote = RemoteInvoice {
            hosted_url: sent.hosted_url.clone().or(finalized.hosted_url),
            pdf_url: sent.pdf_url.clone().or(finalized.pdf_url),
            payment_reference: sent.payment_reference.clone().or(finalized.payment_reference),
            due_date: sent.due_date.or(finalized.due_date),
            ..sent
        };

        let record = self
            .store
            .insert_invoice(NewInvoice {
                user_id,
                contact_id: contact.as_ref().map(|c| c.id),
                provider: provider.name().to_string(),
                provider_customer_id: customer.customer_id.clone(),
                customer_email: Some(email),
                customer_name: name,
                remote,
                items: validated.items,
            })
            .await?;

        if record.total_cents != finalized.total_cents {
            tracing::warn!(
                invoice_id = record.id,
                local_total = record.total_cents,
                remote_total = finalized.total_cents,
                "Local invoice total differs from provider total"
            );
        }

        tracing::info!(
            user_id = user_id,
            invoice_id = record.id,
            provider_invoice_id = %record.provider_invoice_id,
            customer_id = %customer.customer_id,
            customer_source = ?customer.source,
            total_cents = record.total_cents,
            currency = %record.currency,
            status = %record.status,
            "Invoice created and sent"
        );

        self.with_items(record).await
    }

    /// Ask the provider to email an open invoice again.
    pub async fn send_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> BillingResult<InvoiceWithItems> {
        let invoice = self.owned_invoice(user_id, invoice_id).await?;
        if !matches!(
            invoice.status,
            InvoiceStatus::Open | InvoiceStatus::PaymentFailed
        ) {
            return Err(BillingError::InvalidInput(format!(
                "only open invoices can be sent (invoice is {})",
                invoice.status
            )));
        }

        let provider = self.provider_for(user_id).await?;
        let remote = provider.send_invoice(&invoice.provider_invoice_id).await?;
        let invoice = self.apply_remote(&invoice, &remote).await?;

        tracing::info!(invoice_id = invoice.id, "Invoice sent");
        self.with_items(invoice).await
    }

    /// Void an invoice at the provider. Voiding a void invoice is a no-op.
    pub async fn void_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> BillingResult<InvoiceWithItems> {
        let invoice = self.owned_invoice(user_id, invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Void => return self.with_items(invoice).await,
            InvoiceStatus::Paid | InvoiceStatus::Draft => {
                return Err(BillingError::InvalidInput(format!(
                    "a {} invoice cannot be voided",
                    invoice.status
                )));
            }
            InvoiceStatus::Open | InvoiceStatus::Uncollectible | InvoiceStatus::PaymentFailed => {}
        }

        let provider = self.provider_for(user_id).await?;
        let remote = provider.void_invoice(&invoice.provider_invoice_id).await?;
        let invoice = self.apply_remote(&invoice, &remote).await?;

        tracing::info!(invoice_id = invoice.id, status = %invoice.status, "Invoice voided");
        self.with_items(invoice).await
    }

    async fn apply_remote(
        &self,
        invoice: &InvoiceRecord,
        remote: &RemoteInvoice,
    ) -> BillingResult<InvoiceRecord> {
        match apply_guarded(&self.store, invoice, &InvoiceUpdate::from_remote(remote)).await? {
            ApplyOutcome::Applied(updated) => Ok(*updated),
            ApplyOutcome::Unchanged | ApplyOutcome::Stale => Ok(invoice.clone()),
        }
    }

    /// List the caller's invoices after refreshing the most recent unsettled ones.
    pub async fn list_invoices(
        &self,
        user_id: i64,
        query: &ListInvoicesQuery,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        match self
            .reconciliation
            .sync_recent_for_user(user_id, self.config.sync_on_read_limit)
            .await
        {
            Ok(report) if report.checked > 0 => {
                tracing::debug!(
                    user_id = user_id,
                    checked = report.checked,
                    updated = report.updated,
                    failed = report.failed,
                    "Read-path invoice sync"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(user_id = user_id, error = %e, "Read-path invoice sync skipped");
            }
        }

        let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0).max(0);
        self.store
            .list_invoices(user_id, query.status, limit, offset)
            .await
    }

    pub async fn get_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> BillingResult<InvoiceWithItems> {
        let invoice = self.owned_invoice(user_id, invoice_id).await?;
        self.with_items(invoice).await
    }
}
