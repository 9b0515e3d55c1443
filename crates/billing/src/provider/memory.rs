//! In-process payment provider
//!
//! Behaves like a minimal Stripe: customers, invoices with line items, the
//! draft → open → paid/void lifecycle and hosted URLs. Failures can be injected
//! at any step so callers can exercise partial-failure paths.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;
use watchdesk_shared::InvoiceStatus;

use super::{
    NewRemoteCustomer, NewRemoteInvoice, NewRemoteInvoiceItem, PaymentProvider, RemoteCustomer,
    RemoteInvoice,
};
use crate::error::{BillingError, BillingResult};

/// Provider call that should fail on its next invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateCustomer,
    CreateInvoice,
    AddInvoiceItem,
    FinalizeInvoice,
    SendInvoice,
    VoidInvoice,
    RetrieveInvoice,
}

#[derive(Debug, Clone)]
struct StoredInvoice {
    remote: RemoteInvoice,
    days_until_due: u32,
    sent: bool,
}

#[derive(Default)]
struct State {
    customers: HashMap<String, RemoteCustomer>,
    invoices: HashMap<String, StoredInvoice>,
    failures: HashMap<FailPoint, String>,
    create_customer_calls: usize,
    retrieve_invoice_calls: usize,
}

#[derive(Default)]
pub struct InMemoryProvider {
    state: RwLock<State>,
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call at `point` fail with a provider error.
    pub async fn fail_next(&self, point: FailPoint, message: &str) {
        self.state
            .write()
            .await
            .failures
            .insert(point, message.to_string());
    }

    pub async fn insert_customer(&self, email: &str, name: Option<&str>) -> RemoteCustomer {
        let customer = RemoteCustomer {
            id: new_id("cus"),
            email: Some(email.to_string()),
            name: name.map(str::to_string),
        };
        self.state
            .write()
            .await
            .customers
            .insert(customer.id.clone(), customer.clone());
        customer
    }

    pub async fn delete_customer(&self, customer_id: &str) {
        self.state.write().await.customers.remove(customer_id);
    }

    pub async fn customer_count(&self) -> usize {
        self.state.read().await.customers.len()
    }

    pub async fn create_customer_calls(&self) -> usize {
        self.state.read().await.create_customer_calls
    }

    pub async fn retrieve_invoice_calls(&self) -> usize {
        self.state.read().await.retrieve_invoice_calls
    }

    pub async fn invoice_count(&self) -> usize {
        self.state.read().await.invoices.len()
    }

    pub async fn invoice(&self, invoice_id: &str) -> Option<RemoteInvoice> {
        self.state
            .read()
            .await
            .invoices
            .get(invoice_id)
            .map(|s| s.remote.clone())
    }

    pub async fn was_sent(&self, invoice_id: &str) -> bool {
        self.state
            .read()
            .await
            .invoices
            .get(invoice_id)
            .map(|s| s.sent)
            .unwrap_or(false)
    }

    /// Simulate the customer paying on the hosted page.
    pub async fn mark_paid(&self, invoice_id: &str, paid_at: OffsetDateTime) -> Option<RemoteInvoice> {
        let mut state = self.state.write().await;
        let stored = state.invoices.get_mut(invoice_id)?;
        stored.remote.status = InvoiceStatus::Paid;
        stored.remote.amount_paid_cents = Some(stored.remote.total_cents);
        stored.remote.paid_at = Some(paid_at);
        Some(stored.remote.clone())
    }

    pub async fn set_status(&self, invoice_id: &str, status: InvoiceStatus) -> Option<RemoteInvoice> {
        let mut state = self.state.write().await;
        let stored = state.invoices.get_mut(invoice_id)?;
        stored.remote.status = status;
        Some(stored.remote.clone())
    }

    fn take_failure(state: &mut State, point: FailPoint) -> BillingResult<()> {
        match state.failures.remove(&point) {
            Some(message) => Err(BillingError::Provider(message)),
            None => Ok(()),
        }
    }

    fn invoice_mut<'a>(
        state: &'a mut State,
        invoice_id: &str,
    ) -> BillingResult<&'a mut StoredInvoice> {
        state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| BillingError::Provider(format!("No such invoice: '{}'", invoice_id)))
    }
}

#[async_trait]
impl PaymentProvider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<RemoteCustomer>> {
        Ok(self.state.read().await.customers.get(customer_id).cloned())
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<RemoteCustomer>> {
        let state = self.state.read().await;
        Ok(state
            .customers
            .values()
            .find(|c| {
                c.email
                    .as_deref()
                    .map(|e| e.eq_ignore_ascii_case(email))
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn create_customer(&self, params: NewRemoteCustomer) -> BillingResult<RemoteCustomer> {
        let mut state = self.state.write().await;
        state.create_customer_calls += 1;
        Self::take_failure(&mut state, FailPoint::CreateCustomer)?;

        let customer = RemoteCustomer {
            id: new_id("cus"),
            email: Some(params.email),
            name: params.name,
        };
        state
            .customers
            .insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn create_invoice(&self, params: NewRemoteInvoice) -> BillingResult<RemoteInvoice> {
        let mut state = self.state.write().await;
        Self::take_failure(&mut state, FailPoint::CreateInvoice)?;

        if !state.customers.contains_key(&params.customer_id) {
            return Err(BillingError::Provider(format!(
                "No such customer: '{}'",
                params.customer_id
            )));
        }

        let remote = RemoteInvoice {
            id: new_id("in"),
            customer_id: Some(params.customer_id),
            status: InvoiceStatus::Draft,
            total_cents: 0,
            amount_paid_cents: None,
            currency: params.currency.to_ascii_lowercase(),
            hosted_url: None,
            pdf_url: None,
            payment_reference: None,
            due_date: None,
            paid_at: None,
        };
        state.invoices.insert(
            remote.id.clone(),
            StoredInvoice {
                remote: remote.clone(),
                days_until_due: params.days_until_due,
                sent: false,
            },
        );
        Ok(remote)
    }

    async fn add_invoice_item(
        &self,
        _customer_id: &str,
        invoice_id: &str,
        item: NewRemoteInvoiceItem,
    ) -> BillingResult<()> {
        let mut state = self.state.write().await;
        Self::take_failure(&mut state, FailPoint::AddInvoiceItem)?;

        let stored = Self::invoice_mut(&mut state, invoice_id)?;
        if stored.remote.status != InvoiceStatus::Draft {
            return Err(BillingError::Provider(
                "Invoice items can only be added to draft invoices".to_string(),
            ));
        }
        let line_total = item
            .unit_amount_cents
            .checked_mul(item.quantity as i64)
            .ok_or_else(|| BillingError::Provider("Invoice item amount overflow".to_string()))?;
        stored.remote.total_cents += line_total;
        Ok(())
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let mut state = self.state.write().await;
        Self::take_failure(&mut state, FailPoint::FinalizeInvoice)?;

        let stored = Self::invoice_mut(&mut state, invoice_id)?;
        if stored.remote.status != InvoiceStatus::Draft {
            return Err(BillingError::Provider(format!(
                "Invoice is already {}",
                stored.remote.status
            )));
        }
        let now = OffsetDateTime::now_utc();
        stored.remote.status = InvoiceStatus::Open;
        stored.remote.due_date = Some(now + Duration::days(i64::from(stored.days_until_due)));
        stored.remote.hosted_url = Some(format!("https://invoice.example.test/i/{}", invoice_id));
        stored.remote.pdf_url = Some(format!("https://invoice.example.test/i/{}/pdf", invoice_id));
        stored.remote.payment_reference = Some(new_id("pi"));
        Ok(stored.remote.clone())
    }

    async fn send_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let mut state = self.state.write().await;
        Self::take_failure(&mut state, FailPoint::SendInvoice)?;

        let stored = Self::invoice_mut(&mut state, invoice_id)?;
        if stored.remote.status != InvoiceStatus::Open {
            return Err(BillingError::Provider(format!(
                "Only open invoices can be sent (invoice is {})",
                stored.remote.status
            )));
        }
        stored.sent = true;
        Ok(stored.remote.clone())
    }

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let mut state = self.state.write().await;
        Self::take_failure(&mut state, FailPoint::VoidInvoice)?;

        let stored = Self::invoice_mut(&mut state, invoice_id)?;
        match stored.remote.status {
            InvoiceStatus::Open | InvoiceStatus::Uncollectible | InvoiceStatus::PaymentFailed => {
                stored.remote.status = InvoiceStatus::Void;
                Ok(stored.remote.clone())
            }
            other => Err(BillingError::Provider(format!(
                "Invoice in status {} cannot be voided",
                other
            ))),
        }
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let mut state = self.state.write().await;
        state.retrieve_invoice_calls += 1;
        Self::take_failure(&mut state, FailPoint::RetrieveInvoice)?;

        Self::invoice_mut(&mut state, invoice_id).map(|s| s.remote.clone())
    }
}
