//! Stripe-backed [`PaymentProvider`]

use async_trait::async_trait;
use stripe::{
    CollectionMethod, CreateCustomer, CreateInvoice, CreateInvoiceItem, Currency, Customer,
    CustomerId, Expandable, Invoice, InvoiceId, InvoiceItem, ListCustomers,
};
use time::OffsetDateTime;

use super::{
    status_from_provider, NewRemoteCustomer, NewRemoteInvoice, NewRemoteInvoiceItem,
    PaymentProvider, RemoteCustomer, RemoteInvoice,
};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID '{}': {}", id, e)))
}

fn parse_invoice_id(id: &str) -> BillingResult<InvoiceId> {
    id.parse::<InvoiceId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid invoice ID '{}': {}", id, e)))
}

fn parse_currency(code: &str) -> BillingResult<Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_ascii_lowercase()))
        .map_err(|_| BillingError::InvalidInput(format!("Unsupported currency: {}", code)))
}

fn timestamp(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

fn remote_customer(customer: Customer) -> RemoteCustomer {
    RemoteCustomer {
        id: customer.id.to_string(),
        email: customer.email,
        name: customer.name,
    }
}

fn remote_invoice(invoice: Invoice) -> RemoteInvoice {
    let customer_id = match &invoice.customer {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(c)) => Some(c.id.to_string()),
        None => None,
    };
    let payment_reference = match &invoice.payment_intent {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(pi)) => Some(pi.id.to_string()),
        None => None,
    };
    let status = invoice
        .status
        .map(|s| status_from_provider(s.as_str()))
        .unwrap_or(watchdesk_shared::InvoiceStatus::Draft);
    let paid_at = invoice
        .status_transitions
        .as_ref()
        .and_then(|t| timestamp(t.paid_at));

    RemoteInvoice {
        id: invoice.id.to_string(),
        customer_id,
        status,
        total_cents: invoice.total.unwrap_or(0),
        amount_paid_cents: invoice.amount_paid,
        currency: invoice
            .currency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string()),
        hosted_url: invoice.hosted_invoice_url,
        pdf_url: invoice.invoice_pdf,
        payment_reference,
        due_date: timestamp(invoice.due_date),
        paid_at,
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<RemoteCustomer>> {
        let id = parse_customer_id(customer_id)?;
        match Customer::retrieve(self.stripe.inner(), &id, &[]).await {
            Ok(customer) if customer.deleted => {
                tracing::info!(customer_id = %customer_id, "Stored Stripe customer was deleted");
                Ok(None)
            }
            Ok(customer) => Ok(Some(remote_customer(customer))),
            Err(stripe::StripeError::Stripe(req)) if req.http_status == 404 => {
                tracing::info!(customer_id = %customer_id, "Stored Stripe customer no longer exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<RemoteCustomer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = Customer::list(self.stripe.inner(), &params).await?;
        Ok(customers
            .data
            .into_iter()
            .find(|c| !c.deleted)
            .map(remote_customer))
    }

    async fn create_customer(&self, params: NewRemoteCustomer) -> BillingResult<RemoteCustomer> {
        let create = CreateCustomer {
            email: Some(&params.email),
            name: params.name.as_deref(),
            metadata: Some(params.metadata.clone()),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), create).await?;

        tracing::info!(
            customer_id = %customer.id,
            "Created new Stripe customer"
        );

        Ok(remote_customer(customer))
    }

    async fn create_invoice(&self, params: NewRemoteInvoice) -> BillingResult<RemoteInvoice> {
        let mut create = CreateInvoice::new();
        create.customer = Some(parse_customer_id(&params.customer_id)?);
        create.currency = Some(parse_currency(&params.currency)?);
        create.auto_advance = Some(false);
        create.collection_method = Some(CollectionMethod::SendInvoice);
        create.days_until_due = Some(params.days_until_due);
        create.description = params.description.as_deref();
        create.metadata = Some(params.metadata.clone());

        let invoice = Invoice::create(self.stripe.inner(), create).await?;
        Ok(remote_invoice(invoice))
    }

    async fn add_invoice_item(
        &self,
        customer_id: &str,
        invoice_id: &str,
        item: NewRemoteInvoiceItem,
    ) -> BillingResult<()> {
        let mut create = CreateInvoiceItem::new(parse_customer_id(customer_id)?);
        create.invoice = Some(parse_invoice_id(invoice_id)?);
        create.description = Some(&item.description);
        create.quantity = Some(item.quantity);
        create.unit_amount = Some(item.unit_amount_cents);
        create.currency = Some(parse_currency(&item.currency)?);

        InvoiceItem::create(self.stripe.inner(), create).await?;
        Ok(())
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let id = parse_invoice_id(invoice_id)?;
        let invoice = Invoice::finalize(self.stripe.inner(), &id, Default::default()).await?;
        Ok(remote_invoice(invoice))
    }

    async fn send_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        // Not wrapped by the SDK
        let invoice: Invoice = self
            .stripe
            .post_form(&format!("invoices/{}/send", invoice_id), &[])
            .await?;
        Ok(remote_invoice(invoice))
    }

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let invoice: Invoice = self
            .stripe
            .post_form(&format!("invoices/{}/void", invoice_id), &[])
            .await?;
        Ok(remote_invoice(invoice))
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<RemoteInvoice> {
        let id = parse_invoice_id(invoice_id)?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &id, &[]).await?;
        Ok(remote_invoice(invoice))
    }
}
