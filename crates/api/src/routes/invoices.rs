//! Invoice routes
//!
//! Amounts cross this boundary as decimals in the invoice currency and are
//! stored as integer minor units.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use time::OffsetDateTime;
use watchdesk_billing::{
    CreateInvoiceRequest, InvariantCheckSummary, InvoiceItemRecord, InvoiceRecord,
    InvoiceWithItems, ListInvoicesQuery,
};
use watchdesk_shared::{from_minor_units, InvoiceStatus};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct InvoiceItemResponse {
    pub id: i64,
    pub watch_id: Option<i64>,
    pub description: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub total: f64,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    pub id: i64,
    pub contact_id: Option<i64>,
    pub provider: String,
    pub provider_invoice_id: String,
    pub provider_customer_id: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub total: f64,
    pub total_cents: i64,
    pub amount_paid: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub hosted_url: Option<String>,
    pub pdf_url: Option<String>,
    pub payment_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub last_payment_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<InvoiceItemResponse>>,
}

impl InvoiceItemResponse {
    fn from_record(item: InvoiceItemRecord, currency: &str) -> Self {
        Self {
            id: item.id,
            watch_id: item.watch_id,
            description: item.description,
            quantity: item.quantity,
            unit_price: from_minor_units(item.unit_price_cents, currency),
            total: from_minor_units(item.total_cents, currency),
        }
    }
}

impl From<InvoiceRecord> for InvoiceResponse {
    fn from(invoice: InvoiceRecord) -> Self {
        let currency = invoice.currency.as_str();
        Self {
            total: from_minor_units(invoice.total_cents, currency),
            amount_paid: invoice
                .amount_paid_cents
                .map(|cents| from_minor_units(cents, currency)),
            id: invoice.id,
            contact_id: invoice.contact_id,
            provider: invoice.provider,
            provider_invoice_id: invoice.provider_invoice_id,
            provider_customer_id: invoice.provider_customer_id,
            customer_email: invoice.customer_email,
            customer_name: invoice.customer_name,
            status: invoice.status,
            total_cents: invoice.total_cents,
            due_date: invoice.due_date,
            hosted_url: invoice.hosted_url,
            pdf_url: invoice.pdf_url,
            payment_reference: invoice.payment_reference,
            paid_at: invoice.paid_at,
            last_payment_error: invoice.last_payment_error,
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
            currency: invoice.currency,
            items: None,
        }
    }
}

impl From<InvoiceWithItems> for InvoiceResponse {
    fn from(value: InvoiceWithItems) -> Self {
        let currency = value.invoice.currency.clone();
        let items = value
            .items
            .into_iter()
            .map(|item| InvoiceItemResponse::from_record(item, &currency))
            .collect();
        let mut response = InvoiceResponse::from(value.invoice);
        response.items = Some(items);
        response
    }
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateInvoiceRequest>,
) -> ApiResult<(StatusCode, Json<InvoiceResponse>)> {
    let created = state
        .billing
        .invoices
        .create_invoice(auth_user.user_id, req)
        .await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListInvoicesQuery>,
) -> ApiResult<Json<Vec<InvoiceResponse>>> {
    let invoices = state
        .billing
        .invoices
        .list_invoices(auth_user.user_id, &query)
        .await?;
    Ok(Json(invoices.into_iter().map(InvoiceResponse::from).collect()))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<i64>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = state
        .billing
        .invoices
        .get_invoice(auth_user.user_id, invoice_id)
        .await?;
    Ok(Json(invoice.into()))
}

pub async fn send_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<i64>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = state
        .billing
        .invoices
        .send_invoice(auth_user.user_id, invoice_id)
        .await?;
    Ok(Json(invoice.into()))
}

pub async fn void_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<i64>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = state
        .billing
        .invoices
        .void_invoice(auth_user.user_id, invoice_id)
        .await?;
    Ok(Json(invoice.into()))
}

/// Consistency checks over the caller's invoices and contacts
pub async fn invoice_health(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state
        .billing
        .invariants
        .run_all_checks(Some(auth_user.user_id))
        .await?;

    if !summary.healthy {
        tracing::warn!(
            user_id = auth_user.user_id,
            violations = summary.violations.len(),
            "Invoice health check found violations"
        );
    }
    Ok(Json(summary))
}
