//! Database access for users, contacts, invoices and promo signups
//!
//! Every query is scoped by `user_id` unless it is only reachable from the
//! webhook receiver or the worker, which look rows up by provider ids.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use time::OffsetDateTime;
use watchdesk_shared::InvoiceStatus;

use crate::error::BillingResult;
use crate::provider::RemoteInvoice;

const INVOICE_COLUMNS: &str = "id, user_id, contact_id, provider, provider_invoice_id, \
     provider_customer_id, customer_email, customer_name, status, total_cents, currency, \
     due_date, hosted_url, pdf_url, payment_reference, amount_paid_cents, paid_at, \
     last_payment_error, created_at, updated_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ContactRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub provider_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Local mirror of a provider invoice
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct InvoiceRecord {
    pub id: i64,
    pub user_id: i64,
    pub contact_id: Option<i64>,
    pub provider: String,
    pub provider_invoice_id: String,
    pub provider_customer_id: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub status: InvoiceStatus,
    pub total_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub hosted_url: Option<String>,
    pub pdf_url: Option<String>,
    pub payment_reference: Option<String>,
    pub amount_paid_cents: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub last_payment_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct InvoiceItemRecord {
    pub id: i64,
    pub invoice_id: i64,
    pub watch_id: Option<i64>,
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone)]
pub struct NewInvoiceItem {
    pub watch_id: Option<i64>,
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub total_cents: i64,
}

/// Row data for a freshly created provider invoice. The local total is
/// derived from `items`.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub user_id: i64,
    pub contact_id: Option<i64>,
    pub provider: String,
    pub provider_customer_id: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub remote: RemoteInvoice,
    pub items: Vec<NewInvoiceItem>,
}

/// Fields a reconciliation pass may overwrite; `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceUpdate {
    pub status: Option<InvoiceStatus>,
    pub amount_paid_cents: Option<i64>,
    pub paid_at: Option<OffsetDateTime>,
    pub hosted_url: Option<String>,
    pub pdf_url: Option<String>,
    pub payment_reference: Option<String>,
    pub last_payment_error: Option<String>,
}

impl InvoiceUpdate {
    pub fn from_remote(remote: &RemoteInvoice) -> Self {
        Self {
            status: Some(remote.status),
            amount_paid_cents: remote.amount_paid_cents.filter(|_| remote.status == InvoiceStatus::Paid),
            paid_at: remote.paid_at,
            hosted_url: remote.hosted_url.clone(),
            pdf_url: remote.pdf_url.clone(),
            payment_reference: remote.payment_reference.clone(),
            last_payment_error: None,
        }
    }

    /// Settling to `paid` or going back to `open` drops any recorded failure.
    pub fn clears_payment_error(&self) -> bool {
        self.last_payment_error.is_none()
            && matches!(self.status, Some(InvoiceStatus::Paid | InvoiceStatus::Open))
    }

    /// Whether applying this update would change `current`.
    pub fn differs_from(&self, current: &InvoiceRecord) -> bool {
        fn changes<T: PartialEq>(new: &Option<T>, old: &T) -> bool {
            new.as_ref().map(|n| n != old).unwrap_or(false)
        }
        fn changes_opt<T: PartialEq>(new: &Option<T>, old: &Option<T>) -> bool {
            new.is_some() && new != old
        }

        changes(&self.status, &current.status)
            || changes_opt(&self.amount_paid_cents, &current.amount_paid_cents)
            || changes_opt(&self.paid_at, &current.paid_at)
            || changes_opt(&self.hosted_url, &current.hosted_url)
            || changes_opt(&self.pdf_url, &current.pdf_url)
            || changes_opt(&self.payment_reference, &current.payment_reference)
            || changes_opt(&self.last_payment_error, &current.last_payment_error)
            || (self.clears_payment_error() && current.last_payment_error.is_some())
    }
}

/// Account fields the billing flows need
#[derive(Debug, Clone, FromRow)]
pub struct BillingUser {
    pub id: i64,
    pub email: String,
    pub stripe_secret_key: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserCredentials {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
}

#[derive(Clone)]
pub struct InvoiceStore {
    pool: SqlitePool,
}

impl InvoiceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- users ----

    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        stripe_secret_key: Option<&str>,
    ) -> BillingResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (email, password_hash, stripe_secret_key, created_at) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(email.trim().to_lowercase())
        .bind(password_hash)
        .bind(stripe_secret_key)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn find_credentials(&self, email: &str) -> BillingResult<Option<UserCredentials>> {
        let user = sqlx::query_as::<_, UserCredentials>(
            "SELECT id, email, password_hash FROM users WHERE email = ?",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn billing_user(&self, user_id: i64) -> BillingResult<Option<BillingUser>> {
        let user = sqlx::query_as::<_, BillingUser>(
            "SELECT id, email, stripe_secret_key FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    // ---- contacts ----

    pub async fn create_contact(
        &self,
        user_id: i64,
        contact: NewContact,
    ) -> BillingResult<ContactRecord> {
        let now = OffsetDateTime::now_utc();
        let record = sqlx::query_as::<_, ContactRecord>(
            "INSERT INTO contacts (user_id, name, email, phone, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING id, user_id, name, email, phone, provider_customer_id, created_at, updated_at",
        )
        .bind(user_id)
        .bind(&contact.name)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_contacts(&self, user_id: i64) -> BillingResult<Vec<ContactRecord>> {
        let contacts = sqlx::query_as::<_, ContactRecord>(
            "SELECT id, user_id, name, email, phone, provider_customer_id, created_at, updated_at \
             FROM contacts WHERE user_id = ? ORDER BY name COLLATE NOCASE, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(contacts)
    }

    pub async fn get_contact(
        &self,
        user_id: i64,
        contact_id: i64,
    ) -> BillingResult<Option<ContactRecord>> {
        let contact = sqlx::query_as::<_, ContactRecord>(
            "SELECT id, user_id, name, email, phone, provider_customer_id, created_at, updated_at \
             FROM contacts WHERE id = ? AND user_id = ?",
        )
        .bind(contact_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    pub async fn set_contact_customer_id(
        &self,
        contact_id: i64,
        customer_id: &str,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE contacts SET provider_customer_id = ?, updated_at = ? WHERE id = ?")
            .bind(customer_id)
            .bind(OffsetDateTime::now_utc())
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- invoices ----

    /// Insert the invoice row and all of its items in one transaction.
    pub async fn insert_invoice(&self, new: NewInvoice) -> BillingResult<InvoiceRecord> {
        let now = OffsetDateTime::now_utc();
        let total_cents: i64 = new.items.iter().map(|i| i.total_cents).sum();

        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "INSERT INTO invoices (user_id, contact_id, provider, provider_invoice_id, \
                 provider_customer_id, customer_email, customer_name, status, total_cents, \
                 currency, due_date, hosted_url, pdf_url, payment_reference, amount_paid_cents, \
                 paid_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {}",
            INVOICE_COLUMNS
        ))
        .bind(new.user_id)
        .bind(new.contact_id)
        .bind(&new.provider)
        .bind(&new.remote.id)
        .bind(&new.provider_customer_id)
        .bind(&new.customer_email)
        .bind(&new.customer_name)
        .bind(new.remote.status)
        .bind(total_cents)
        .bind(&new.remote.currency)
        .bind(new.remote.due_date)
        .bind(&new.remote.hosted_url)
        .bind(&new.remote.pdf_url)
        .bind(&new.remote.payment_reference)
        .bind(new.remote.amount_paid_cents.filter(|_| new.remote.status == InvoiceStatus::Paid))
        .bind(new.remote.paid_at)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for item in &new.items {
            sqlx::query(
                "INSERT INTO invoice_items (invoice_id, watch_id, description, quantity, \
                     unit_price_cents, total_cents, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.id)
            .bind(item.watch_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.total_cents)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    pub async fn get_invoice(
        &self,
        user_id: i64,
        invoice_id: i64,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let invoice = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices WHERE id = ? AND user_id = ?",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    pub async fn get_invoice_unscoped(&self, invoice_id: i64) -> BillingResult<Option<InvoiceRecord>> {
        let invoice = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices WHERE id = ?",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    pub async fn invoice_items(&self, invoice_id: i64) -> BillingResult<Vec<InvoiceItemRecord>> {
        let items = sqlx::query_as::<_, InvoiceItemRecord>(
            "SELECT id, invoice_id, watch_id, description, quantity, unit_price_cents, total_cents \
             FROM invoice_items WHERE invoice_id = ? ORDER BY id",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn list_invoices(
        &self,
        user_id: i64,
        status: Option<InvoiceStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let invoices = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices \
             WHERE user_id = ? AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            INVOICE_COLUMNS
        ))
        .bind(user_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    /// Most recently created invoices of one user that may still change remotely.
    pub async fn recent_unsettled(
        &self,
        user_id: i64,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let invoices = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices \
             WHERE user_id = ? AND status NOT IN ('paid', 'void') \
             ORDER BY created_at DESC, id DESC LIMIT ?",
            INVOICE_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    /// Unsettled invoices across all users, least recently touched first.
    pub async fn stale_unsettled(&self, limit: i64) -> BillingResult<Vec<InvoiceRecord>> {
        let invoices = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices \
             WHERE status NOT IN ('paid', 'void') \
             ORDER BY updated_at ASC, id ASC LIMIT ?",
            INVOICE_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    pub async fn find_by_provider_invoice_id(
        &self,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let invoice = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices WHERE provider_invoice_id = ?",
            INVOICE_COLUMNS
        ))
        .bind(provider_invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    pub async fn find_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> BillingResult<Option<InvoiceRecord>> {
        let invoice = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoices WHERE payment_reference = ? ORDER BY id DESC LIMIT 1",
            INVOICE_COLUMNS
        ))
        .bind(payment_reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    /// Write the `Some` fields of `update` and return the refreshed row.
    pub async fn apply_update(
        &self,
        invoice_id: i64,
        update: &InvoiceUpdate,
    ) -> BillingResult<InvoiceRecord> {
        let record = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "UPDATE invoices SET \
                 status = COALESCE(?, status), \
                 amount_paid_cents = COALESCE(?, amount_paid_cents), \
                 paid_at = COALESCE(?, paid_at), \
                 hosted_url = COALESCE(?, hosted_url), \
                 pdf_url = COALESCE(?, pdf_url), \
                 payment_reference = COALESCE(?, payment_reference), \
                 last_payment_error = CASE WHEN ? THEN NULL ELSE COALESCE(?, last_payment_error) END, \
                 updated_at = ? \
             WHERE id = ? \
             RETURNING {}",
            INVOICE_COLUMNS
        ))
        .bind(update.status)
        .bind(update.amount_paid_cents)
        .bind(update.paid_at)
        .bind(&update.hosted_url)
        .bind(&update.pdf_url)
        .bind(&update.payment_reference)
        .bind(update.clears_payment_error())
        .bind(&update.last_payment_error)
        .bind(OffsetDateTime::now_utc())
        .bind(invoice_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    // ---- promo signups ----

    /// Record a promo signup; returns `false` when the email was already on the list.
    pub async fn insert_promo_signup(
        &self,
        email: &str,
        source: Option<&str>,
        ip_address: Option<&str>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "INSERT INTO promo_signups (email, source, ip_address, created_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT(email) DO NOTHING",
        )
        .bind(email.trim().to_lowercase())
        .bind(source)
        .bind(ip_address)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
