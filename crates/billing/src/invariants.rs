//! Invoice invariants
//!
//! Read-only consistency checks over the local invoice mirror. Each check is
//! a single SQL query; violations carry enough context to find the row.
//! Checks can be scoped to one user (API health endpoint) or run across all
//! users (worker).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_id: i64,
    pub invoice_id: Option<i64>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money figures disagree
    High,
    Medium,
    /// Cosmetic or easily repaired by the next sync
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct TotalMismatchRow {
    invoice_id: i64,
    user_id: i64,
    total_cents: i64,
    items_total_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: i64,
    user_id: i64,
    provider_invoice_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SharedCustomerRow {
    user_id: i64,
    provider_customer_id: String,
    contact_count: i64,
}

const CHECKS: [&str; 5] = [
    "invoice_total_matches_items",
    "invoice_has_items",
    "paid_has_paid_at",
    "open_has_hosted_url",
    "customer_id_unique_per_user",
];

pub struct InvariantChecker {
    pool: SqlitePool,
}

impl InvariantChecker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn available_checks() -> &'static [&'static str] {
        &CHECKS
    }

    /// Run every check; `user_id = None` covers all users.
    pub async fn run_all_checks(&self, user_id: Option<i64>) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for check in CHECKS {
            violations.extend(self.run_check(check, user_id).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    pub async fn run_check(
        &self,
        name: &str,
        user_id: Option<i64>,
    ) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "invoice_total_matches_items" => self.check_total_matches_items(user_id).await,
            "invoice_has_items" => self.check_has_items(user_id).await,
            "paid_has_paid_at" => self.check_paid_has_paid_at(user_id).await,
            "open_has_hosted_url" => self.check_open_has_hosted_url(user_id).await,
            "customer_id_unique_per_user" => self.check_customer_id_unique(user_id).await,
            _ => Ok(vec![]),
        }
    }

    async fn check_total_matches_items(
        &self,
        user_id: Option<i64>,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TotalMismatchRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.user_id, i.total_cents,
                   SUM(it.total_cents) AS items_total_cents
            FROM invoices i
            JOIN invoice_items it ON it.invoice_id = i.id
            WHERE (? IS NULL OR i.user_id = ?)
            GROUP BY i.id
            HAVING SUM(it.total_cents) != i.total_cents
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_total_matches_items".to_string(),
                user_id: row.user_id,
                invoice_id: Some(row.invoice_id),
                description: format!(
                    "Invoice total {} differs from item sum {}",
                    row.total_cents, row.items_total_cents
                ),
                context: serde_json::json!({
                    "total_cents": row.total_cents,
                    "items_total_cents": row.items_total_cents,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_has_items(&self, user_id: Option<i64>) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT i.id AS invoice_id, i.user_id, i.provider_invoice_id
            FROM invoices i
            WHERE (? IS NULL OR i.user_id = ?)
              AND NOT EXISTS (SELECT 1 FROM invoice_items it WHERE it.invoice_id = i.id)
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_has_items".to_string(),
                user_id: row.user_id,
                invoice_id: Some(row.invoice_id),
                description: "Invoice has no line items".to_string(),
                context: serde_json::json!({ "provider_invoice_id": row.provider_invoice_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_paid_has_paid_at(
        &self,
        user_id: Option<i64>,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, user_id, provider_invoice_id
            FROM invoices
            WHERE (? IS NULL OR user_id = ?)
              AND status = 'paid' AND paid_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_paid_at".to_string(),
                user_id: row.user_id,
                invoice_id: Some(row.invoice_id),
                description: "Paid invoice has no payment timestamp".to_string(),
                context: serde_json::json!({ "provider_invoice_id": row.provider_invoice_id }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_open_has_hosted_url(
        &self,
        user_id: Option<i64>,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, user_id, provider_invoice_id
            FROM invoices
            WHERE (? IS NULL OR user_id = ?)
              AND status = 'open' AND (hosted_url IS NULL OR hosted_url = '')
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "open_has_hosted_url".to_string(),
                user_id: row.user_id,
                invoice_id: Some(row.invoice_id),
                description: "Open invoice has no hosted payment URL".to_string(),
                context: serde_json::json!({ "provider_invoice_id": row.provider_invoice_id }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_customer_id_unique(
        &self,
        user_id: Option<i64>,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedCustomerRow> = sqlx::query_as(
            r#"
            SELECT user_id, provider_customer_id, COUNT(*) AS contact_count
            FROM contacts
            WHERE (? IS NULL OR user_id = ?)
              AND provider_customer_id IS NOT NULL
            GROUP BY user_id, provider_customer_id
            HAVING COUNT(*) > 1
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "customer_id_unique_per_user".to_string(),
                user_id: row.user_id,
                invoice_id: None,
                description: format!(
                    "{} contacts share provider customer {}",
                    row.contact_count, row.provider_customer_id
                ),
                context: serde_json::json!({
                    "provider_customer_id": row.provider_customer_id,
                    "contact_count": row.contact_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
