//! Scheduled job bodies, kept free of scheduler plumbing so they can be
//! driven directly.

use tracing::{error, info, warn};
use watchdesk_billing::{BillingService, InvariantCheckSummary, SyncReport, ViolationSeverity};

/// Pull provider state for the oldest-updated unsettled invoices.
pub async fn reconcile_open_invoices(billing: &BillingService, batch_size: i64) -> Option<SyncReport> {
    match billing.reconciliation.sync_stale(batch_size).await {
        Ok(report) => {
            if report.failed > 0 {
                warn!(
                    checked = report.checked,
                    updated = report.updated,
                    failed = report.failed,
                    "Invoice reconciliation finished with failures"
                );
            } else {
                info!(
                    checked = report.checked,
                    updated = report.updated,
                    "Invoice reconciliation complete"
                );
            }
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "Invoice reconciliation failed");
            None
        }
    }
}

/// Run every invariant check across all users and log what was found.
pub async fn check_invariants(billing: &BillingService) -> Option<InvariantCheckSummary> {
    match billing.invariants.run_all_checks(None).await {
        Ok(summary) => {
            log_invariant_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant check run failed");
            None
        }
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Invariant check cycle complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                user_id = violation.user_id,
                invoice_id = ?violation.invoice_id,
                severity = %violation.severity,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                user_id = violation.user_id,
                invoice_id = ?violation.invoice_id,
                severity = %violation.severity,
                "{}",
                violation.description
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::OffsetDateTime;
    use watchdesk_billing::{
        BillingConfig, CreateInvoiceItemRequest, CreateInvoiceRequest, InMemoryProvider,
        PaymentProviders, ProviderKind,
    };
    use watchdesk_shared::{create_memory_pool, InvoiceStatus};

    use super::*;

    async fn billing() -> (BillingService, Arc<InMemoryProvider>, i64) {
        let pool = create_memory_pool().await.unwrap();
        let provider = Arc::new(InMemoryProvider::new());
        let config = BillingConfig {
            provider: ProviderKind::InMemory,
            ..Default::default()
        };
        let billing =
            BillingService::with_providers(config, PaymentProviders::InMemory(provider.clone()), pool);
        let user_id = billing
            .store
            .create_user("dealer@example.com", "hash", None)
            .await
            .unwrap();
        (billing, provider, user_id)
    }

    fn request(email: &str) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            contact_id: None,
            customer_email: Some(email.to_string()),
            customer_name: None,
            currency: None,
            due_in_days: None,
            description: None,
            items: vec![CreateInvoiceItemRequest {
                description: "Tudor Black Bay 58".to_string(),
                quantity: 1,
                unit_price: 3900.0,
                watch_id: None,
            }],
        }
    }

    #[tokio::test]
    async fn reconcile_pulls_payment_made_outside_webhooks() {
        let (billing, provider, user_id) = billing().await;
        let created = billing
            .invoices
            .create_invoice(user_id, request("buyer@example.com"))
            .await
            .unwrap();
        provider
            .mark_paid(&created.invoice.provider_invoice_id, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let report = reconcile_open_invoices(&billing, 50).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.updated, 1);

        let invoice = billing
            .store
            .get_invoice(user_id, created.invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn invariant_job_flags_total_mismatch() {
        let (billing, _provider, user_id) = billing().await;
        let created = billing
            .invoices
            .create_invoice(user_id, request("buyer@example.com"))
            .await
            .unwrap();

        let summary = check_invariants(&billing).await.unwrap();
        assert!(summary.healthy);

        sqlx::query("UPDATE invoices SET total_cents = total_cents + 1 WHERE id = ?")
            .bind(created.invoice.id)
            .execute(billing.store.pool())
            .await
            .unwrap();

        let summary = check_invariants(&billing).await.unwrap();
        assert!(!summary.healthy);
        assert!(summary
            .violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::High
                && v.invoice_id == Some(created.invoice.id)));
    }
}
