// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Drives the full billing service against an in-memory SQLite database and
//! the in-memory provider:
//! - Invoice creation and customer resolution
//! - Webhook status reconciliation and the ledger
//! - Read-path and scheduled pull sync
//! - Send/void actions

use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use watchdesk_shared::{create_memory_pool, InvoiceStatus};

use crate::client::{BillingConfig, ProviderKind, StripeConfig};
use crate::error::BillingError;
use crate::invoices::{CreateInvoiceItemRequest, CreateInvoiceRequest, ListInvoicesQuery};
use crate::provider::{FailPoint, InMemoryProvider, PaymentProviders};
use crate::store::{InvoiceRecord, NewContact};
use crate::webhooks::{WebhookEvent, WebhookOutcome};
use crate::BillingService;

const WEBHOOK_SECRET: &str = "whsec_edge_case_tests";

struct Harness {
    billing: BillingService,
    provider: Arc<InMemoryProvider>,
    user_id: i64,
}

async fn harness_with(config: BillingConfig) -> Harness {
    let pool = create_memory_pool().await.unwrap();
    let provider = Arc::new(InMemoryProvider::new());
    let billing = BillingService::with_providers(
        config,
        PaymentProviders::InMemory(provider.clone()),
        pool,
    );
    let user_id = billing
        .store
        .create_user("dealer@example.com", "hash", None)
        .await
        .unwrap();
    Harness {
        billing,
        provider,
        user_id,
    }
}

fn config() -> BillingConfig {
    BillingConfig {
        provider: ProviderKind::InMemory,
        stripe: StripeConfig {
            secret_key: None,
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            allow_unsigned_webhooks: false,
        },
        ..Default::default()
    }
}

async fn harness() -> Harness {
    harness_with(config()).await
}

fn rolex_request(contact_id: Option<i64>) -> CreateInvoiceRequest {
    CreateInvoiceRequest {
        contact_id,
        customer_email: None,
        customer_name: None,
        currency: None,
        due_in_days: None,
        description: None,
        items: vec![CreateInvoiceItemRequest {
            description: "Rolex Submariner 126610LN".to_string(),
            quantity: 1,
            unit_price: 13500.00,
            watch_id: None,
        }],
    }
}

fn manual_request(email: &str) -> CreateInvoiceRequest {
    CreateInvoiceRequest {
        customer_email: Some(email.to_string()),
        ..rolex_request(None)
    }
}

async fn buyer_contact(h: &Harness) -> i64 {
    h.billing
        .store
        .create_contact(
            h.user_id,
            NewContact {
                name: "Buyer".to_string(),
                email: Some("buyer@example.com".to_string()),
                phone: None,
            },
        )
        .await
        .unwrap()
        .id
}

async fn created_invoice(h: &Harness) -> InvoiceRecord {
    h.billing
        .invoices
        .create_invoice(h.user_id, manual_request("buyer@example.com"))
        .await
        .unwrap()
        .invoice
}

fn event_payload(id: &str, event_type: &str, created: i64, object: serde_json::Value) -> String {
    json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object },
    })
    .to_string()
}

async fn deliver(h: &Harness, payload: &str) -> WebhookOutcome {
    let event = WebhookEvent::parse(payload).unwrap();
    h.billing.webhooks.handle_event(payload, &event).await.unwrap()
}

async fn ledger_result(h: &Harness, event_id: &str) -> String {
    let (result,): (String,) =
        sqlx::query_as("SELECT processing_result FROM webhook_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_one(h.billing.store.pool())
            .await
            .unwrap();
    result
}

#[cfg(test)]
mod creation_tests {
    use super::*;

    // =========================================================================
    // Contact invoice for a single watch lands open with a hosted URL
    // =========================================================================
    #[tokio::test]
    async fn test_rolex_invoice_for_contact() {
        let h = harness().await;
        let contact_id = buyer_contact(&h).await;

        let created = h
            .billing
            .invoices
            .create_invoice(h.user_id, rolex_request(Some(contact_id)))
            .await
            .unwrap();

        assert_eq!(created.invoice.total_cents, 1_350_000);
        assert_eq!(created.invoice.status, InvoiceStatus::Open);
        assert!(created
            .invoice
            .hosted_url
            .as_deref()
            .map(|u| !u.is_empty())
            .unwrap_or(false));
        assert_eq!(created.invoice.contact_id, Some(contact_id));
        assert_eq!(created.items.len(), 1);
        assert_eq!(
            created.items.iter().map(|i| i.total_cents).sum::<i64>(),
            created.invoice.total_cents
        );

        let remote = h
            .provider
            .invoice(&created.invoice.provider_invoice_id)
            .await
            .unwrap();
        assert_eq!(remote.total_cents, 1_350_000);
        assert!(h.provider.was_sent(&remote.id).await);
    }

    // =========================================================================
    // Stored customer id is reused; no second remote customer
    // =========================================================================
    #[tokio::test]
    async fn test_second_invoice_reuses_stored_customer() {
        let h = harness().await;
        let contact_id = buyer_contact(&h).await;

        let first = h
            .billing
            .invoices
            .create_invoice(h.user_id, rolex_request(Some(contact_id)))
            .await
            .unwrap();
        let second = h
            .billing
            .invoices
            .create_invoice(h.user_id, rolex_request(Some(contact_id)))
            .await
            .unwrap();

        assert_eq!(h.provider.create_customer_calls().await, 1);
        assert_eq!(
            first.invoice.provider_customer_id,
            second.invoice.provider_customer_id
        );
        let contact = h
            .billing
            .store
            .get_contact(h.user_id, contact_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            contact.provider_customer_id,
            Some(first.invoice.provider_customer_id)
        );
    }

    // =========================================================================
    // Existing remote customer with the same email is adopted
    // =========================================================================
    #[tokio::test]
    async fn test_remote_email_match_is_adopted() {
        let h = harness().await;
        let existing = h.provider.insert_customer("buyer@example.com", None).await;
        let contact_id = buyer_contact(&h).await;

        let created = h
            .billing
            .invoices
            .create_invoice(h.user_id, rolex_request(Some(contact_id)))
            .await
            .unwrap();

        assert_eq!(created.invoice.provider_customer_id, existing.id);
        assert_eq!(h.provider.create_customer_calls().await, 0);
    }

    // =========================================================================
    // Provider failure mid-flow: error surfaced, nothing persisted locally
    // =========================================================================
    #[tokio::test]
    async fn test_finalize_failure_leaves_no_local_row() {
        let h = harness().await;
        h.provider
            .fail_next(FailPoint::FinalizeInvoice, "card_declined")
            .await;

        let err = h
            .billing
            .invoices
            .create_invoice(h.user_id, manual_request("buyer@example.com"))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BillingError::Provider(ref m) if m == "card_declined"));
        let local = h
            .billing
            .store
            .list_invoices(h.user_id, None, 50, 0)
            .await
            .unwrap();
        assert!(local.is_empty());
        // the draft created before the failure stays at the provider
        assert_eq!(h.provider.invoice_count().await, 1);
    }

    #[tokio::test]
    async fn test_foreign_contact_is_not_found() {
        let h = harness().await;
        let contact_id = buyer_contact(&h).await;
        let other = h
            .billing
            .store
            .create_user("other@example.com", "hash", None)
            .await
            .unwrap();

        let err = h
            .billing
            .invoices
            .create_invoice(other, rolex_request(Some(contact_id)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert_eq!(h.provider.create_customer_calls().await, 0);
    }

    #[tokio::test]
    async fn test_missing_stripe_key_reports_remediation() {
        let pool = create_memory_pool().await.unwrap();
        let billing = BillingService::with_providers(
            BillingConfig::default(),
            PaymentProviders::Stripe {
                fallback_secret_key: None,
            },
            pool,
        );
        let user_id = billing
            .store
            .create_user("dealer@example.com", "hash", None)
            .await
            .unwrap();

        let err = billing
            .invoices
            .create_invoice(user_id, manual_request("buyer@example.com"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BillingError::ProviderNotConfigured(_)));
        assert!(err.remediation().is_some());
    }
}

#[cfg(test)]
mod webhook_tests {
    use super::*;

    // =========================================================================
    // invoice.payment_succeeded for a known invoice marks it paid
    // =========================================================================
    #[tokio::test]
    async fn test_payment_succeeded_marks_paid() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        let payload = event_payload(
            "evt_paid_1",
            "invoice.payment_succeeded",
            1_700_000_000,
            json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
        );
        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Applied);

        let updated = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, InvoiceStatus::Paid);
        assert_eq!(updated.amount_paid_cents, Some(1_350_000));
        assert_eq!(
            updated.paid_at.map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
        assert_eq!(ledger_result(&h, "evt_paid_1").await, "success");
    }

    // =========================================================================
    // Unknown invoice id: acknowledged, ledger 'unmatched', no rows touched
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_invoice_is_unmatched() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        let payload = event_payload(
            "evt_unknown",
            "invoice.paid",
            1_700_000_000,
            json!({ "id": "in_does_not_exist", "amount_paid": 100 }),
        );
        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Unmatched);

        let unchanged = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.status, InvoiceStatus::Open);
        assert_eq!(unchanged.updated_at, invoice.updated_at);
        assert_eq!(ledger_result(&h, "evt_unknown").await, "unmatched");
    }

    // =========================================================================
    // Same event delivered twice and replayed: same final state
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_and_replay_are_idempotent() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        let payload = event_payload(
            "evt_dup",
            "invoice.paid",
            1_700_000_000,
            json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
        );

        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Applied);
        let after_first = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Duplicate);

        let replay = h.billing.webhooks.replay_event("evt_dup").await.unwrap();
        assert!(replay.success);
        assert_eq!(replay.new_result, "success");

        let after_replay = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_replay.status, after_first.status);
        assert_eq!(after_replay.paid_at, after_first.paid_at);
        assert_eq!(after_replay.amount_paid_cents, after_first.amount_paid_cents);
        assert_eq!(after_replay.updated_at, after_first.updated_at);
    }

    // =========================================================================
    // Terminal status is not regressed by a late failure event
    // =========================================================================
    #[tokio::test]
    async fn test_paid_not_regressed_by_late_failure() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        deliver(
            &h,
            &event_payload(
                "evt_a",
                "invoice.paid",
                1_700_000_100,
                json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
            ),
        )
        .await;
        let outcome = deliver(
            &h,
            &event_payload(
                "evt_b",
                "invoice.payment_failed",
                1_700_000_000,
                json!({ "id": invoice.provider_invoice_id, "attempt_count": 1 }),
            ),
        )
        .await;

        assert_eq!(outcome, WebhookOutcome::Stale);
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Paid);
        assert!(row.last_payment_error.is_none());
    }

    // =========================================================================
    // invoice.finalized copies the hosted page, PDF and payment intent
    // =========================================================================
    #[tokio::test]
    async fn test_finalized_records_links_and_payment_reference() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        let payload = event_payload(
            "evt_finalized",
            "invoice.finalized",
            1_700_000_000,
            json!({
                "id": invoice.provider_invoice_id,
                "hosted_invoice_url": "https://invoice.stripe.com/i/updated",
                "invoice_pdf": "https://pay.stripe.com/invoice/updated/pdf",
                "payment_intent": { "id": "pi_finalized", "object": "payment_intent" },
            }),
        );
        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Applied);

        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Open);
        assert_eq!(
            row.hosted_url.as_deref(),
            Some("https://invoice.stripe.com/i/updated")
        );
        assert_eq!(
            row.pdf_url.as_deref(),
            Some("https://pay.stripe.com/invoice/updated/pdf")
        );
        assert_eq!(row.payment_reference.as_deref(), Some("pi_finalized"));
    }

    // =========================================================================
    // Uncollectible invoices can still be paid late
    // =========================================================================
    #[tokio::test]
    async fn test_uncollectible_then_late_payment() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        let outcome = deliver(
            &h,
            &event_payload(
                "evt_uncollectible",
                "invoice.marked_uncollectible",
                1_700_000_000,
                json!({ "id": invoice.provider_invoice_id }),
            ),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Applied);
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Uncollectible);

        let outcome = deliver(
            &h,
            &event_payload(
                "evt_late_paid",
                "invoice.paid",
                1_700_086_400,
                json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
            ),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Applied);
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Paid);
        assert_eq!(row.amount_paid_cents, Some(1_350_000));
    }

    // =========================================================================
    // A successful payment after a failed attempt clears the error
    // =========================================================================
    #[tokio::test]
    async fn test_paid_after_failure_clears_error() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        deliver(
            &h,
            &event_payload(
                "evt_fail_first",
                "invoice.payment_failed",
                1_700_000_000,
                json!({ "id": invoice.provider_invoice_id, "attempt_count": 1 }),
            ),
        )
        .await;
        let outcome = deliver(
            &h,
            &event_payload(
                "evt_paid_after",
                "invoice.paid",
                1_700_000_600,
                json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
            ),
        )
        .await;
        assert_eq!(outcome, WebhookOutcome::Applied);

        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Paid);
        assert_eq!(row.last_payment_error, None);
    }

    // =========================================================================
    // Ledger rows stuck in 'processing' are reclaimed after 30 minutes
    // =========================================================================
    async fn seed_processing_claim(h: &Harness, event_id: &str, payload: &str, minutes_ago: i64) {
        let started = OffsetDateTime::now_utc() - time::Duration::minutes(minutes_ago);
        sqlx::query(
            "INSERT INTO webhook_events \
                 (provider, event_id, event_type, event_timestamp, payload, \
                  processing_result, processing_started_at, created_at) \
             VALUES ('stripe', ?, 'invoice.paid', ?, ?, 'processing', ?, ?)",
        )
        .bind(event_id)
        .bind(started)
        .bind(payload)
        .bind(started)
        .bind(started)
        .execute(h.billing.store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_recent_processing_claim_is_duplicate() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        let payload = event_payload(
            "evt_in_flight",
            "invoice.paid",
            1_700_000_000,
            json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
        );
        seed_processing_claim(&h, "evt_in_flight", &payload, 5).await;

        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Duplicate);
        assert_eq!(ledger_result(&h, "evt_in_flight").await, "processing");
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Open);
    }

    #[tokio::test]
    async fn test_stuck_processing_claim_is_reclaimed() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        let payload = event_payload(
            "evt_stuck",
            "invoice.paid",
            1_700_000_000,
            json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
        );
        seed_processing_claim(&h, "evt_stuck", &payload, 31).await;

        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Applied);
        assert_eq!(ledger_result(&h, "evt_stuck").await, "success");
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_second_paid_event_keeps_first_payment_time() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        for (id, event_type, created) in [
            ("evt_p1", "invoice.payment_succeeded", 1_700_000_000),
            ("evt_p2", "invoice.paid", 1_700_000_005),
        ] {
            deliver(
                &h,
                &event_payload(
                    id,
                    event_type,
                    created,
                    json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
                ),
            )
            .await;
        }

        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.paid_at.map(|t| t.unix_timestamp()), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_payment_intent_matched_by_payment_reference() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        let pi = invoice.payment_reference.clone().unwrap();

        let outcome = deliver(
            &h,
            &event_payload(
                "evt_pi",
                "payment_intent.payment_failed",
                1_700_000_000,
                json!({
                    "id": pi,
                    "last_payment_error": { "message": "Your card was declined." }
                }),
            ),
        )
        .await;

        assert_eq!(outcome, WebhookOutcome::Applied);
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::PaymentFailed);
        assert_eq!(row.last_payment_error.as_deref(), Some("Your card was declined."));
    }

    #[tokio::test]
    async fn test_unhandled_type_is_ignored() {
        let h = harness().await;
        let payload = event_payload(
            "evt_cust",
            "customer.updated",
            1_700_000_000,
            json!({ "id": "cus_1" }),
        );
        assert_eq!(deliver(&h, &payload).await, WebhookOutcome::Ignored);
        assert_eq!(ledger_result(&h, "evt_cust").await, "ignored");
    }

    #[tokio::test]
    async fn test_malformed_object_recorded_as_error_and_replayable() {
        let h = harness().await;
        let payload = event_payload("evt_bad", "invoice.paid", 1_700_000_000, json!({}));
        let event = WebhookEvent::parse(&payload).unwrap();

        let result = h.billing.webhooks.handle_event(&payload, &event).await;
        assert!(matches!(result, Err(BillingError::WebhookPayload(_))));
        assert_eq!(ledger_result(&h, "evt_bad").await, "error");

        let replays = h.billing.webhooks.replay_failed(None).await.unwrap();
        assert_eq!(replays.len(), 1);
        assert!(!replays[0].success);
        assert_eq!(replays[0].previous_result, "error");

        let errors = h
            .billing
            .webhooks
            .list_events(Some("error"), 50, 0)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event_id, "evt_bad");
    }

    #[tokio::test]
    async fn test_unsigned_webhooks_rejected_without_secret() {
        let mut cfg = config();
        cfg.stripe.webhook_secret = None;
        let h = harness_with(cfg).await;

        let err = h.billing.webhooks.verify_event("{}", None).err().unwrap();
        assert!(matches!(err, BillingError::WebhookSecretMissing));
    }

    #[tokio::test]
    async fn test_signed_delivery_verifies() {
        let h = harness().await;
        let payload = event_payload("evt_sig", "invoice.sent", 1_700_000_000, json!({"id": "in_1"}));
        let header = crate::webhooks::sign_payload(
            &payload,
            WEBHOOK_SECRET,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
        .unwrap();

        let event = h
            .billing
            .webhooks
            .verify_event(&payload, Some(&header))
            .unwrap();
        assert_eq!(event.id, "evt_sig");
        assert!(h.billing.webhooks.verify_event(&payload, None).is_err());
    }
}

#[cfg(test)]
mod sync_tests {
    use super::*;

    // =========================================================================
    // Listing pulls remote payment state onto the local row
    // =========================================================================
    #[tokio::test]
    async fn test_list_pulls_remote_payment() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        h.provider
            .mark_paid(&invoice.provider_invoice_id, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let listed = h
            .billing
            .invoices
            .list_invoices(h.user_id, &ListInvoicesQuery::default())
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, InvoiceStatus::Paid);
        assert_eq!(listed[0].amount_paid_cents, Some(1_350_000));
        assert!(listed[0].paid_at.is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_does_not_fail_listing() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        h.provider
            .fail_next(FailPoint::RetrieveInvoice, "rate limited")
            .await;

        let listed = h
            .billing
            .invoices
            .list_invoices(h.user_id, &ListInvoicesQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, invoice.id);
        assert_eq!(listed[0].status, InvoiceStatus::Open);
    }

    #[tokio::test]
    async fn test_read_path_sync_is_bounded() {
        let mut cfg = config();
        cfg.sync_on_read_limit = 1;
        let h = harness_with(cfg).await;
        created_invoice(&h).await;
        created_invoice(&h).await;

        h.billing
            .invoices
            .list_invoices(h.user_id, &ListInvoicesQuery::default())
            .await
            .unwrap();
        assert_eq!(h.provider.retrieve_invoice_calls().await, 1);
    }

    #[tokio::test]
    async fn test_settled_invoices_are_not_refetched() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        h.billing
            .invoices
            .void_invoice(h.user_id, invoice.id)
            .await
            .unwrap();

        h.billing
            .invoices
            .list_invoices(h.user_id, &ListInvoicesQuery::default())
            .await
            .unwrap();
        assert_eq!(h.provider.retrieve_invoice_calls().await, 0);
    }

    // =========================================================================
    // A failed payment survives pulls while Stripe still reports the invoice open
    // =========================================================================
    #[tokio::test]
    async fn test_pull_keeps_payment_failed_while_remote_open() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        deliver(
            &h,
            &event_payload(
                "evt_fail_pull",
                "invoice.payment_failed",
                1_700_000_000,
                json!({ "id": invoice.provider_invoice_id, "attempt_count": 1 }),
            ),
        )
        .await;

        let listed = h
            .billing
            .invoices
            .list_invoices(h.user_id, &ListInvoicesQuery::default())
            .await
            .unwrap();
        assert_eq!(h.provider.retrieve_invoice_calls().await, 1);
        assert_eq!(listed[0].status, InvoiceStatus::PaymentFailed);
        assert_eq!(
            listed[0].last_payment_error.as_deref(),
            Some("Payment attempt 1 failed")
        );

        let report = h.billing.reconciliation.sync_stale(100).await.unwrap();
        assert_eq!(report.updated, 0);
        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn test_pull_settles_failed_invoice_once_paid() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        deliver(
            &h,
            &event_payload(
                "evt_fail_then_paid",
                "invoice.payment_failed",
                1_700_000_000,
                json!({ "id": invoice.provider_invoice_id, "attempt_count": 2 }),
            ),
        )
        .await;
        h.provider
            .mark_paid(&invoice.provider_invoice_id, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let listed = h
            .billing
            .invoices
            .list_invoices(h.user_id, &ListInvoicesQuery::default())
            .await
            .unwrap();
        assert_eq!(listed[0].status, InvoiceStatus::Paid);
        assert_eq!(listed[0].amount_paid_cents, Some(1_350_000));
        assert_eq!(listed[0].last_payment_error, None);
    }

    #[tokio::test]
    async fn test_worker_sweep_updates_all_users() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        h.provider
            .set_status(&invoice.provider_invoice_id, InvoiceStatus::Uncollectible)
            .await
            .unwrap();

        let report = h.billing.reconciliation.sync_stale(100).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 0);

        let row = h
            .billing
            .store
            .get_invoice(h.user_id, invoice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, InvoiceStatus::Uncollectible);
    }
}

#[cfg(test)]
mod action_tests {
    use super::*;

    #[tokio::test]
    async fn test_void_open_invoice() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        let voided = h
            .billing
            .invoices
            .void_invoice(h.user_id, invoice.id)
            .await
            .unwrap();
        assert_eq!(voided.invoice.status, InvoiceStatus::Void);

        // voiding again is a no-op
        let again = h
            .billing
            .invoices
            .void_invoice(h.user_id, invoice.id)
            .await
            .unwrap();
        assert_eq!(again.invoice.status, InvoiceStatus::Void);
    }

    #[tokio::test]
    async fn test_paid_invoice_cannot_be_voided_or_sent() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;
        deliver(
            &h,
            &event_payload(
                "evt_paid",
                "invoice.paid",
                1_700_000_000,
                json!({ "id": invoice.provider_invoice_id, "amount_paid": 1_350_000 }),
            ),
        )
        .await;

        let void_err = h
            .billing
            .invoices
            .void_invoice(h.user_id, invoice.id)
            .await
            .err()
            .unwrap();
        assert!(matches!(void_err, BillingError::InvalidInput(_)));

        let send_err = h
            .billing
            .invoices
            .send_invoice(h.user_id, invoice.id)
            .await
            .err()
            .unwrap();
        assert!(matches!(send_err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_resend_open_invoice() {
        let h = harness().await;
        let invoice = created_invoice(&h).await;

        let sent = h
            .billing
            .invoices
            .send_invoice(h.user_id, invoice.id)
            .await
            .unwrap();
        assert_eq!(sent.invoice.status, InvoiceStatus::Open);
        assert_eq!(sent.items.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_clean_after_normal_flow() {
        let h = harness().await;
        let contact_id = buyer_contact(&h).await;
        h.billing
            .invoices
            .create_invoice(h.user_id, rolex_request(Some(contact_id)))
            .await
            .unwrap();

        let summary = h
            .billing
            .invariants
            .run_all_checks(Some(h.user_id))
            .await
            .unwrap();
        assert!(summary.healthy, "violations: {:?}", summary.violations);
    }
}
