//! Stripe webhook handling
//!
//! Verifies `Stripe-Signature`, records every event in the webhook ledger and
//! mirrors invoice status changes onto local rows. Events are parsed into a
//! small local type rather than `stripe::Event` so that payloads from newer
//! API versions still decode.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::{FromRow, SqlitePool};
use time::{Duration, OffsetDateTime};
use watchdesk_shared::InvoiceStatus;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{apply_guarded, ApplyOutcome};
use crate::store::{InvoiceRecord, InvoiceStore, InvoiceUpdate};

type HmacSha256 = Hmac<Sha256>;

const PROVIDER: &str = "stripe";
/// Maximum age difference between the signature timestamp and now
const SIGNATURE_TOLERANCE_SECS: i64 = 300;
/// A ledger row stuck in `processing` this long may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;
const DEFAULT_REPLAY_LIMIT: i64 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayload(e.to_string())
        })
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::WebhookPayload(format!("{}: {}", self.event_type, e)))
    }
}

/// A reference that Stripe may send either as a bare id or as an expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) => id,
            ExpandableId::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    amount_paid: Option<i64>,
    #[serde(default)]
    hosted_invoice_url: Option<String>,
    #[serde(default)]
    invoice_pdf: Option<String>,
    #[serde(default)]
    payment_intent: Option<ExpandableId>,
    #[serde(default)]
    attempt_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PaymentError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    invoice: Option<ExpandableId>,
    #[serde(default)]
    amount_received: Option<i64>,
    #[serde(default)]
    last_payment_error: Option<PaymentError>,
}

impl PaymentError {
    fn describe(&self) -> String {
        match (&self.message, &self.code) {
            (Some(message), _) => message.clone(),
            (None, Some(code)) => code.clone(),
            (None, None) => "payment failed".to_string(),
        }
    }
}

/// What processing an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    Unchanged,
    /// Local row already past the event's status
    Stale,
    /// No local invoice matches; kept for replay
    Unmatched,
    /// Event type not handled
    Ignored,
    /// Event id already in the ledger
    Duplicate,
}

impl WebhookOutcome {
    fn ledger_result(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied | WebhookOutcome::Unchanged | WebhookOutcome::Stale => {
                "success"
            }
            WebhookOutcome::Unmatched => "unmatched",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Duplicate => "duplicate",
        }
    }
}

/// Webhook ledger row (payload omitted)
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WebhookEventRecord {
    pub id: i64,
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub event_id: String,
    pub event_type: String,
    pub previous_result: String,
    pub new_result: String,
    pub error: Option<String>,
    pub success: bool,
}

/// Build a `Stripe-Signature` header value for `payload`.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("Invalid webhook secret key".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a `Stripe-Signature` header (`t=..,v1=..[,v1=..]`) against `payload`.
///
/// The whole signing secret, `whsec_` prefix included, is the HMAC key.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        // constant-time comparison
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::warn!("Webhook signature mismatch");
    Err(BillingError::WebhookSignatureInvalid)
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    store: InvoiceStore,
    pool: SqlitePool,
    config: StripeConfig,
}

impl WebhookHandler {
    pub fn new(store: InvoiceStore, config: StripeConfig) -> Self {
        let pool = store.pool().clone();
        Self {
            store,
            pool,
            config,
        }
    }

    /// Verify and parse an incoming delivery.
    pub fn verify_event(&self, payload: &str, signature: Option<&str>) -> BillingResult<WebhookEvent> {
        match self.config.webhook_secret.as_deref() {
            Some(secret) => {
                let signature = signature.ok_or_else(|| {
                    tracing::warn!("Webhook delivered without Stripe-Signature header");
                    BillingError::WebhookSignatureInvalid
                })?;
                verify_signature(
                    payload,
                    signature,
                    secret,
                    OffsetDateTime::now_utc().unix_timestamp(),
                )?;
            }
            None if self.config.allow_unsigned_webhooks => {
                tracing::warn!("Accepting unsigned webhook (ALLOW_UNSIGNED_WEBHOOKS=true)");
            }
            None => return Err(BillingError::WebhookSecretMissing),
        }

        WebhookEvent::parse(payload)
    }

    /// Record `event` in the ledger and process it unless already seen.
    ///
    /// The ledger insert doubles as an atomic claim: only the request whose
    /// insert returns a row processes the event.
    pub async fn handle_event(&self, payload: &str, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);

        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider, event_id, event_type, event_timestamp, payload,
                 processing_result, processing_started_at, created_at)
            VALUES (?, ?, ?, ?, ?, 'processing', ?, ?)
            ON CONFLICT (provider, event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = excluded.processing_started_at,
                error_message = 'Recovered from stuck processing state'
            WHERE webhook_events.processing_result = 'processing'
              AND webhook_events.processing_started_at < ?
            RETURNING id
            "#,
        )
        .bind(PROVIDER)
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.timestamp())
        .bind(payload)
        .bind(now)
        .bind(now)
        .bind(stuck_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event.id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(event).await;
        self.record_result(&event.id, &result).await;
        result
    }

    async fn record_result(&self, event_id: &str, result: &BillingResult<WebhookOutcome>) {
        let (processing_result, error_message) = match result {
            Ok(outcome) => (outcome.ledger_result(), None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE webhook_events SET processing_result = ?, error_message = ? \
             WHERE provider = ? AND event_id = ?",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(PROVIDER)
        .bind(event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to update webhook ledger; event may appear stuck in processing"
            );
        }
    }

    /// Map an event onto a local invoice update.
    pub async fn process_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let event_at = event.timestamp();

        let (invoice, update) = match event.event_type.as_str() {
            "invoice.finalized" => {
                let obj: InvoiceObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::Open),
                    hosted_url: obj.hosted_invoice_url.clone(),
                    pdf_url: obj.invoice_pdf.clone(),
                    payment_reference: obj.payment_intent.as_ref().map(|p| p.id().to_string()),
                    ..Default::default()
                };
                (self.store.find_by_provider_invoice_id(&obj.id).await?, update)
            }
            "invoice.sent" => {
                let obj: InvoiceObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::Open),
                    hosted_url: obj.hosted_invoice_url.clone(),
                    pdf_url: obj.invoice_pdf.clone(),
                    ..Default::default()
                };
                (self.store.find_by_provider_invoice_id(&obj.id).await?, update)
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                let obj: InvoiceObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::Paid),
                    amount_paid_cents: obj.amount_paid,
                    paid_at: Some(event_at),
                    payment_reference: obj.payment_intent.as_ref().map(|p| p.id().to_string()),
                    ..Default::default()
                };
                (self.store.find_by_provider_invoice_id(&obj.id).await?, update)
            }
            "invoice.payment_failed" => {
                let obj: InvoiceObject = event.object()?;
                let message = match obj.attempt_count {
                    Some(n) => format!("Payment attempt {} failed", n),
                    None => "Payment failed".to_string(),
                };
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::PaymentFailed),
                    last_payment_error: Some(message),
                    ..Default::default()
                };
                (self.store.find_by_provider_invoice_id(&obj.id).await?, update)
            }
            "invoice.voided" => {
                let obj: InvoiceObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::Void),
                    ..Default::default()
                };
                (self.store.find_by_provider_invoice_id(&obj.id).await?, update)
            }
            "invoice.marked_uncollectible" => {
                let obj: InvoiceObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::Uncollectible),
                    ..Default::default()
                };
                (self.store.find_by_provider_invoice_id(&obj.id).await?, update)
            }
            "payment_intent.succeeded" => {
                let obj: PaymentIntentObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::Paid),
                    amount_paid_cents: obj.amount_received,
                    paid_at: Some(event_at),
                    payment_reference: Some(obj.id.clone()),
                    ..Default::default()
                };
                (self.find_for_payment_intent(&obj).await?, update)
            }
            "payment_intent.payment_failed" => {
                let obj: PaymentIntentObject = event.object()?;
                let update = InvoiceUpdate {
                    status: Some(InvoiceStatus::PaymentFailed),
                    payment_reference: Some(obj.id.clone()),
                    last_payment_error: Some(
                        obj.last_payment_error
                            .as_ref()
                            .map(PaymentError::describe)
                            .unwrap_or_else(|| "payment failed".to_string()),
                    ),
                    ..Default::default()
                };
                (self.find_for_payment_intent(&obj).await?, update)
            }
            other => {
                tracing::debug!(event_type = %other, event_id = %event.id, "Unhandled webhook event type");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        let Some(invoice) = invoice else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event does not match any local invoice"
            );
            return Ok(WebhookOutcome::Unmatched);
        };

        let update = keep_first_payment(&invoice, update);
        Ok(match apply_guarded(&self.store, &invoice, &update).await? {
            ApplyOutcome::Applied(_) => WebhookOutcome::Applied,
            ApplyOutcome::Unchanged => WebhookOutcome::Unchanged,
            ApplyOutcome::Stale => WebhookOutcome::Stale,
        })
    }

    async fn find_for_payment_intent(
        &self,
        obj: &PaymentIntentObject,
    ) -> BillingResult<Option<InvoiceRecord>> {
        if let Some(invoice_ref) = &obj.invoice {
            if let Some(invoice) = self
                .store
                .find_by_provider_invoice_id(invoice_ref.id())
                .await?
            {
                return Ok(Some(invoice));
            }
        }
        self.store.find_by_payment_reference(&obj.id).await
    }

    /// List ledger entries, newest first.
    pub async fn list_events(
        &self,
        result_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, provider, event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message, created_at
            FROM webhook_events
            WHERE (? IS NULL OR processing_result = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(result_filter)
        .bind(result_filter)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Re-process a stored event from its recorded payload.
    pub async fn replay_event(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT payload, processing_result FROM webhook_events WHERE provider = ? AND event_id = ?",
        )
        .bind(PROVIDER)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (payload, previous_result) = existing.ok_or_else(|| {
            BillingError::NotFound(format!("webhook event {}", event_id))
        })?;

        let event = WebhookEvent::parse(&payload)?;
        tracing::info!(
            event_id = %event_id,
            previous_result = %previous_result,
            "Replaying webhook event"
        );

        sqlx::query(
            "UPDATE webhook_events SET processing_result = 'processing', processing_started_at = ? \
             WHERE provider = ? AND event_id = ?",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(PROVIDER)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        let result = self.process_event(&event).await;
        self.record_result(event_id, &result).await;

        let (new_result, error) = match &result {
            Ok(outcome) => (outcome.ledger_result().to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        tracing::info!(
            event_id = %event_id,
            previous_result = %previous_result,
            new_result = %new_result,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id: event_id.to_string(),
            event_type: event.event_type,
            previous_result,
            success: result.is_ok(),
            new_result,
            error,
        })
    }

    /// Replay `error` and `unmatched` events, oldest first.
    pub async fn replay_failed(&self, max_events: Option<i64>) -> BillingResult<Vec<WebhookReplayResult>> {
        let limit = max_events.unwrap_or(DEFAULT_REPLAY_LIMIT).clamp(1, 1000);

        let pending: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT event_id FROM webhook_events
            WHERE provider = ? AND processing_result IN ('error', 'unmatched')
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(PROVIDER)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(pending.len());
        for (event_id,) in pending {
            match self.replay_event(&event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(event_id = %event_id, error = %e, "Failed to replay webhook");
                    results.push(WebhookReplayResult {
                        event_id,
                        event_type: "unknown".to_string(),
                        previous_result: "error".to_string(),
                        new_result: "error".to_string(),
                        error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }
        Ok(results)
    }
}

/// An invoice paid once keeps its original payment time across later events.
fn keep_first_payment(invoice: &InvoiceRecord, mut update: InvoiceUpdate) -> InvoiceUpdate {
    if invoice.status == InvoiceStatus::Paid && invoice.paid_at.is_some() {
        update.paid_at = None;
        if invoice.amount_paid_cents.is_some() {
            update.amount_paid_cents = None;
        }
    }
    update
}
