//! HTTP routes

pub mod auth;
pub mod contacts;
pub mod health;
pub mod invoices;
pub mod promo;
pub mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

/// Build the application router. CORS and tracing layers are added by the binary.
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/auth/login", post(auth::login))
        .route("/api/promo/signup", post(promo::signup))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook));

    let protected = Router::new()
        .route(
            "/api/contacts",
            get(contacts::list_contacts).post(contacts::create_contact),
        )
        .route("/api/contacts/{id}", get(contacts::get_contact))
        .route(
            "/api/invoices",
            get(invoices::list_invoices).post(invoices::create_invoice),
        )
        .route("/api/invoices/health", get(invoices::invoice_health))
        .route("/api/invoices/{id}", get(invoices::get_invoice))
        .route("/api/invoices/{id}/send", post(invoices::send_invoice))
        .route("/api/invoices/{id}/void", post(invoices::void_invoice))
        .route("/api/webhooks/events", get(webhooks::list_events))
        .route(
            "/api/webhooks/events/replay-failed",
            post(webhooks::replay_failed),
        )
        .route(
            "/api/webhooks/events/{event_id}/replay",
            post(webhooks::replay_event),
        )
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    public.merge(protected).with_state(state)
}
