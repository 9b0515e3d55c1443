// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries provider messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Watchdesk API Library
//!
//! Axum server components: authentication, contacts, invoices, promo
//! signups and the Stripe webhook receiver.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, LogFormat};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
