#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Watchdesk shared types
//!
//! Pieces used by both the API server and the billing/worker crates:
//! database pool construction and migrations, the invoice status model,
//! money conversion helpers and the injected rate limiter.

pub mod db;
pub mod money;
pub mod rate_limit;
pub mod status;

pub use db::{create_memory_pool, create_pool, run_migrations};
pub use money::{from_minor_units, minor_unit_exponent, normalize_currency, to_minor_units, MoneyError};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use status::{InvoiceStatus, UnknownStatus};
