//! Application state

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use watchdesk_billing::{BillingService, PaymentProviders};
use watchdesk_shared::{RateLimitConfig, RateLimiter};

use crate::{
    auth::{generate_impossible_hash, AuthState, JwtManager},
    config::Config,
};

/// Upper bound on distinct client IPs the promo limiter tracks
const PROMO_LIMITER_MAX_ENTRIES: usize = 10_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
    /// Per-IP limiter for the public promo signup endpoint
    pub promo_limiter: RateLimiter,
    /// Verified against on logins for unknown emails; hashed once at startup
    pub dummy_password_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let providers = PaymentProviders::from_config(&config.billing);
        Self::with_providers(pool, config, providers)
    }

    /// Build state around an explicit provider registry (tests inject the in-memory one).
    pub fn with_providers(pool: SqlitePool, config: Config, providers: PaymentProviders) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let billing = Arc::new(BillingService::with_providers(
            config.billing.clone(),
            providers,
            pool.clone(),
        ));
        let promo_limiter = RateLimiter::with_config(RateLimitConfig {
            max_requests: config.promo_signups_per_minute,
            window: Duration::from_secs(60),
            max_entries: PROMO_LIMITER_MAX_ENTRIES,
        });

        let dummy_password_hash = match generate_impossible_hash() {
            Ok(hash) => Some(Arc::from(hash)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to hash dummy login password");
                None
            }
        };

        Self {
            pool,
            config: Arc::new(config),
            jwt_manager,
            billing,
            promo_limiter,
            dummy_password_hash,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
        }
    }
}
