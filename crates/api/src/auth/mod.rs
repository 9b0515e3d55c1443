//! Authentication module for Watchdesk

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod password;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{extract_ip_address, require_auth, AuthError, AuthState, AuthUser};
pub use password::{generate_impossible_hash, hash_password, verify_password, PasswordError};
