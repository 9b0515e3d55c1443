//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer token extraction and validation
//! - Tokens for users that no longer exist
//! - Client IP extraction from proxy headers

#[cfg(test)]
mod tests {
    use super::super::jwt::JwtManager;
    use super::super::middleware::*;
    use axum::{
        body::Body,
        http::{HeaderMap, HeaderValue, Request, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;
    use watchdesk_shared::create_memory_pool;

    const SECRET: &str = "test-secret-key-for-jwt";

    async fn setup() -> (AuthState, i64) {
        let pool = create_memory_pool().await.unwrap();
        let (user_id,): (i64,) = sqlx::query_as(
            "INSERT INTO users (email, password_hash, created_at) VALUES (?, 'x', ?) RETURNING id",
        )
        .bind("dealer@example.com")
        .bind(time::OffsetDateTime::now_utc())
        .fetch_one(&pool)
        .await
        .unwrap();

        (
            AuthState {
                jwt_manager: JwtManager::new(SECRET, 24),
                pool,
            },
            user_id,
        )
    }

    fn app(state: AuthState) -> Router {
        Router::new()
            .route(
                "/me",
                get(|Extension(user): Extension<AuthUser>| async move { user.email }),
            )
            .route_layer(from_fn_with_state(state, require_auth))
    }

    async fn call(app: Router, auth: Option<String>) -> StatusCode {
        let mut builder = Request::builder().uri("/me");
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let (state, user_id) = setup().await;
        let (token, _) = state
            .jwt_manager
            .generate_token(user_id, "dealer@example.com")
            .unwrap();

        let status = call(app(state), Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let (state, _) = setup().await;
        assert_eq!(call(app(state), None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_rejected() {
        let (state, _) = setup().await;
        let status = call(app(state), Some("Basic dXNlcjpwYXNz".to_string())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_for_unknown_user_rejected() {
        let (state, user_id) = setup().await;
        let (token, _) = state
            .jwt_manager
            .generate_token(user_id + 100, "ghost@example.com")
            .unwrap();

        let status = call(app(state), Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_signed_with_other_secret_rejected() {
        let (state, user_id) = setup().await;
        let (token, _) = JwtManager::new("another-secret", 24)
            .generate_token(user_id, "dealer@example.com")
            .unwrap();

        let status = call(app(state), Some(format!("Bearer {}", token))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_ip_prefers_first_forwarded_for_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("X-Real-IP", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(extract_ip_address(&headers).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-IP", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(extract_ip_address(&headers).as_deref(), Some("10.0.0.2"));
        assert_eq!(extract_ip_address(&HeaderMap::new()), None);
    }
}
