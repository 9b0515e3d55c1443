//! Password login

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{
    auth::verify_password,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginUser {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: LoginUser,
}

const INVALID_CREDENTIALS: &str = "Invalid email or password";

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "email and password are required".to_string(),
        ));
    }

    let credentials = state.billing.store.find_credentials(&req.email).await?;

    let user = match credentials {
        Some(user) if verify_password(&req.password, &user.password_hash) => user,
        Some(user) => {
            tracing::warn!(user_id = user.id, "Login failed: wrong password");
            return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.to_string()));
        }
        None => {
            // Spend comparable time on unknown emails
            if let Some(hash) = &state.dummy_password_hash {
                verify_password(&req.password, hash);
            }
            tracing::warn!("Login failed: unknown email");
            return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.to_string()));
        }
    };

    let (access_token, jti) = state
        .jwt_manager
        .generate_token(user.id, &user.email)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(user_id = user.id, jti = %jti, "User logged in");

    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.jwt_manager.expiry_seconds(),
        user: LoginUser {
            id: user.id,
            email: user.email,
        },
    }))
}
