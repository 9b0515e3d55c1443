//! Contacts owned by the caller

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use watchdesk_billing::{ContactRecord, NewContact};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateContactRequest {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn create_contact(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateContactRequest>,
) -> ApiResult<(StatusCode, Json<ContactRecord>)> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("contact name is required".to_string()));
    }
    let email = non_empty(req.email).map(|e| e.to_lowercase());
    if let Some(email) = &email {
        if !email.contains('@') {
            return Err(ApiError::BadRequest(format!("invalid email: {}", email)));
        }
    }

    let contact = state
        .billing
        .store
        .create_contact(
            auth_user.user_id,
            NewContact {
                name: name.to_string(),
                email,
                phone: non_empty(req.phone),
            },
        )
        .await?;

    tracing::info!(user_id = auth_user.user_id, contact_id = contact.id, "Contact created");
    Ok((StatusCode::CREATED, Json(contact)))
}

pub async fn list_contacts(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ContactRecord>>> {
    let contacts = state.billing.store.list_contacts(auth_user.user_id).await?;
    Ok(Json(contacts))
}

pub async fn get_contact(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(contact_id): Path<i64>,
) -> ApiResult<Json<ContactRecord>> {
    state
        .billing
        .store
        .get_contact(auth_user.user_id, contact_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("contact {} not found", contact_id)))
}
