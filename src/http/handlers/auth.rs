use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;

use crate::error::AppError;
use crate::http::dtos::LoginResponse;
use crate::http::middleware::{require, CurrentIdentity};
use crate::models::IdentityView;
use crate::services::identity::functions;
use crate::services::IdentitySpec;
use crate::AppState;

/// Operator login. The body is handed to the identity's auth provider
/// untyped; the password provider expects `{name, password}`.
#[utoipa::path(
    post,
    path = "/api/auth",
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 400, description = "Malformed login request", body = ErrorResponse),
        (status = 403, description = "Authentication failed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    Json(details): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let login = state.identities.authenticate(&details).await?;
    Ok(Json(LoginResponse {
        state: "success".to_string(),
        token: login.token,
    }))
}

#[utoipa::path(
    get,
    path = "/api/auth/identity",
    responses(
        (status = 200, description = "All identities", body = [IdentityView]),
        (status = 403, description = "Missing function", body = ErrorResponse)
    ),
    tag = "Identity"
)]
pub async fn list_identities(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::IDENTITY_GET_ALL)?;
    let identities = state.identities.list_identities().await?;
    let views: Vec<IdentityView> = identities.iter().map(|i| i.view()).collect();
    Ok(Json(views))
}

#[utoipa::path(
    post,
    path = "/api/auth/identity",
    request_body = IdentitySpec,
    responses(
        (status = 201, description = "Identity created", body = IdentityView),
        (status = 400, description = "Invalid identity spec", body = ErrorResponse),
        (status = 403, description = "Missing function", body = ErrorResponse)
    ),
    tag = "Identity"
)]
pub async fn create_identity(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Json(spec): Json<IdentitySpec>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::IDENTITY_CREATE)?;
    let view = state.identities.add_identity(spec).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_identity(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(identity_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::IDENTITY_GET_ALL)?;
    match state.identities.get_identity(&identity_id).await? {
        Some(identity) => Ok(Json(identity.view()).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn update_identity(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(identity_id): Path<String>,
    Json(spec): Json<IdentitySpec>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::IDENTITY_UPDATE_ALL)?;
    let view = state.identities.set_identity(&identity_id, spec, true).await?;
    Ok(Json(view))
}

pub async fn delete_identity(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(identity_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::IDENTITY_DELETE_ALL)?;
    state.identities.remove_identity(&identity_id).await?;
    Ok(Json(crate::http::dtos::StateResponse::success()))
}

/// The caller's own record. Needs a valid session, never a function.
#[utoipa::path(
    get,
    path = "/api/auth/identity/me",
    responses(
        (status = 200, description = "The caller's identity", body = IdentityView),
        (status = 403, description = "Unauthenticated", body = ErrorResponse)
    ),
    tag = "Identity"
)]
pub async fn get_me(CurrentIdentity(caller): CurrentIdentity) -> impl IntoResponse {
    Json(caller.view())
}

/// Self-edit. `functions` is never applied here, so a caller cannot widen
/// its own permissions.
pub async fn update_me(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Json(spec): Json<IdentitySpec>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.identities.set_identity(&caller.id, spec, false).await?;
    Ok(Json(view))
}
