use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::error::AppError;
use crate::http::dtos::{
    ProvisionRequest, ProvisionResponse, StateResponse, TokenRecordView,
};
use crate::http::middleware::{require, CurrentIdentity};
use crate::services::identity::functions;
use crate::AppState;

/// Provision an agent (idempotent by id). A repeat call replaces the
/// agent's token, revoking the one issued before.
#[utoipa::path(
    post,
    path = "/api/client/provision",
    request_body = ProvisionRequest,
    responses(
        (status = 200, description = "Client provisioned", body = ProvisionResponse),
        (status = 400, description = "Invalid client id", body = ErrorResponse),
        (status = 403, description = "Missing function", body = ErrorResponse)
    ),
    tag = "Client"
)]
pub async fn provision(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Json(request): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CLIENT_PROVISION)?;
    let outcome = state.clients.provision(&request.id).await?;
    Ok(Json(ProvisionResponse {
        token: outcome.token,
        record: TokenRecordView {
            id: outcome.record_id,
            expires: outcome.expires,
        },
    }))
}

pub async fn list_clients(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CLIENT_GET_ALL)?;
    let clients = state.clients.list_clients().await?;
    Ok(Json(clients))
}

pub async fn get_client(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(client_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CLIENT_GET_ALL)?;
    match state.clients.get_client(&client_id).await? {
        Some(client) => Ok(Json(client).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn delete_client(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(client_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CLIENT_DELETE_ALL)?;
    state.clients.deprovision(&client_id).await?;
    Ok(Json(StateResponse::success()))
}
