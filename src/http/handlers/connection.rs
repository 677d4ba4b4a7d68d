use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

use crate::error::AppError;
use crate::http::dtos::StateResponse;
use crate::http::middleware::{bearer_token, require, CurrentIdentity};
use crate::services::identity::functions;
use crate::services::Outbound;
use crate::AppState;

pub async fn list_connections(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CONNECTION_GET_ALL)?;
    let connections = state.connections.list_connections().await?;
    Ok(Json(connections))
}

pub async fn get_connection(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(connection_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CONNECTION_GET_ALL)?;
    match state.connections.get_connection(&connection_id).await? {
        Some(connection) => Ok(Json(connection).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Push a message to a connected agent. String bodies pass through
/// verbatim; anything else is serialized as JSON.
pub async fn send(
    State(state): State<AppState>,
    CurrentIdentity(caller): CurrentIdentity,
    Path(connection_id): Path<String>,
    Json(message): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    require(&caller, functions::CONNECTION_SEND)?;
    let outbound = match message {
        Value::String(text) => Outbound::Text(text),
        other => Outbound::Json(other),
    };
    state.connections.send(&connection_id, outbound).await?;
    Ok(Json(StateResponse::success()))
}

/// Agent session endpoint. The agent presents its wrapped client token in
/// `Authorization: bearer <token>` on the upgrade request; a failed
/// verification is answered with a bare 403 and no upgrade.
pub async fn connect(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        tracing::warn!(peer = %peer, "Connection attempt without bearer token");
        return StatusCode::FORBIDDEN.into_response();
    };

    let client = match state.clients.verify_token(token).await {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Connection attempt rejected");
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let connections = state.connections.clone();
        connections
            .run_session(state, socket, peer, client.id)
            .await;
    })
}
