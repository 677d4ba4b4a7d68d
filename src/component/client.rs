use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use utoipa::OpenApi;

use super::{Component, ComponentEnv, ComponentParts, MessageHandler};
use crate::error::AppError;
use crate::http::dtos::{ErrorResponse, ProvisionRequest, ProvisionResponse, TokenRecordView};
use crate::http::handlers::client as handlers;
use crate::http::middleware::auth_middleware;
use crate::models::Capability;
use crate::openapi::RouteDoc;
use crate::services::SessionHandle;
use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::provision),
    components(schemas(ProvisionRequest, ProvisionResponse, TokenRecordView, ErrorResponse)),
    tags((name = "Client", description = "Agent provisioning and management"))
)]
struct ClientApiDoc;

/// Agent management component: provisioning routes under `/api/client` plus
/// the session message providers (`client.*` and `capability.report`).
pub struct ClientComponent;

#[async_trait]
impl Component for ClientComponent {
    fn name(&self) -> &'static str {
        "client"
    }

    async fn setup(&self, _env: ComponentEnv) -> Result<ComponentParts, AppError> {
        let router = Router::new()
            .route("/provision", post(handlers::provision))
            .route("/", get(handlers::list_clients))
            .route(
                "/:client_id",
                get(handlers::get_client).delete(handlers::delete_client),
            );

        let routes = vec![
            RouteDoc::new("post", "/provision"),
            RouteDoc::new("get", "/"),
            RouteDoc::new("get", "/{clientId}"),
            RouteDoc::new("delete", "/{clientId}"),
        ];

        let mut client_messages: HashMap<String, Arc<dyn MessageHandler>> = HashMap::new();
        client_messages.insert("token.refresh".to_string(), Arc::new(TokenRefreshHandler));
        client_messages.insert("state".to_string(), Arc::new(ClientStateHandler));

        let mut capability_messages: HashMap<String, Arc<dyn MessageHandler>> = HashMap::new();
        capability_messages.insert("report".to_string(), Arc::new(CapabilityReportHandler));

        let mut providers = HashMap::new();
        providers.insert("client".to_string(), client_messages);
        providers.insert("capability".to_string(), capability_messages);

        Ok(ComponentParts {
            router,
            routes,
            providers,
        })
    }

    /// Every route this component mounts is operator-gated, so the token
    /// middleware wraps the whole mount.
    fn middleware(&self, app: &AppState) -> Option<super::RouterTransform> {
        let app = app.clone();
        Some(Box::new(move |router| {
            router.layer(middleware::from_fn_with_state(app, auth_middleware))
        }))
    }

    fn openapi(&self) -> Option<Value> {
        serde_json::to_value(ClientApiDoc::openapi()).ok()
    }
}

/// `client.token.refresh`: re-issue the agent's token and push it back as
/// `client.token.issue`. The old token stops verifying on its next use.
struct TokenRefreshHandler;

#[async_trait]
impl MessageHandler for TokenRefreshHandler {
    async fn handle(
        &self,
        _message: Value,
        session: &SessionHandle,
        state: &AppState,
    ) -> Result<(), AppError> {
        let outcome = state.clients.refresh_token(session.client_id()).await?;
        tracing::info!(client = %session.client_id(), "Refreshed client token over session");
        session
            .send_json(&json!({
                "type": "client.token.issue",
                "token": outcome.token,
                "expires": outcome.expires.to_rfc3339(),
            }))
            .await
    }
}

/// `client.state`: record the agent's announced lifecycle state.
struct ClientStateHandler;

#[async_trait]
impl MessageHandler for ClientStateHandler {
    async fn handle(
        &self,
        message: Value,
        session: &SessionHandle,
        state: &AppState,
    ) -> Result<(), AppError> {
        let announced = message
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::RequestError("client.state has no state field".into()))?;
        state.clients.set_state(session.client_id(), announced).await
    }
}

/// `capability.report`: the agent's response to the server's solicitation,
/// recorded on the client entity.
struct CapabilityReportHandler;

#[async_trait]
impl MessageHandler for CapabilityReportHandler {
    async fn handle(
        &self,
        message: Value,
        session: &SessionHandle,
        state: &AppState,
    ) -> Result<(), AppError> {
        let capabilities: Vec<Capability> = match message.get("capabilities") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                AppError::RequestError(format!("malformed capability report: {e}"))
            })?,
            None => Vec::new(),
        };
        state
            .clients
            .set_capabilities(session.client_id(), capabilities)
            .await
    }
}
