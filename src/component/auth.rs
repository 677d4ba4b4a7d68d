use async_trait::async_trait;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use utoipa::OpenApi;

use super::{Component, ComponentEnv, ComponentParts};
use crate::error::AppError;
use crate::http::dtos::{ErrorResponse, LoginResponse, StateResponse};
use crate::http::handlers::auth as handlers;
use crate::http::middleware::auth_middleware;
use crate::models::IdentityView;
use crate::openapi::RouteDoc;
use crate::services::IdentitySpec;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::login,
        handlers::list_identities,
        handlers::create_identity,
        handlers::get_me,
    ),
    components(schemas(IdentityView, IdentitySpec, LoginResponse, StateResponse, ErrorResponse)),
    tags(
        (name = "Authentication", description = "Operator login"),
        (name = "Identity", description = "Operator identity management")
    )
)]
struct AuthApiDoc;

/// Operator identity component: login plus identity CRUD under
/// `/api/auth`. Everything except login requires a valid operator token;
/// the `me` routes require nothing further, the rest are function-gated.
pub struct AuthComponent;

#[async_trait]
impl Component for AuthComponent {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn setup(&self, env: ComponentEnv) -> Result<ComponentParts, AppError> {
        let protected = Router::new()
            .route(
                "/identity",
                get(handlers::list_identities).post(handlers::create_identity),
            )
            .route(
                "/identity/me",
                get(handlers::get_me).patch(handlers::update_me),
            )
            .route(
                "/identity/:identity_id",
                get(handlers::get_identity)
                    .patch(handlers::update_identity)
                    .delete(handlers::delete_identity),
            )
            .layer(middleware::from_fn_with_state(
                env.app.clone(),
                auth_middleware,
            ));

        let router = Router::new().route("/", post(handlers::login)).merge(protected);

        let routes = vec![
            RouteDoc::new("post", "/"),
            RouteDoc::new("get", "/identity"),
            RouteDoc::new("post", "/identity"),
            RouteDoc::new("get", "/identity/me"),
            RouteDoc::new("patch", "/identity/me"),
            RouteDoc::new("get", "/identity/{identityId}"),
            RouteDoc::new("patch", "/identity/{identityId}"),
            RouteDoc::new("delete", "/identity/{identityId}"),
        ];

        Ok(ComponentParts {
            router,
            routes,
            providers: Default::default(),
        })
    }

    fn openapi(&self) -> Option<Value> {
        serde_json::to_value(AuthApiDoc::openapi()).ok()
    }
}
