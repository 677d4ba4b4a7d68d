//! The component host. Components are the unit of server extension: each
//! one mounts a router under `/api/<name>`, may contribute session message
//! handlers and an OpenAPI fragment, and gets lifecycle hooks with
//! per-component error isolation. The registry is static; configuration
//! selects which registered names are active.

mod auth;
mod client;

pub use auth::AuthComponent;
pub use client::ClientComponent;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::openapi::RouteDoc;
use crate::services::SessionHandle;
use crate::store::{DocumentStore, ScopedDocumentStore, ScopedStateStore, StateStore};
use crate::{AppState, ServerInfo};

/// Handler for one session message type. Invoked by the connection manager
/// with the parsed frame, the originating session, and the core environment.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: Value,
        session: &SessionHandle,
        state: &AppState,
    ) -> Result<(), AppError>;
}

/// `provider name -> message name -> handler`, consulted by the connection
/// manager for every inbound `<provider>.<message>` frame.
pub type ProviderMap = HashMap<String, HashMap<String, Arc<dyn MessageHandler>>>;

/// The environment a component sees: namespaced stores, server info, its
/// freeform spec from configuration, the base URL it is mounted under, and
/// the core environment for wiring middleware and reaching core services.
/// The scoped stores cannot reach outside the component's namespace.
pub struct ComponentEnv {
    pub name: String,
    pub spec: Value,
    pub data: Arc<dyn DocumentStore>,
    pub state: Arc<dyn StateStore>,
    pub info: ServerInfo,
    pub base_url: String,
    pub app: AppState,
}

/// What a component hands back from `setup`.
pub struct ComponentParts {
    /// Routes relative to the component mount; the host nests this under
    /// `/api/<name>`.
    pub router: Router<AppState>,
    /// Route descriptors for the OpenAPI aggregator, relative like `router`.
    pub routes: Vec<RouteDoc>,
    /// Session message handlers to install, keyed by provider then message.
    pub providers: ProviderMap,
}

impl Default for ComponentParts {
    fn default() -> Self {
        Self {
            router: Router::new(),
            routes: Vec::new(),
            providers: HashMap::new(),
        }
    }
}

/// A wrapper applied around a component's mounted router, the axum shape of
/// a component-supplied middleware stack.
pub type RouterTransform = Box<dyn FnOnce(Router<AppState>) -> Router<AppState> + Send>;

#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    async fn setup(&self, env: ComponentEnv) -> Result<ComponentParts, AppError>;

    async fn on_shutdown(&self, _reason: &str) -> Result<(), AppError> {
        Ok(())
    }

    /// Middleware wrapped around everything the component mounted.
    fn middleware(&self, _app: &AppState) -> Option<RouterTransform> {
        None
    }

    /// OpenAPI fragment merged into the aggregated document.
    fn openapi(&self) -> Option<Value> {
        None
    }
}

/// All registered components. Configuration picks the active subset by name.
pub fn builtin_registry() -> Vec<Arc<dyn Component>> {
    vec![Arc::new(AuthComponent), Arc::new(ClientComponent)]
}

/// Errors captured per component, per hook (`setup` / `shutdown`). A
/// component failing a hook never affects its peers or the lifecycle.
pub type ComponentErrors = Arc<Mutex<HashMap<String, HashMap<String, String>>>>;

pub struct ComponentHost {
    components: Vec<Arc<dyn Component>>,
    errors: ComponentErrors,
}

impl std::fmt::Debug for ComponentHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHost")
            .field("components", &self.components.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("errors", &self.errors)
            .finish()
    }
}

/// Everything the host assembled during setup.
pub struct HostParts {
    pub router: Router<AppState>,
    pub routes: Vec<RouteDoc>,
    pub fragments: Vec<Value>,
}

impl ComponentHost {
    /// Resolve the configured component names against `registry`. Unknown
    /// names are a configuration error: the operator asked for something
    /// that is not compiled in.
    pub fn from_config(
        registry: Vec<Arc<dyn Component>>,
        configured: &HashMap<String, Value>,
    ) -> Result<Self, AppError> {
        let mut components = Vec::new();
        for name in configured.keys() {
            let component = registry
                .iter()
                .find(|c| c.name() == name.as_str())
                .cloned()
                .ok_or_else(|| {
                    AppError::Configuration(format!("no registered component named {name:?}"))
                })?;
            components.push(component);
        }
        components.sort_by_key(|c| c.name());
        Ok(Self {
            components,
            errors: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.components.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn errors(&self) -> ComponentErrors {
        self.errors.clone()
    }

    async fn record_error(&self, component: &str, hook: &str, error: &AppError) {
        tracing::error!(
            component = %component,
            hook = %hook,
            error = %error,
            "Component hook failed"
        );
        self.errors
            .lock()
            .await
            .entry(component.to_string())
            .or_default()
            .insert(hook.to_string(), error.to_string());
    }

    /// Run every component's `setup` concurrently and assemble the mounted
    /// routers, route docs, and OpenAPI fragments. Failures are recorded and
    /// isolated; the returned parts cover the components that succeeded.
    pub async fn setup_all(&self, app: &AppState, base_url: &str) -> HostParts {
        let setups = self.components.iter().map(|component| {
            let name = component.name();
            let env = ComponentEnv {
                name: name.to_string(),
                spec: app
                    .config
                    .components
                    .get(name)
                    .cloned()
                    .unwrap_or(Value::Null),
                data: Arc::new(ScopedDocumentStore::new(app.data.clone(), name)),
                state: Arc::new(ScopedStateStore::new(app.state.clone(), name)),
                info: app.info.clone(),
                base_url: format!("{base_url}/api/{name}"),
                app: app.clone(),
            };
            let middleware = component.middleware(app);
            let openapi = component.openapi();
            async move { (name, component.setup(env).await, openapi, middleware) }
        });

        let mut parts = HostParts {
            router: Router::new(),
            routes: Vec::new(),
            fragments: Vec::new(),
        };

        for (name, result, fragment, middleware) in futures::future::join_all(setups).await {
            match result {
                Ok(component_parts) => {
                    let mount = format!("/api/{name}");
                    let mut component_router = component_parts.router;
                    if let Some(wrap) = middleware {
                        component_router = wrap(component_router);
                    }
                    parts.router = parts.router.nest(&mount, component_router);
                    for route in component_parts.routes {
                        parts.routes.push(route.mounted_under(&mount));
                    }
                    if !component_parts.providers.is_empty() {
                        let mut providers = app.providers.write().await;
                        for (provider, messages) in component_parts.providers {
                            providers.entry(provider).or_default().extend(messages);
                        }
                    }
                    if let Some(fragment) = fragment {
                        parts.fragments.push(fragment);
                    }
                    tracing::info!(component = %name, "Component set up");
                }
                Err(e) => {
                    self.record_error(name, "setup", &e).await;
                }
            }
        }

        parts
    }

    /// Run every component's `on_shutdown` concurrently, recording failures.
    pub async fn shutdown_all(&self, reason: &str) {
        let shutdowns = self.components.iter().map(|component| {
            let name = component.name();
            async move { (name, component.on_shutdown(reason).await) }
        });

        for (name, result) in futures::future::join_all(shutdowns).await {
            if let Err(e) = result {
                self.record_error(name, "shutdown", &e).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_auth_and_client() {
        let names: Vec<&str> = builtin_registry().iter().map(|c| c.name()).collect();
        assert!(names.contains(&"auth"));
        assert!(names.contains(&"client"));
    }

    #[test]
    fn unknown_configured_component_is_rejected() {
        let mut configured = HashMap::new();
        configured.insert("telemetry".to_string(), Value::Null);
        let err = ComponentHost::from_config(builtin_registry(), &configured).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn host_resolves_configured_subset() {
        let mut configured = HashMap::new();
        configured.insert("auth".to_string(), Value::Null);
        let host = ComponentHost::from_config(builtin_registry(), &configured).unwrap();
        assert_eq!(host.names(), vec!["auth"]);
    }
}
