//! The lifecycle supervisor: a strict state machine that owns setup, start,
//! and stop for one server instance, fanning each transition out to
//! registered observers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde_json::Value;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::component::{builtin_registry, Component, ComponentHost};
use crate::config::Config;
use crate::error::AppError;
use crate::http::handlers::connection as connection_handlers;
use crate::models::RuntimeInfo;
use crate::openapi::{aggregate, RouteDoc};
use crate::services::{
    ClientRegistry, ConnectionManager, IdentityService, InstanceReporter, TokenService,
};
use crate::store::{DocumentStore, FsStateStore, MemoryStore, MongoStore, StateStore};
use crate::{AppState, ServerInfo};

const TOKEN_ISSUER: &str = "morrigan";

/// Server states in their strict total order. `Error` is terminal and
/// reachable from any state before `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Instanced,
    Initializing,
    Initialized,
    Starting,
    StartingConnected,
    Started,
    Ready,
    Stopping,
    Stopped,
    Error,
}

impl ServerState {
    pub fn order(&self) -> u8 {
        match self {
            ServerState::Instanced => 0,
            ServerState::Initializing => 1,
            ServerState::Initialized => 2,
            ServerState::Starting => 3,
            ServerState::StartingConnected => 4,
            ServerState::Started => 5,
            ServerState::Ready => 6,
            ServerState::Stopping => 7,
            ServerState::Stopped => 8,
            ServerState::Error => 9,
        }
    }

    /// The event fired on entering this state.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerState::Instanced => "instanced",
            ServerState::Initializing => "initializing",
            ServerState::Initialized => "initialized",
            ServerState::Starting => "starting",
            ServerState::StartingConnected => "startingConnected",
            ServerState::Started => "started",
            ServerState::Ready => "ready",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Error => "error",
        }
    }
}

type Observer = Box<dyn Fn(&str) + Send + Sync>;

struct SetupParts {
    state_store: Arc<dyn StateStore>,
    components: Vec<Arc<dyn Component>>,
    runtime_info: RuntimeInfo,
}

struct RunningParts {
    app: AppState,
    host: ComponentHost,
    reporter: Arc<InstanceReporter>,
    http_handle: axum_server::Handle,
    server_task: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

/// One server instance. Construct, `start()`, eventually `stop(reason)`.
/// All methods take `&self`; concurrent calls are serialized through the
/// state lock and redundant stop calls collapse to nothing.
pub struct Server {
    config: Config,
    instance_id: std::sync::Mutex<String>,
    state: Mutex<ServerState>,
    observers: std::sync::Mutex<Vec<(String, Observer)>>,
    captured_error: std::sync::Mutex<Option<String>>,
    setup_parts: Mutex<Option<SetupParts>>,
    running: Mutex<Option<RunningParts>>,
    injected_store: Mutex<Option<Arc<dyn DocumentStore>>>,
    component_errors: Mutex<Option<crate::component::ComponentErrors>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            instance_id: std::sync::Mutex::new(Uuid::new_v4().to_string()),
            state: Mutex::new(ServerState::Instanced),
            observers: std::sync::Mutex::new(Vec::new()),
            captured_error: std::sync::Mutex::new(None),
            setup_parts: Mutex::new(None),
            running: Mutex::new(None),
            injected_store: Mutex::new(None),
            component_errors: Mutex::new(None),
        }
    }

    /// Run against an injected document store instead of connecting to
    /// MongoDB. The test harness boots on a [`MemoryStore`] this way.
    pub fn with_data_store(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let server = Self::new(config);
        *server.injected_store.try_lock().expect("fresh server") = Some(store);
        server
    }

    /// This server's stable instance id. Persisted in the state store, so
    /// an instance keeps its identity across restarts.
    pub fn instance_id(&self) -> String {
        self.instance_id.lock().expect("id lock").clone()
    }

    pub async fn state(&self) -> ServerState {
        *self.state.lock().await
    }

    /// The error that drove the server into `Error`, if any.
    pub fn captured_error(&self) -> Option<String> {
        self.captured_error.lock().expect("error lock").clone()
    }

    /// Subscribe to one lifecycle event by name. Observers must not block:
    /// they run inline with the transition and a slow observer delays it.
    pub fn on(&self, event: &str, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer lock")
            .push((event.to_string(), Box::new(observer)));
    }

    /// Address the HTTP listener is bound to, once `Ready`.
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Per-component, per-hook errors captured so far. Stays readable after
    /// stop so observers can inspect the shutdown outcome.
    pub async fn component_errors(&self) -> HashMap<String, HashMap<String, String>> {
        match self.component_errors.lock().await.as_ref() {
            Some(errors) => errors.lock().await.clone(),
            None => HashMap::new(),
        }
    }

    fn emit(&self, state: ServerState) {
        let name = state.event_name();
        tracing::debug!(event = %name, "Lifecycle transition");
        let observers = self.observers.lock().expect("observer lock");
        for (event, observer) in observers.iter() {
            if event == name {
                observer(name);
            }
        }
    }

    async fn transition(&self, to: ServerState) {
        *self.state.lock().await = to;
        self.emit(to);
    }

    async fn fail(&self, error: &AppError) {
        *self.captured_error.lock().expect("error lock") = Some(error.to_string());
        self.transition(ServerState::Error).await;
    }

    /// Load configuration-derived parts: the state store, the active
    /// component set, and runtime info. Only valid from `Instanced`.
    pub async fn setup(&self) -> Result<(), AppError> {
        {
            let state = self.state.lock().await;
            if *state != ServerState::Instanced {
                return Err(AppError::RequestError(format!(
                    "setup is not valid from the {:?} state",
                    *state
                )));
            }
        }
        self.transition(ServerState::Initializing).await;

        match self.do_setup().await {
            Ok(parts) => {
                *self.setup_parts.lock().await = Some(parts);
                self.transition(ServerState::Initialized).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Server setup failed");
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn do_setup(&self) -> Result<SetupParts, AppError> {
        self.config.validate()?;

        let state_store: Arc<dyn StateStore> =
            Arc::new(FsStateStore::open(&self.config.state_dir).await?);

        // Server info: a restarted instance keeps its id.
        match state_store.get("server/id").await? {
            Some(bytes) => {
                let id = String::from_utf8(bytes).map_err(|_| {
                    AppError::Configuration("state store holds an invalid server id".into())
                })?;
                *self.instance_id.lock().expect("id lock") = id;
            }
            None => {
                let id = self.instance_id();
                state_store.put("server/id", id.as_bytes()).await?;
            }
        }

        let host = ComponentHost::from_config(builtin_registry(), &self.config.components)?;
        let component_names = host.names();
        tracing::info!(components = ?component_names, "Resolved active components");

        // Re-resolve into the parts; the host itself is rebuilt at start so
        // a failed start can be retried from a clean error map.
        let components: Vec<Arc<dyn Component>> = builtin_registry()
            .into_iter()
            .filter(|c| component_names.contains(&c.name().to_string()))
            .collect();

        Ok(SetupParts {
            state_store,
            components,
            runtime_info: RuntimeInfo::capture(),
        })
    }

    /// Bring the server to `Ready`: open the data store, bind the listener,
    /// set up components, install `/api-docs`, start the reporter.
    pub async fn start(&self) -> Result<(), AppError> {
        {
            let state = self.state.lock().await;
            match *state {
                ServerState::Instanced => {
                    drop(state);
                    self.setup().await?;
                }
                ServerState::Initialized => {}
                other => {
                    return Err(AppError::RequestError(format!(
                        "start is not valid from the {other:?} state"
                    )));
                }
            }
        }
        self.transition(ServerState::Starting).await;

        match self.do_start().await {
            Ok(running) => {
                *self.component_errors.lock().await = Some(running.host.errors());
                *self.running.lock().await = Some(running);
                self.transition(ServerState::Ready).await;
                tracing::info!(instance = %self.instance_id(), "Server ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Server start failed");
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn do_start(&self) -> Result<RunningParts, AppError> {
        let parts = self
            .setup_parts
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("setup parts missing")))?;

        // Data store first: everything downstream persists through it.
        let data: Arc<dyn DocumentStore> = match self.injected_store.lock().await.take() {
            Some(store) => store,
            None => {
                let uri = self.config.database.connection_string.as_deref().ok_or_else(
                    || {
                        AppError::Configuration(
                            "database.connection_string is required".into(),
                        )
                    },
                )?;
                Arc::new(MongoStore::connect(uri, &self.config.database.dbname).await?)
            }
        };
        self.transition(ServerState::StartingConnected).await;

        // Bind before component setup so `started` reflects a held port.
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.http.port));
        let listener = std::net::TcpListener::bind(bind_addr)
            .map_err(|e| AppError::Configuration(format!("cannot bind {bind_addr}: {e}")))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.transition(ServerState::Started).await;

        let tls = if self.config.http.secure {
            let cert = self.config.http.cert_path.as_ref().expect("validated");
            let key = self.config.http.key_path.as_ref().expect("validated");
            Some(
                axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| {
                        AppError::Configuration(format!("cannot load TLS material: {e}"))
                    })?,
            )
        } else {
            None
        };

        let tokens = TokenService::new(
            data.clone(),
            TOKEN_ISSUER,
            self.config.token.rotation_interval_secs,
        )?;
        let identities = Arc::new(IdentityService::new(
            data.clone(),
            crate::auth::ProviderRegistry::builtin(),
            tokens.clone(),
        ));
        identities
            .bootstrap(self.config.auth.bootstrap_password.as_deref())
            .await?;

        let clients = Arc::new(ClientRegistry::new(data.clone(), tokens.clone()));
        let connections = Arc::new(ConnectionManager::new(
            data.clone(),
            self.instance_id(),
            std::time::Duration::from_secs(self.config.connection.heartbeat_secs),
        ));

        let info = ServerInfo {
            id: self.instance_id(),
            runtime: parts.runtime_info.clone(),
        };

        let app = AppState {
            config: Arc::new(self.config.clone()),
            info,
            data: data.clone(),
            state: parts.state_store.clone(),
            tokens: tokens.clone(),
            identities,
            clients,
            connections,
            providers: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        };

        // Component setup runs concurrently; failures land in the error map
        // and never stop the lifecycle.
        let host = ComponentHost::from_config(parts.components.clone(), &self.config.components)?;
        let scheme = if tls.is_some() { "https" } else { "http" };
        let base_url = format!("{scheme}://localhost:{}", local_addr.port());
        let host_parts = host.setup_all(&app, &base_url).await;

        // Core connection routes live beside the component mounts.
        let connection_router = Router::new()
            .route("/connect", get(connection_handlers::connect))
            .merge(
                Router::new()
                    .route("/", get(connection_handlers::list_connections))
                    .route("/:connection_id", get(connection_handlers::get_connection))
                    .route(
                        "/:connection_id/send",
                        axum::routing::post(connection_handlers::send),
                    )
                    .layer(axum::middleware::from_fn_with_state(
                        app.clone(),
                        crate::http::middleware::auth_middleware,
                    )),
            );

        let mut routes = host_parts.routes;
        routes.extend([
            RouteDoc::new("get", "/api/connection"),
            RouteDoc::new("get", "/api/connection/{connectionId}"),
            RouteDoc::new("post", "/api/connection/{connectionId}/send"),
            RouteDoc::new("get", "/api/connection/connect"),
        ]);

        let api_doc = aggregate(
            "morrigan",
            env!("CARGO_PKG_VERSION"),
            &host_parts.fragments,
            &routes,
        );

        let router = Router::new()
            .merge(host_parts.router)
            .nest("/api/connection", connection_router)
            .route(
                "/api-docs",
                get(move || {
                    let doc = api_doc.clone();
                    async move { Json::<Value>(doc) }
                }),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(app.clone());

        let make = router.into_make_service_with_connect_info::<SocketAddr>();
        let http_handle = axum_server::Handle::new();
        let server_task = match tls {
            Some(tls) => {
                let server =
                    axum_server::from_tcp_rustls(listener, tls).handle(http_handle.clone());
                tokio::spawn(async move {
                    if let Err(e) = server.serve(make).await {
                        tracing::error!(error = %e, "HTTP server terminated abnormally");
                    }
                })
            }
            None => {
                let server = axum_server::from_tcp(listener).handle(http_handle.clone());
                tokio::spawn(async move {
                    if let Err(e) = server.serve(make).await {
                        tracing::error!(error = %e, "HTTP server terminated abnormally");
                    }
                })
            }
        };
        tracing::info!(address = %local_addr, scheme = %scheme, "HTTP listener up");

        let reporter = Arc::new(InstanceReporter::new(
            data,
            self.instance_id(),
            host.names(),
            parts.runtime_info,
        ));
        reporter.start().await?;

        Ok(RunningParts {
            app,
            host,
            reporter,
            http_handle,
            server_task,
            local_addr,
        })
    }

    /// Stop a `Ready` server. From any other state this is a no-op so that
    /// process-exit handlers can call it unconditionally; concurrent calls
    /// collapse to a single execution.
    pub async fn stop(&self, reason: &str) -> Result<(), AppError> {
        {
            let mut state = self.state.lock().await;
            if *state != ServerState::Ready {
                return Ok(());
            }
            *state = ServerState::Stopping;
        }
        self.emit(ServerState::Stopping);
        tracing::info!(reason = %reason, "Server stopping");

        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("running parts missing")))?;

        // Component shutdown first; a wedged component wedges stop, which is
        // the point: it surfaces the bug instead of hiding it.
        running.host.shutdown_all(reason).await;

        // Sessions end with their server; agents reconnect elsewhere.
        running.app.connections.shutdown().await;

        // Drain in-flight requests, then wait for the accept loop to exit.
        // In-flight work gets a 30 s window before the listener is torn down.
        running
            .http_handle
            .graceful_shutdown(Some(std::time::Duration::from_secs(30)));
        if let Err(e) = running.server_task.await {
            tracing::error!(error = %e, "HTTP server task join failed");
        }

        running.reporter.stop(reason).await?;
        running.app.tokens.dispose();

        self.transition(ServerState::Stopped).await;
        tracing::info!("Server stopped");
        Ok(())
    }
}

/// Convenience constructor for an embedded, memory-backed server. Used by
/// tests and local experiments.
pub fn embedded(config: Config) -> Server {
    Server::with_data_store(config, Arc::new(MemoryStore::new()))
}
