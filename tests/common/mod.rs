//! Test harness: boots the full server stack over the in-memory document
//! store on a random port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mongodb::bson::Document;
use serde_json::Value;
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use morrigan::config::{AuthConfig, Config, HttpConfig};
use morrigan::lifecycle::Server;
use morrigan::store::{DocumentStore, MemoryStore};

pub const BOOTSTRAP_PASSWORD: &str = "bootstrap-password";

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestApp {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub http: reqwest::Client,
    _state_dir: TempDir,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a config tweak, e.g. a short heartbeat period.
    pub async fn spawn_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let state_dir = tempfile::tempdir().expect("temp state dir");
        let mut config = Config {
            http: HttpConfig {
                port: 0,
                ..HttpConfig::default()
            },
            state_dir: state_dir.path().to_path_buf(),
            auth: AuthConfig {
                bootstrap_password: Some(BOOTSTRAP_PASSWORD.to_string()),
            },
            ..Config::default()
        };
        tweak(&mut config);

        let store = Arc::new(MemoryStore::new());
        let server = Arc::new(Server::with_data_store(config, store.clone()));
        server.start().await.expect("server start");
        let addr = server.http_addr().await.expect("listener address");

        // No idle keep-alive connections: they would sit in the server's
        // graceful-shutdown drain window when a test stops the server.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .expect("http client");

        Self {
            server,
            addr,
            store,
            http,
            _state_dir: state_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Log in as the bootstrap admin and return the bearer token.
    pub async fn admin_token(&self) -> String {
        self.login("admin", BOOTSTRAP_PASSWORD).await
    }

    pub async fn login(&self, name: &str, password: &str) -> String {
        let response = self
            .http
            .post(self.url("/api/auth"))
            .json(&serde_json::json!({ "name": name, "password": password }))
            .send()
            .await
            .expect("login request");
        assert_eq!(response.status(), 200, "login should succeed");
        let body: Value = response.json().await.expect("login body");
        assert_eq!(body["state"], "success");
        body["token"].as_str().expect("token").to_string()
    }

    /// Open an agent WebSocket with the given wrapped client token.
    pub async fn ws_connect(
        &self,
        token: &str,
    ) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
        let mut request = format!("ws://{}/api/connection/connect", self.addr)
            .into_client_request()
            .expect("ws request");
        request.headers_mut().insert(
            "Authorization",
            format!("bearer {token}").parse().expect("header value"),
        );
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    /// Provision a client over HTTP and return `(wrapped token, record id)`.
    pub async fn provision(&self, operator_token: &str, client_id: &str) -> (String, String) {
        let response = self
            .http
            .post(self.url("/api/client/provision"))
            .bearer_auth(operator_token)
            .json(&serde_json::json!({ "id": client_id }))
            .send()
            .await
            .expect("provision request");
        assert_eq!(response.status(), 200, "provision should succeed");
        let body: Value = response.json().await.expect("provision body");
        (
            body["token"].as_str().expect("token").to_string(),
            body["record"]["id"].as_str().expect("record id").to_string(),
        )
    }

    /// Poll the backing store until `predicate` matches a document or the
    /// timeout elapses.
    pub async fn wait_for(
        &self,
        collection: &str,
        filter: Document,
        predicate: impl Fn(&Document) -> bool,
    ) -> Document {
        for _ in 0..100 {
            if let Some(found) = self
                .store
                .find_one(collection, filter.clone())
                .await
                .expect("store read")
            {
                if predicate(&found) {
                    return found;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached for {collection} / {filter:?}");
    }
}

/// Read frames until a typed JSON message arrives, skipping pings.
pub async fn next_typed_message(ws: &mut WsClient) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")?;
        match frame {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(&text).expect("json frame"))
            }
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

pub fn doc_str<'a>(document: &'a Document, key: &str) -> &'a str {
    document.get_str(key).expect("string field")
}
