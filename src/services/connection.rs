use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{sink::SinkExt, stream::SplitStream, stream::StreamExt};
use mongodb::bson::{self, doc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{collections, Connection};
use crate::store::DocumentStore;
use crate::AppState;

const OUTBOUND_BUFFER: usize = 32;

/// In-memory handle to a session this instance owns. Cheap to clone; frame
/// writes go through the session's outbound channel so the socket is only
/// ever written from its writer task.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

struct SessionShared {
    id: String,
    client_id: String,
    outbound: mpsc::Sender<Message>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub async fn send_json(&self, value: &Value) -> Result<(), AppError> {
        self.send_text(value.to_string()).await
    }

    pub async fn send_text(&self, text: String) -> Result<(), AppError> {
        self.inner
            .outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| AppError::RequestError(format!("connection {} is closed", self.inner.id)))
    }

    /// Ask the owning task to close the session.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }
}

/// A message on its way to an agent. Strings pass through verbatim;
/// everything else is serialized as JSON.
pub enum Outbound {
    Text(String),
    Json(Value),
}

impl Outbound {
    fn into_text(self) -> String {
        match self {
            Outbound::Text(text) => text,
            Outbound::Json(value) => value.to_string(),
        }
    }
}

/// Owns every agent session on this instance: the accept handshake, the
/// at-most-one-session check, per-session heartbeat, frame routing to
/// provider handlers, and cleanup. Session records are persisted so peers
/// can see who is connected where.
pub struct ConnectionManager {
    data: Arc<dyn DocumentStore>,
    instance_id: String,
    heartbeat_period: std::time::Duration,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl ConnectionManager {
    pub fn new(
        data: Arc<dyn DocumentStore>,
        instance_id: impl Into<String>,
        heartbeat_period: std::time::Duration,
    ) -> Self {
        Self {
            data,
            instance_id: instance_id.into(),
            heartbeat_period,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Drive one authenticated socket to completion. Called from the upgrade
    /// handler after the client token has been verified.
    pub async fn run_session(
        &self,
        state: AppState,
        socket: WebSocket,
        peer: SocketAddr,
        client_id: String,
    ) {
        match self.accept(socket, peer, &client_id).await {
            Ok(Some((record, handle, stream))) => {
                self.serve(state, record, handle, stream).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(client = %client_id, error = %e, "Session accept failed");
            }
        }
    }

    /// The accept handshake: enforce at-most-one-session, persist the
    /// session row, re-check for a racing duplicate, greet the agent.
    /// Returns `None` when the connection was rejected. The write half of
    /// the socket moves into a writer task fed by the session's outbound
    /// channel; the read half comes back for the serve loop.
    async fn accept(
        &self,
        socket: WebSocket,
        peer: SocketAddr,
        client_id: &str,
    ) -> Result<Option<(Connection, SessionHandle, SplitStream<WebSocket>)>, AppError> {
        let existing = self
            .data
            .find(collections::CONNECTIONS, doc! { "clientId": client_id })
            .await?;

        if existing
            .iter()
            .any(|row| row.get_bool("alive").unwrap_or(false))
        {
            tracing::warn!(
                client = %client_id,
                "Rejecting connection: client already has a live session"
            );
            let _ = socket.close().await;
            return Ok(None);
        }

        // Leftovers from closed or crashed sessions.
        for row in &existing {
            if let Ok(id) = row.get_str("_id") {
                self.data
                    .delete_one(collections::CONNECTIONS, doc! { "_id": id })
                    .await?;
            }
        }

        let record = Connection::new(
            client_id.to_string(),
            self.instance_id.clone(),
            peer.to_string(),
        );
        self.data
            .insert_one(collections::CONNECTIONS, bson::to_document(&record)?)
            .await?;

        // The existence check above is not atomic with the insert. Re-read:
        // if a concurrent accept won (earlier record id), back out our own.
        // Any failure from here on must also back the row out, or it would
        // block the client's future connections.
        let live = match self
            .data
            .find(
                collections::CONNECTIONS,
                doc! { "clientId": client_id, "alive": true },
            )
            .await
        {
            Ok(live) => live,
            Err(e) => {
                let _ = self
                    .data
                    .delete_one(collections::CONNECTIONS, doc! { "_id": &record.id })
                    .await;
                return Err(e);
            }
        };
        let lost_race = live.iter().any(|row| {
            row.get_str("_id")
                .map(|id| id != record.id && id < record.id.as_str())
                .unwrap_or(false)
        });
        if lost_race {
            tracing::warn!(
                client = %client_id,
                session = %record.id,
                "Lost duplicate-session race, closing own connection"
            );
            self.data
                .delete_one(collections::CONNECTIONS, doc! { "_id": &record.id })
                .await?;
            let _ = socket.close().await;
            return Ok(None);
        }

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = SessionHandle {
            inner: Arc::new(SessionShared {
                id: record.id.clone(),
                client_id: client_id.to_string(),
                outbound,
                alive: AtomicBool::new(true),
                cancel: CancellationToken::new(),
            }),
        };
        self.sessions
            .lock()
            .await
            .insert(record.id.clone(), handle.clone());

        let (mut sink, stream) = socket.split();
        let mut outbound_rx = outbound_rx;
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tracing::info!(
            client = %client_id,
            session = %record.id,
            peer = %peer,
            "Accepted agent session"
        );

        Ok(Some((record, handle, stream)))
    }

    async fn serve(
        &self,
        state: AppState,
        mut record: Connection,
        handle: SessionHandle,
        mut stream: SplitStream<WebSocket>,
    ) {
        // Greet, then solicit the capability list. A send failure here means
        // the transport is already gone; fall through to cleanup.
        let greeted = handle
            .send_json(&json!({ "type": "connection.state", "state": "accepted" }))
            .await
            .and(
                handle
                    .send_json(&json!({ "type": "capability.report" }))
                    .await,
            );
        if let Err(e) = greeted {
            tracing::warn!(session = %record.id, error = %e, "Session closed before greeting");
            self.cleanup(&state, record, handle).await;
            return;
        }

        let mut ticker = tokio::time::interval(self.heartbeat_period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = handle.inner.cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if !handle.inner.alive.load(Ordering::SeqCst) {
                        tracing::warn!(
                            session = %record.id,
                            client = %record.client_id,
                            "Heartbeat missed: no pong since previous tick"
                        );
                    }
                    handle.inner.alive.store(false, Ordering::SeqCst);
                    record.alive = false;
                    if let Err(e) = self.persist(&record).await {
                        tracing::error!(session = %record.id, error = %e, "Failed to persist heartbeat state");
                    }
                    if handle.inner.outbound.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }

                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.route_frame(&state, &handle, &text).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            handle.inner.alive.store(true, Ordering::SeqCst);
                            record.alive = true;
                            record.last_heartbeat = Utc::now();
                            if let Err(e) = self.persist(&record).await {
                                tracing::error!(session = %record.id, error = %e, "Failed to persist heartbeat");
                            }
                        }
                        // The transport answers pings; binary frames are not
                        // part of the protocol.
                        Some(Ok(Message::Ping(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            tracing::debug!(session = %record.id, "Ignoring binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::debug!(session = %record.id, error = %e, "Socket error");
                            break;
                        }
                    }
                }
            }
        }

        self.cleanup(&state, record, handle).await;
    }

    /// Parse and dispatch one inbound frame. Malformed frames and unknown
    /// types are logged and dropped; they never end the session.
    async fn route_frame(&self, state: &AppState, session: &SessionHandle, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "Ignoring unparseable frame");
                return;
            }
        };

        let Some(message_type) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            tracing::warn!(session = %session.id(), "Ignoring frame without a type");
            return;
        };

        let Some((provider, message)) = message_type.split_once('.') else {
            tracing::warn!(
                session = %session.id(),
                message_type = %message_type,
                "Ignoring frame with untyped provider"
            );
            return;
        };

        let handler = {
            let providers = state.providers.read().await;
            providers
                .get(provider)
                .and_then(|messages| messages.get(message))
                .cloned()
        };

        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle(value, session, state).await {
                    tracing::error!(
                        session = %session.id(),
                        message_type = %message_type,
                        error = %e,
                        "Message handler failed"
                    );
                }
            }
            None => {
                tracing::debug!(
                    session = %session.id(),
                    message_type = %message_type,
                    "No handler for message type"
                );
            }
        }
    }

    async fn cleanup(&self, state: &AppState, mut record: Connection, handle: SessionHandle) {
        handle.inner.alive.store(false, Ordering::SeqCst);
        handle.inner.cancel.cancel();

        record.alive = false;
        record.open = false;
        if let Err(e) = self.persist(&record).await {
            tracing::error!(session = %record.id, error = %e, "Failed to persist session close");
        }

        self.sessions.lock().await.remove(&record.id);

        // A gracefully stopping agent reported its own terminal state; for
        // everything else the truth is now unknown.
        match state.clients.get_client(&record.client_id).await {
            Ok(Some(client)) => {
                let stopped = client
                    .last_state
                    .as_deref()
                    .map(|s| s.starts_with("stopped"))
                    .unwrap_or(false);
                if !stopped {
                    if let Err(e) = state.clients.set_state(&record.client_id, "unknown").await {
                        tracing::error!(client = %record.client_id, error = %e, "Failed to reset client state");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(client = %record.client_id, error = %e, "Failed to load client during cleanup");
            }
        }

        tracing::info!(session = %record.id, client = %record.client_id, "Session closed");
    }

    async fn persist(&self, record: &Connection) -> Result<(), AppError> {
        self.data
            .replace_one(
                collections::CONNECTIONS,
                doc! { "_id": &record.id },
                bson::to_document(record)?,
                false,
            )
            .await?;
        Ok(())
    }

    /// Send a message to a session. The session record decides the failure:
    /// unknown id, closed session, or a session owned by another instance
    /// (forwarding is the caller's problem).
    pub async fn send(&self, session_id: &str, message: Outbound) -> Result<(), AppError> {
        let row = self
            .data
            .find_one(collections::CONNECTIONS, doc! { "_id": session_id })
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no such connection {session_id}")))?;
        let record: Connection = bson::from_document(row)?;

        if !record.alive || !record.open {
            return Err(AppError::RequestError(format!(
                "connection {session_id} is closed"
            )));
        }
        if record.server_instance_id != self.instance_id {
            return Err(AppError::RequestError(format!(
                "connection {session_id} is owned by server instance {}",
                record.server_instance_id
            )));
        }

        let handle = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                AppError::RequestError(format!("connection {session_id} is closed"))
            })?;

        handle.send_text(message.into_text()).await
    }

    pub async fn get_connection(&self, session_id: &str) -> Result<Option<Connection>, AppError> {
        let row = self
            .data
            .find_one(collections::CONNECTIONS, doc! { "_id": session_id })
            .await?;
        row.map(|d| bson::from_document(d).map_err(AppError::from))
            .transpose()
    }

    pub async fn list_connections(&self) -> Result<Vec<Connection>, AppError> {
        let rows = self.data.find(collections::CONNECTIONS, doc! {}).await?;
        rows.into_iter()
            .map(|d| bson::from_document(d).map_err(AppError::from))
            .collect()
    }

    /// Close every session this instance owns and wait for their tasks to
    /// finish cleanup. Used on server stop.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> =
            self.sessions.lock().await.values().cloned().collect();
        for handle in &handles {
            handle.close();
        }

        // Session tasks persist their close on the way out; give them a
        // bounded window to drain.
        for _ in 0..100 {
            if self.sessions.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

