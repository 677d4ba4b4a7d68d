//! Morrigan: an extensible device-management control plane.
//!
//! A fleet of long-lived agents holds bidirectional WebSocket sessions with
//! a cluster of equivalent server instances; operators manage agents over an
//! HTTP/JSON API gated by short-lived bearer tokens. Instances share one
//! document store, which carries the cluster-wide coordination points: token
//! verification records, session rows, and per-instance liveness rows.

pub mod auth;
pub mod component;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod openapi;
pub mod services;
pub mod store;

use std::sync::Arc;

use crate::component::ProviderMap;
use crate::models::RuntimeInfo;
use crate::services::{
    ClientRegistry, ConnectionManager, IdentityService, TokenService,
};
use crate::store::{DocumentStore, StateStore};

/// Identity of this server instance, shared with components and persisted
/// in the instance row.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: String,
    pub runtime: RuntimeInfo,
}

/// Shared application state: every long-lived subsystem is a constructed
/// object owned here and injected into handlers and components. There are
/// no process-wide globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub info: ServerInfo,
    pub data: Arc<dyn DocumentStore>,
    pub state: Arc<dyn StateStore>,
    pub tokens: Arc<TokenService>,
    pub identities: Arc<IdentityService>,
    pub clients: Arc<ClientRegistry>,
    pub connections: Arc<ConnectionManager>,
    /// Session message handlers, filled in by component setup.
    pub providers: Arc<tokio::sync::RwLock<ProviderMap>>,
}
