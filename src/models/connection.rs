use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live (or recently closed) agent session. Persisted so any instance can
/// see who is connected where; mutated only by the owning session task and
/// its heartbeat timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(rename = "_id")]
    pub id: String,
    pub client_id: String,
    pub server_instance_id: String,
    pub peer_address: String,
    pub authenticated: bool,
    pub alive: bool,
    pub open: bool,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub last_heartbeat: DateTime<Utc>,
}

impl Connection {
    pub fn new(client_id: String, server_instance_id: String, peer_address: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id,
            server_instance_id,
            peer_address,
            authenticated: true,
            alive: true,
            open: true,
            last_heartbeat: Utc::now(),
        }
    }
}
