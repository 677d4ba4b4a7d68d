use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-server liveness row. `live` plus a recent `check_in_time` is how
/// peers discover healthy instances; readers treat a `live` row with an old
/// check-in as stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    #[serde(rename = "_id")]
    pub id: String,
    pub components: Vec<String>,
    pub runtime_info: RuntimeInfo,
    pub live: bool,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub check_in_time: DateTime<Utc>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub version: String,
    pub os: String,
    pub pid: u32,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub started: DateTime<Utc>,
}

impl RuntimeInfo {
    pub fn capture() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            pid: std::process::id(),
            started: Utc::now(),
        }
    }
}
