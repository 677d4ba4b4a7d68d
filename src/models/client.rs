use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provisioned agent. `current_token_id` tracks the verification record of
/// the token most recently issued for it; `last_state` is the free-form
/// lifecycle string the agent last announced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub current_token_id: Option<String>,
    #[serde(default)]
    pub last_state: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl Client {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created: now,
            updated: now,
            current_token_id: None,
            last_state: None,
            capabilities: Vec::new(),
        }
    }
}

/// Agent-reported capability descriptor, recorded after `capability.report`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Capability {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub messages: Vec<String>,
}
