use chrono::{DateTime, Utc};
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An operator account. `name` is globally unique and immutable after
/// creation; `auth_id` links the life-coupled authentication record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub auth_id: String,
    pub functions: Vec<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated: DateTime<Utc>,
}

impl Identity {
    pub fn new(name: String, auth_id: String, functions: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            auth_id,
            functions,
            created: now,
            updated: now,
        }
    }

    /// API-facing view; the auth link never leaves the server.
    pub fn view(&self) -> IdentityView {
        IdentityView {
            id: self.id.clone(),
            name: self.name.clone(),
            functions: self.functions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct IdentityView {
    pub id: String,
    pub name: String,
    pub functions: Vec<String>,
}

/// Stored credential material, written only by an auth provider's `commit`.
/// The provider-specific payload lives in `record` (the password provider
/// stores `{salt, hash}` there); it is never serialized into a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub method: String,
    pub record: Document,
}

impl AuthenticationRecord {
    pub fn new(method: String, record: Document) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            record,
        }
    }
}
