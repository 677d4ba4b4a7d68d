use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verification record for one issued token. The token's `kid` header is
/// this record's id; replacing the record (same subject, new id) is what
/// revokes the predecessor token everywhere in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub issuer: String,
    pub subject: String,
    /// PEM-encoded P-256 public key of the pair that signed the token.
    pub public_key: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub issued: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(
        issuer: String,
        subject: String,
        public_key: String,
        issued: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            issuer,
            subject,
            public_key,
            issued,
            expires,
        }
    }
}
