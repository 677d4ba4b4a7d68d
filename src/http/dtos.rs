use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    #[schema(example = "success")]
    pub state: String,
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProvisionRequest {
    #[schema(example = "device-0042")]
    pub id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProvisionResponse {
    /// Wrapped client token: `<base64 client id>.<jwt>`.
    pub token: String,
    pub record: TokenRecordView,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenRecordView {
    pub id: String,
    #[schema(value_type = String, format = "date-time")]
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StateResponse {
    #[schema(example = "success")]
    pub state: String,
}

impl StateResponse {
    pub fn success() -> Self {
        Self {
            state: "success".to_string(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "requestError")]
    pub state: String,
    pub reason: String,
}
