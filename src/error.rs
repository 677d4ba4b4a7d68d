use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Wire-level error classification. These tags travel in `{state, reason}`
/// response bodies and in log lines; handlers never leak raw library errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RequestError,
    ServerConfigurationError,
    ServerAuthCommitFailed,
    ServerMissingAuthRecord,
    NoRecordError,
    InvalidRecordError,
    InvalidTokenError,
    AuthenticationFailed,
    Failed,
    ServerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RequestError => "requestError",
            ErrorKind::ServerConfigurationError => "serverConfigurationError",
            ErrorKind::ServerAuthCommitFailed => "serverAuthCommitFailed",
            ErrorKind::ServerMissingAuthRecord => "serverMissingAuthRecord",
            ErrorKind::NoRecordError => "noRecordError",
            ErrorKind::InvalidRecordError => "invalidRecordError",
            ErrorKind::InvalidTokenError => "invalidTokenError",
            ErrorKind::AuthenticationFailed => "authenticationFailed",
            ErrorKind::Failed => "failed",
            ErrorKind::ServerError => "serverError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    RequestError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Legacy state used by operator login failures.
    #[error("Failed: {0}")]
    Failed(String),

    #[error("Server configuration error: {0}")]
    Configuration(String),

    #[error("Auth provider commit failed: {0}")]
    AuthCommitFailed(#[source] anyhow::Error),

    #[error("Missing authentication record: {0}")]
    MissingAuthRecord(String),

    #[error("Token verification failed: {kind}: {reason}")]
    Token { kind: ErrorKind, reason: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::RequestError(_) => ErrorKind::RequestError,
            AppError::Forbidden(_) => ErrorKind::AuthenticationFailed,
            AppError::NotFound(_) => ErrorKind::RequestError,
            AppError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            AppError::Failed(_) => ErrorKind::Failed,
            AppError::Configuration(_) => ErrorKind::ServerConfigurationError,
            AppError::AuthCommitFailed(_) => ErrorKind::ServerAuthCommitFailed,
            AppError::MissingAuthRecord(_) => ErrorKind::ServerMissingAuthRecord,
            AppError::Token { kind, .. } => *kind,
            AppError::Database(_) | AppError::Internal(_) => ErrorKind::ServerError,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::RequestError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_)
            | AppError::AuthenticationFailed(_)
            | AppError::Failed(_)
            | AppError::Token { .. } => StatusCode::FORBIDDEN,
            AppError::Configuration(_)
            | AppError::AuthCommitFailed(_)
            | AppError::MissingAuthRecord(_)
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(anyhow::Error::new(err))
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::Database(anyhow::Error::new(err))
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::Database(anyhow::Error::new(err))
    }
}

impl From<mongodb::bson::de::Error> for AppError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        AppError::Database(anyhow::Error::new(err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            state: &'static str,
            reason: String,
        }

        let status = self.status();
        let kind = self.kind();

        // 5xx detail stays in the log, not the body.
        let reason = if status.is_server_error() {
            tracing::error!(state = kind.as_str(), error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorBody {
                state: kind.as_str(),
                reason,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_as_wire_tags() {
        assert_eq!(ErrorKind::RequestError.as_str(), "requestError");
        assert_eq!(ErrorKind::NoRecordError.as_str(), "noRecordError");
        assert_eq!(
            ErrorKind::ServerAuthCommitFailed.as_str(),
            "serverAuthCommitFailed"
        );
    }

    #[test]
    fn login_failure_uses_legacy_failed_state() {
        let err = AppError::Failed("authentication failed".into());
        assert_eq!(err.kind(), ErrorKind::Failed);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn token_errors_keep_their_classification() {
        let err = AppError::Token {
            kind: ErrorKind::NoRecordError,
            reason: "no verification record".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NoRecordError);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
