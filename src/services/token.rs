use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use mongodb::bson::{self, doc};
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ErrorKind};
use crate::models::{collections, TokenRecord};
use crate::store::DocumentStore;

/// Grace period a verification record outlives its token's expiry before
/// lazy purging removes it.
fn record_grace() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub validity: Option<Duration>,
    pub context: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Verified {
    pub subject: String,
    pub record_id: String,
    pub context: Option<Value>,
}

struct KeyPair {
    public_pem: String,
    encoding: EncodingKey,
}

impl KeyPair {
    fn generate() -> Result<Self, AppError> {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key export failed: {e}")))?;
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key export failed: {e}")))?;
        let encoding = EncodingKey::from_ec_pem(private_pem.as_bytes())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("key import failed: {e}")))?;
        Ok(Self {
            public_pem,
            encoding,
        })
    }
}

/// Issues and verifies ES256 bearer tokens. The service owns the current
/// P-256 signing pair; every issued token's verification record carries the
/// public key that signed it, so rotating the pair never invalidates
/// outstanding tokens. Records are cluster-shared: replacing a subject's
/// record is what revokes its previous token on every instance.
pub struct TokenService {
    data: Arc<dyn DocumentStore>,
    issuer: String,
    key: RwLock<Arc<KeyPair>>,
    rotate_on_issue: bool,
    cancel: CancellationToken,
}

/// Default operator-token validity.
pub fn default_validity() -> Duration {
    Duration::minutes(30)
}

impl TokenService {
    /// Create the service and, for a positive interval, start the key
    /// rotation task. A non-positive interval switches to regenerating the
    /// pair after every issuance instead.
    pub fn new(
        data: Arc<dyn DocumentStore>,
        issuer: impl Into<String>,
        rotation_interval_secs: i64,
    ) -> Result<Arc<Self>, AppError> {
        let service = Arc::new(Self {
            data,
            issuer: issuer.into(),
            key: RwLock::new(Arc::new(KeyPair::generate()?)),
            rotate_on_issue: rotation_interval_secs <= 0,
            cancel: CancellationToken::new(),
        });

        if rotation_interval_secs > 0 {
            let weak = Arc::downgrade(&service);
            let cancel = service.cancel.clone();
            let period = std::time::Duration::from_secs(rotation_interval_secs as u64);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(service) = weak.upgrade() else { break };
                            if let Err(e) = service.rotate().await {
                                tracing::error!(error = %e, "Signing key rotation failed");
                            }
                        }
                    }
                }
            });
        }

        Ok(service)
    }

    async fn rotate(&self) -> Result<(), AppError> {
        let pair = Arc::new(KeyPair::generate()?);
        *self.key.write().await = pair;
        tracing::info!("Rotated token signing key pair");
        Ok(())
    }

    /// Stop key rotation. Outstanding tokens keep verifying through their
    /// persisted records.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Issue a token for `subject`, replacing any existing verification
    /// record for the same subject. Returns the persisted record and the
    /// compact signed token.
    pub async fn issue(
        &self,
        subject: &str,
        options: IssueOptions,
    ) -> Result<(TokenRecord, String), AppError> {
        let key = self.key.read().await.clone();
        let now = Utc::now();
        let validity = options.validity.unwrap_or_else(default_validity);
        let expires = now + validity;

        let record = TokenRecord::new(
            self.issuer.clone(),
            subject.to_string(),
            key.public_pem.clone(),
            now,
            expires,
        );

        self.data
            .replace_one(
                collections::CLIENT_TOKENS,
                doc! { "subject": subject },
                bson::to_document(&record)?,
                true,
            )
            .await?;

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(record.id.clone());

        let claims = Claims {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
            context: options.context,
        };

        let token = encode(&header, &claims, &key.encoding)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("token signing failed: {e}")))?;

        if self.rotate_on_issue {
            self.rotate().await?;
        }

        tracing::debug!(subject = %subject, record = %record.id, "Issued token");
        Ok((record, token))
    }

    /// Verify a compact token. Failures come back classified; raw decoder
    /// errors never escape this function.
    pub async fn verify(&self, token: &str) -> Result<Verified, AppError> {
        let header = decode_header(token).map_err(|_| AppError::Token {
            kind: ErrorKind::InvalidTokenError,
            reason: "malformed token".into(),
        })?;
        let kid = header.kid.ok_or(AppError::Token {
            kind: ErrorKind::InvalidTokenError,
            reason: "token has no key id".into(),
        })?;

        let record = self
            .data
            .find_one(collections::CLIENT_TOKENS, doc! { "_id": &kid })
            .await?
            .ok_or(AppError::Token {
                kind: ErrorKind::NoRecordError,
                reason: format!("no verification record for token id {kid}"),
            })?;
        let record: TokenRecord = bson::from_document(record).map_err(|_| AppError::Token {
            kind: ErrorKind::InvalidRecordError,
            reason: "verification record is malformed".into(),
        })?;

        if record.public_key.is_empty() || record.issuer.is_empty() || record.subject.is_empty() {
            return Err(AppError::Token {
                kind: ErrorKind::InvalidRecordError,
                reason: "verification record is incomplete".into(),
            });
        }

        let decoding = DecodingKey::from_ec_pem(record.public_key.as_bytes()).map_err(|_| {
            AppError::Token {
                kind: ErrorKind::InvalidRecordError,
                reason: "verification record key is unusable".into(),
            }
        })?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&record.issuer]);

        let data = decode::<Claims>(token, &decoding, &validation).map_err(|e| {
            let reason = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "token expired",
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => "issuer mismatch",
                jsonwebtoken::errors::ErrorKind::InvalidSignature => "signature mismatch",
                _ => "token rejected",
            };
            self.purge_if_stale(&record);
            AppError::Token {
                kind: ErrorKind::InvalidTokenError,
                reason: reason.into(),
            }
        })?;

        if data.claims.sub != record.subject {
            return Err(AppError::Token {
                kind: ErrorKind::InvalidTokenError,
                reason: "subject mismatch".into(),
            });
        }

        Ok(Verified {
            subject: record.subject,
            record_id: record.id,
            context: data.claims.context,
        })
    }

    /// Drop a record whose token expired past the grace window. Best-effort,
    /// detached from the verify path.
    fn purge_if_stale(&self, record: &TokenRecord) {
        if record.expires + record_grace() < Utc::now() {
            let data = self.data.clone();
            let id = record.id.clone();
            tokio::spawn(async move {
                if let Err(e) = data
                    .delete_one(collections::CLIENT_TOKENS, doc! { "_id": &id })
                    .await
                {
                    tracing::warn!(record = %id, error = %e, "Failed to purge stale token record");
                }
            });
        }
    }

    /// Remove the verification record for `subject`. Returns whether one
    /// existed.
    pub async fn discard_by_subject(&self, subject: &str) -> Result<bool, AppError> {
        self.data
            .delete_one(collections::CLIENT_TOKENS, doc! { "subject": subject })
            .await
    }
}

impl Drop for TokenService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> Arc<TokenService> {
        TokenService::new(Arc::new(MemoryStore::new()), "test-issuer", 3600).unwrap()
    }

    #[tokio::test]
    async fn issue_then_verify_returns_subject() {
        let tokens = service();
        let (record, token) = tokens.issue("subject-1", IssueOptions::default()).await.unwrap();

        let verified = tokens.verify(&token).await.unwrap();
        assert_eq!(verified.subject, "subject-1");
        assert_eq!(verified.record_id, record.id);
        assert!(verified.context.is_none());
    }

    #[tokio::test]
    async fn context_round_trips_verbatim() {
        let tokens = service();
        let context = serde_json::json!({ "name": "admin", "functions": ["identity.create"] });
        let (_, token) = tokens
            .issue(
                "subject-1",
                IssueOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let verified = tokens.verify(&token).await.unwrap();
        assert_eq!(verified.context, Some(context));
    }

    #[tokio::test]
    async fn reissue_revokes_the_previous_token() {
        let tokens = service();
        let (_, first) = tokens.issue("subject-1", IssueOptions::default()).await.unwrap();
        let (_, second) = tokens.issue("subject-1", IssueOptions::default()).await.unwrap();

        let err = tokens.verify(&first).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoRecordError);

        assert!(tokens.verify(&second).await.is_ok());
    }

    #[tokio::test]
    async fn expired_token_is_classified() {
        let tokens = service();
        let (_, token) = tokens
            .issue(
                "subject-1",
                IssueOptions {
                    validity: Some(Duration::seconds(-120)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = tokens.verify(&token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTokenError);
    }

    #[tokio::test]
    async fn tampered_token_is_classified() {
        let tokens = service();
        let (_, token) = tokens.issue("subject-1", IssueOptions::default()).await.unwrap();

        // Flip the last signature character.
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });

        let err = tokens.verify(&tampered).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTokenError);
    }

    #[tokio::test]
    async fn garbage_token_is_classified() {
        let tokens = service();
        let err = tokens.verify("not-a-token").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTokenError);
    }

    #[tokio::test]
    async fn rotate_on_issue_keeps_outstanding_tokens_valid() {
        // Non-positive interval regenerates the pair after every issuance;
        // the first token must still verify through its persisted record.
        let tokens =
            TokenService::new(Arc::new(MemoryStore::new()), "test-issuer", 0).unwrap();

        let (_, first) = tokens.issue("subject-a", IssueOptions::default()).await.unwrap();
        let (_, second) = tokens.issue("subject-b", IssueOptions::default()).await.unwrap();

        assert!(tokens.verify(&first).await.is_ok());
        assert!(tokens.verify(&second).await.is_ok());
    }
}
