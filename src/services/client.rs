use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use mongodb::bson::{self, doc};

use crate::error::AppError;
use crate::models::{collections, Capability, Client};
use crate::services::token::{IssueOptions, TokenService};
use crate::store::DocumentStore;

/// Default client-token validity.
fn client_token_validity() -> Duration {
    Duration::days(30)
}

#[derive(Debug)]
pub struct ProvisionOutcome {
    /// Wrapped client token: `<base64 client id>.<jwt>`.
    pub token: String,
    pub record_id: String,
    pub expires: DateTime<Utc>,
}

/// Provisions agents and their long-lived tokens. Tokens go through the
/// shared [`TokenService`], so issuing a replacement token revokes the prior
/// one on every instance in the cluster.
pub struct ClientRegistry {
    data: Arc<dyn DocumentStore>,
    tokens: Arc<TokenService>,
}

impl ClientRegistry {
    pub fn new(data: Arc<dyn DocumentStore>, tokens: Arc<TokenService>) -> Self {
        Self { data, tokens }
    }

    /// Provision an agent, idempotent by id: creates the record when absent,
    /// otherwise replaces its token. Either way the caller gets a fresh
    /// token and the previous one stops verifying.
    pub async fn provision(&self, client_id: &str) -> Result<ProvisionOutcome, AppError> {
        if client_id.is_empty() {
            return Err(AppError::RequestError("client id must not be empty".into()));
        }

        let mut client = match self.get_client(client_id).await? {
            Some(existing) => existing,
            None => {
                let client = Client::new(client_id.to_string());
                self.data
                    .insert_one(collections::CLIENTS, bson::to_document(&client)?)
                    .await?;
                tracing::info!(client = %client_id, "Provisioned new client");
                client
            }
        };

        let (record, token) = self
            .tokens
            .issue(
                client_id,
                IssueOptions {
                    validity: Some(client_token_validity()),
                    context: None,
                },
            )
            .await?;

        client.current_token_id = Some(record.id.clone());
        client.updated = Utc::now();
        self.persist(&client).await?;

        Ok(ProvisionOutcome {
            token: wrap_token(client_id, &token),
            record_id: record.id,
            expires: record.expires,
        })
    }

    /// Remove the agent and its current verification record.
    pub async fn deprovision(&self, client_id: &str) -> Result<(), AppError> {
        let removed = self
            .data
            .delete_one(collections::CLIENTS, doc! { "_id": client_id })
            .await?;
        if !removed {
            return Err(AppError::NotFound(format!("no client {client_id}")));
        }
        self.tokens.discard_by_subject(client_id).await?;
        tracing::info!(client = %client_id, "Deprovisioned client");
        Ok(())
    }

    /// Verify a wrapped client token and resolve it to a provisioned agent.
    /// All failures collapse into `authenticationFailed` with a narrowing
    /// reason; the raw verifier classification is logged, not returned.
    pub async fn verify_token(&self, wrapped: &str) -> Result<Client, AppError> {
        let (prefix, jwt) = wrapped.split_once('.').ok_or_else(|| {
            AppError::AuthenticationFailed("client token is not in wrapped form".into())
        })?;

        let hint = BASE64
            .decode(prefix)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| {
                AppError::AuthenticationFailed("client token id prefix is unreadable".into())
            })?;

        let verified = self.tokens.verify(jwt).await.map_err(|e| {
            tracing::debug!(client = %hint, error = %e, "Client token verification failed");
            AppError::AuthenticationFailed(format!(
                "client ID {hint} does not match a valid token record"
            ))
        })?;

        let client = self
            .get_client(&verified.subject)
            .await?
            .ok_or_else(|| {
                AppError::AuthenticationFailed(format!(
                    "token subject {} does not match a provisioned client",
                    verified.subject
                ))
            })?;

        Ok(client)
    }

    /// Issue a replacement token for a connected agent (`client.token.refresh`).
    pub async fn refresh_token(&self, client_id: &str) -> Result<ProvisionOutcome, AppError> {
        if self.get_client(client_id).await?.is_none() {
            return Err(AppError::NotFound(format!("no client {client_id}")));
        }
        self.provision(client_id).await
    }

    pub async fn set_state(&self, client_id: &str, state: &str) -> Result<(), AppError> {
        if let Some(mut client) = self.get_client(client_id).await? {
            client.last_state = Some(state.to_string());
            client.updated = Utc::now();
            self.persist(&client).await?;
        }
        Ok(())
    }

    pub async fn set_capabilities(
        &self,
        client_id: &str,
        capabilities: Vec<Capability>,
    ) -> Result<(), AppError> {
        if let Some(mut client) = self.get_client(client_id).await? {
            client.capabilities = capabilities;
            client.updated = Utc::now();
            self.persist(&client).await?;
        }
        Ok(())
    }

    pub async fn get_client(&self, client_id: &str) -> Result<Option<Client>, AppError> {
        let doc = self
            .data
            .find_one(collections::CLIENTS, doc! { "_id": client_id })
            .await?;
        doc.map(|d| bson::from_document(d).map_err(AppError::from))
            .transpose()
    }

    pub async fn list_clients(&self) -> Result<Vec<Client>, AppError> {
        let docs = self.data.find(collections::CLIENTS, doc! {}).await?;
        docs.into_iter()
            .map(|d| bson::from_document(d).map_err(AppError::from))
            .collect()
    }

    async fn persist(&self, client: &Client) -> Result<(), AppError> {
        self.data
            .replace_one(
                collections::CLIENTS,
                doc! { "_id": &client.id },
                bson::to_document(client)?,
                false,
            )
            .await?;
        Ok(())
    }
}

fn wrap_token(client_id: &str, jwt: &str) -> String {
    format!("{}.{}", BASE64.encode(client_id), jwt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    fn harness() -> ClientRegistry {
        let store = Arc::new(MemoryStore::new());
        let tokens = TokenService::new(store.clone(), "test", 3600).unwrap();
        ClientRegistry::new(store, tokens)
    }

    #[tokio::test]
    async fn provision_then_verify_roundtrip() {
        let registry = harness();
        let outcome = registry.provision("c1").await.unwrap();
        assert!(outcome.expires > Utc::now() + Duration::days(29));

        let client = registry.verify_token(&outcome.token).await.unwrap();
        assert_eq!(client.id, "c1");
        assert_eq!(client.current_token_id.as_deref(), Some(outcome.record_id.as_str()));
    }

    #[tokio::test]
    async fn reprovision_revokes_the_first_token() {
        let registry = harness();
        let first = registry.provision("c1").await.unwrap();
        let second = registry.provision("c1").await.unwrap();

        let err = registry.verify_token(&first.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.to_string().contains("c1"), "reason names the client id");

        assert!(registry.verify_token(&second.token).await.is_ok());
    }

    #[tokio::test]
    async fn deprovision_cascades_to_token_record() {
        let registry = harness();
        let outcome = registry.provision("c1").await.unwrap();

        registry.deprovision("c1").await.unwrap();
        assert!(registry.get_client("c1").await.unwrap().is_none());

        let err = registry.verify_token(&outcome.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn deprovision_of_unknown_client_is_not_found() {
        let registry = harness();
        let err = registry.deprovision("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestError);
    }

    #[tokio::test]
    async fn unwrapped_token_is_rejected() {
        let registry = harness();
        let err = registry.verify_token("no-dots-here").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn empty_client_id_is_a_request_error() {
        let registry = harness();
        let err = registry.provision("").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestError);
    }

    #[tokio::test]
    async fn state_and_capabilities_are_recorded() {
        let registry = harness();
        registry.provision("c1").await.unwrap();

        registry.set_state("c1", "running").await.unwrap();
        registry
            .set_capabilities(
                "c1",
                vec![Capability {
                    name: "exec".into(),
                    version: "1.0.0".into(),
                    messages: vec!["exec.run".into()],
                }],
            )
            .await
            .unwrap();

        let client = registry.get_client("c1").await.unwrap().unwrap();
        assert_eq!(client.last_state.as_deref(), Some("running"));
        assert_eq!(client.capabilities.len(), 1);
        assert_eq!(client.capabilities[0].name, "exec");
    }
}
