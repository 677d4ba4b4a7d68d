use std::sync::{Arc, OnceLock};

use chrono::Utc;
use mongodb::bson::{self, doc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::ProviderRegistry;
use crate::error::AppError;
use crate::models::{collections, AuthenticationRecord, Identity, IdentityView};
use crate::services::token::{IssueOptions, TokenService};
use crate::store::DocumentStore;

/// Coarse permission strings checked by route guards. The bootstrap admin
/// gets all of them.
pub mod functions {
    pub const IDENTITY_CREATE: &str = "identity.create";
    pub const IDENTITY_GET_ALL: &str = "identity.get.all";
    pub const IDENTITY_UPDATE_ALL: &str = "identity.update.all";
    pub const IDENTITY_DELETE_ALL: &str = "identity.delete.all";
    pub const CLIENT_PROVISION: &str = "client.provision";
    pub const CLIENT_GET_ALL: &str = "client.get.all";
    pub const CLIENT_DELETE_ALL: &str = "client.delete.all";
    pub const CONNECTION_GET_ALL: &str = "connection.get.all";
    pub const CONNECTION_SEND: &str = "connection.send";

    pub fn all() -> Vec<String> {
        [
            IDENTITY_CREATE,
            IDENTITY_GET_ALL,
            IDENTITY_UPDATE_ALL,
            IDENTITY_DELETE_ALL,
            CLIENT_PROVISION,
            CLIENT_GET_ALL,
            CLIENT_DELETE_ALL,
            CONNECTION_GET_ALL,
            CONNECTION_SEND,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid pattern"))
}

/// Submitted identity details. Unknown fields (including any id) are dropped
/// by deserialization, which is how id rewrites are rejected silently.
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
pub struct IdentitySpec {
    pub name: Option<String>,
    /// `{type, ...provider details}`, e.g. `{"type": "password", "password": "..."}`.
    #[schema(value_type = Object)]
    pub auth: Option<Value>,
    pub functions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions<'a> {
    pub new_identity: bool,
    pub valid_functions: Option<&'a [String]>,
}

/// Outcome of spec validation: only cleaned, format-checked material.
pub struct ValidatedSpec {
    pub name: Option<String>,
    pub auth: Option<(String, Value)>,
    pub functions: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct LoginSuccess {
    pub token: String,
    pub expires: chrono::DateTime<Utc>,
}

/// Identity CRUD plus the operator-auth flow. All writes validate through
/// [`IdentityService::validate_identity_spec`] first; credential material
/// only ever passes through the registered auth providers.
pub struct IdentityService {
    data: Arc<dyn DocumentStore>,
    providers: ProviderRegistry,
    tokens: Arc<TokenService>,
}

impl IdentityService {
    pub fn new(
        data: Arc<dyn DocumentStore>,
        providers: ProviderRegistry,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            data,
            providers,
            tokens,
        }
    }

    /// Create the bootstrap `admin` identity when the collection is empty.
    /// The initial password must come from configuration; refusing to start
    /// without one beats shipping a well-known default.
    pub async fn bootstrap(&self, bootstrap_password: Option<&str>) -> Result<(), AppError> {
        let existing = self
            .data
            .find(collections::IDENTITIES, doc! {})
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let password = bootstrap_password.ok_or_else(|| {
            AppError::Configuration(
                "identity collection is empty and auth.bootstrap_password is not set".into(),
            )
        })?;

        let spec = IdentitySpec {
            name: Some("admin".to_string()),
            auth: Some(serde_json::json!({ "type": "password", "password": password })),
            functions: Some(functions::all()),
        };
        let created = self.add_identity(spec).await?;
        tracing::info!(identity = %created.id, "Bootstrapped admin identity");
        Ok(())
    }

    pub async fn validate_identity_spec(
        &self,
        spec: &IdentitySpec,
        options: ValidateOptions<'_>,
    ) -> Result<ValidatedSpec, AppError> {
        let name = match &spec.name {
            Some(name) => {
                if !name_pattern().is_match(name) {
                    return Err(AppError::RequestError(format!(
                        "identity name {name:?} is not a valid name"
                    )));
                }
                let existing = self.find_by_name(name).await?;
                if options.new_identity && existing.is_some() {
                    return Err(AppError::RequestError(format!(
                        "identity name {name:?} is already taken"
                    )));
                }
                if !options.new_identity && existing.is_none() {
                    return Err(AppError::RequestError(format!(
                        "identity name {name:?} does not exist"
                    )));
                }
                Some(name.clone())
            }
            None if options.new_identity => {
                return Err(AppError::RequestError("identity name is required".into()))
            }
            None => None,
        };

        let auth = match &spec.auth {
            Some(details) => {
                let method = details
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::RequestError("auth.type is required".into()))?;
                let provider = self.providers.get(method).ok_or_else(|| {
                    AppError::Configuration(format!("no auth provider for type {method:?}"))
                })?;
                let clean = provider.validate(details)?;
                Some((method.to_string(), clean))
            }
            None => None,
        };

        let functions = match &spec.functions {
            Some(list) => {
                for function in list {
                    if !name_pattern().is_match(function) {
                        return Err(AppError::RequestError(format!(
                            "function name {function:?} is not valid"
                        )));
                    }
                    if let Some(valid) = options.valid_functions {
                        if !valid.contains(function) {
                            return Err(AppError::RequestError(format!(
                                "function {function:?} is not recognized"
                            )));
                        }
                    }
                }
                Some(list.clone())
            }
            None => None,
        };

        Ok(ValidatedSpec {
            name,
            auth,
            functions,
        })
    }

    pub async fn add_identity(&self, spec: IdentitySpec) -> Result<IdentityView, AppError> {
        let validated = self
            .validate_identity_spec(
                &spec,
                ValidateOptions {
                    new_identity: true,
                    valid_functions: None,
                },
            )
            .await?;

        let name = validated
            .name
            .ok_or_else(|| AppError::RequestError("identity name is required".into()))?;
        let (method, clean) = validated
            .auth
            .ok_or_else(|| AppError::RequestError("auth details are required".into()))?;

        let provider = self
            .providers
            .get(&method)
            .ok_or_else(|| AppError::Configuration(format!("no auth provider for {method:?}")))?;
        let record = provider
            .commit(&clean)
            .map_err(|e| AppError::AuthCommitFailed(anyhow::anyhow!(e)))?;

        let auth_record = AuthenticationRecord::new(method, record);
        self.data
            .insert_one(
                collections::AUTHENTICATIONS,
                bson::to_document(&auth_record)?,
            )
            .await?;

        let identity = Identity::new(
            name,
            auth_record.id.clone(),
            validated.functions.unwrap_or_default(),
        );
        self.data
            .insert_one(collections::IDENTITIES, bson::to_document(&identity)?)
            .await?;

        tracing::info!(identity = %identity.id, name = %identity.name, "Created identity");
        Ok(identity.view())
    }

    /// Update an identity. `functions` is only applied with
    /// `allow_security_edit`; the self-service route never sets it, so a
    /// caller cannot grow its own permission list.
    pub async fn set_identity(
        &self,
        id: &str,
        spec: IdentitySpec,
        allow_security_edit: bool,
    ) -> Result<IdentityView, AppError> {
        let mut identity = self
            .get_identity(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no identity {id}")))?;

        if let Some(name) = &spec.name {
            if name != &identity.name {
                return Err(AppError::RequestError(
                    "identity name is immutable".into(),
                ));
            }
        }

        let validated = self
            .validate_identity_spec(
                &spec,
                ValidateOptions {
                    new_identity: false,
                    valid_functions: None,
                },
            )
            .await?;

        if let Some((method, clean)) = validated.auth {
            let provider = self.providers.get(&method).ok_or_else(|| {
                AppError::Configuration(format!("no auth provider for {method:?}"))
            })?;
            let record = provider
                .commit(&clean)
                .map_err(|e| AppError::AuthCommitFailed(anyhow::anyhow!(e)))?;

            let auth_record = AuthenticationRecord::new(method, record);
            self.data
                .insert_one(
                    collections::AUTHENTICATIONS,
                    bson::to_document(&auth_record)?,
                )
                .await?;
            self.data
                .delete_one(
                    collections::AUTHENTICATIONS,
                    doc! { "_id": &identity.auth_id },
                )
                .await?;
            identity.auth_id = auth_record.id;
        }

        if let Some(functions) = validated.functions {
            if allow_security_edit {
                identity.functions = functions;
            } else {
                tracing::warn!(identity = %identity.id, "Ignored functions edit without security permission");
            }
        }

        identity.updated = Utc::now();
        self.data
            .replace_one(
                collections::IDENTITIES,
                doc! { "_id": id },
                bson::to_document(&identity)?,
                false,
            )
            .await?;

        Ok(identity.view())
    }

    /// Delete an identity and its authentication record. Both removals
    /// complete before this returns success.
    pub async fn remove_identity(&self, id: &str) -> Result<(), AppError> {
        let identity = self
            .get_identity(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no identity {id}")))?;

        self.data
            .delete_one(
                collections::AUTHENTICATIONS,
                doc! { "_id": &identity.auth_id },
            )
            .await?;
        self.data
            .delete_one(collections::IDENTITIES, doc! { "_id": id })
            .await?;

        tracing::info!(identity = %id, "Removed identity");
        Ok(())
    }

    /// Operator login: resolve the identity by name, verify the offered
    /// credential through its provider, and issue a short-lived token whose
    /// context carries the name and function list.
    pub async fn authenticate(&self, details: &Value) -> Result<LoginSuccess, AppError> {
        let name = details
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::RequestError("name is required".into()))?;

        // Absent identity and bad credential produce the same state.
        let identity = self
            .find_by_name(name)
            .await?
            .ok_or_else(|| AppError::Failed("authentication failed".into()))?;

        let auth_doc = self
            .data
            .find_one(
                collections::AUTHENTICATIONS,
                doc! { "_id": &identity.auth_id },
            )
            .await?
            .ok_or_else(|| {
                AppError::MissingAuthRecord(format!(
                    "identity {} references a missing auth record",
                    identity.id
                ))
            })?;
        let auth_record: AuthenticationRecord = bson::from_document(auth_doc)?;

        let provider = self.providers.get(&auth_record.method).ok_or_else(|| {
            AppError::Configuration(format!(
                "no auth provider for type {:?}",
                auth_record.method
            ))
        })?;
        provider.authenticate(&auth_record.record, details)?;

        let (record, token) = self
            .tokens
            .issue(
                &identity.id,
                IssueOptions {
                    context: Some(serde_json::json!({
                        "name": identity.name,
                        "functions": identity.functions,
                    })),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(identity = %identity.id, "Operator authenticated");
        Ok(LoginSuccess {
            token,
            expires: record.expires,
        })
    }

    pub fn allow_access(identity: &Identity, function: &str) -> bool {
        identity.functions.iter().any(|f| f == function)
    }

    pub async fn get_identity(&self, id: &str) -> Result<Option<Identity>, AppError> {
        let doc = self
            .data
            .find_one(collections::IDENTITIES, doc! { "_id": id })
            .await?;
        doc.map(|d| bson::from_document(d).map_err(AppError::from))
            .transpose()
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Identity>, AppError> {
        let doc = self
            .data
            .find_one(collections::IDENTITIES, doc! { "name": name })
            .await?;
        doc.map(|d| bson::from_document(d).map_err(AppError::from))
            .transpose()
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>, AppError> {
        let docs = self.data.find(collections::IDENTITIES, doc! {}).await?;
        docs.into_iter()
            .map(|d| bson::from_document(d).map_err(AppError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn harness() -> (Arc<MemoryStore>, IdentityService) {
        let store = Arc::new(MemoryStore::new());
        let tokens = TokenService::new(store.clone(), "test", 3600).unwrap();
        let service = IdentityService::new(store.clone(), ProviderRegistry::builtin(), tokens);
        (store, service)
    }

    fn spec(name: &str, password: &str) -> IdentitySpec {
        IdentitySpec {
            name: Some(name.to_string()),
            auth: Some(json!({ "type": "password", "password": password })),
            functions: Some(vec![functions::IDENTITY_GET_ALL.to_string()]),
        }
    }

    #[tokio::test]
    async fn add_identity_links_exactly_one_auth_record() {
        let (store, service) = harness();
        let view = service.add_identity(spec("alice", "password-1")).await.unwrap();

        let identity = service.get_identity(&view.id).await.unwrap().unwrap();
        let auth = store
            .find_one(collections::AUTHENTICATIONS, doc! { "_id": &identity.auth_id })
            .await
            .unwrap();
        assert!(auth.is_some());
        assert_eq!(
            store
                .find(collections::AUTHENTICATIONS, doc! {})
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let (_, service) = harness();
        service.add_identity(spec("alice", "password-1")).await.unwrap();

        let err = service.add_identity(spec("alice", "password-2")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestError);
    }

    #[tokio::test]
    async fn bad_name_format_is_rejected() {
        let (_, service) = harness();
        let err = service
            .add_identity(spec("not a name!", "password-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RequestError);
    }

    #[tokio::test]
    async fn unknown_auth_type_is_a_configuration_error() {
        let (_, service) = harness();
        let bad = IdentitySpec {
            name: Some("bob".to_string()),
            auth: Some(json!({ "type": "retina-scan" })),
            functions: None,
        };
        let err = service.add_identity(bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerConfigurationError);
    }

    #[tokio::test]
    async fn authenticate_issues_a_token_with_context() {
        let (_, service) = harness();
        service.add_identity(spec("alice", "password-1")).await.unwrap();

        let login = service
            .authenticate(&json!({ "name": "alice", "password": "password-1" }))
            .await
            .unwrap();
        assert!(!login.token.is_empty());
        assert!(login.expires > Utc::now());
    }

    #[tokio::test]
    async fn authenticate_with_wrong_password_fails() {
        let (_, service) = harness();
        service.add_identity(spec("alice", "password-1")).await.unwrap();

        let err = service
            .authenticate(&json!({ "name": "alice", "password": "wrong-password" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failed);
    }

    #[tokio::test]
    async fn authenticate_unknown_name_fails_the_same_way() {
        let (_, service) = harness();
        let err = service
            .authenticate(&json!({ "name": "nobody", "password": "password-1" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failed);
    }

    #[tokio::test]
    async fn password_change_replaces_the_auth_record() {
        let (store, service) = harness();
        let view = service.add_identity(spec("alice", "password-1")).await.unwrap();
        let before = service.get_identity(&view.id).await.unwrap().unwrap();

        service
            .set_identity(
                &view.id,
                IdentitySpec {
                    auth: Some(json!({ "type": "password", "password": "password-2" })),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        let after = service.get_identity(&view.id).await.unwrap().unwrap();
        assert_ne!(before.auth_id, after.auth_id);
        // Old record is gone, new one is live.
        assert_eq!(
            store
                .find(collections::AUTHENTICATIONS, doc! {})
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(service
            .authenticate(&json!({ "name": "alice", "password": "password-2" }))
            .await
            .is_ok());
        assert!(service
            .authenticate(&json!({ "name": "alice", "password": "password-1" }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn functions_edit_requires_security_permission() {
        let (_, service) = harness();
        let view = service.add_identity(spec("alice", "password-1")).await.unwrap();

        let updated = service
            .set_identity(
                &view.id,
                IdentitySpec {
                    functions: Some(vec![functions::IDENTITY_CREATE.to_string()]),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(updated.functions, vec![functions::IDENTITY_GET_ALL]);

        let escalated = service
            .set_identity(
                &view.id,
                IdentitySpec {
                    functions: Some(vec![functions::IDENTITY_CREATE.to_string()]),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();
        assert_eq!(escalated.functions, vec![functions::IDENTITY_CREATE]);
    }

    #[tokio::test]
    async fn remove_identity_cascades_to_auth_record() {
        let (store, service) = harness();
        let view = service.add_identity(spec("alice", "password-1")).await.unwrap();

        service.remove_identity(&view.id).await.unwrap();
        assert!(service.get_identity(&view.id).await.unwrap().is_none());
        assert!(store
            .find(collections::AUTHENTICATIONS, doc! {})
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn bootstrap_creates_admin_with_all_functions() {
        let (_, service) = harness();
        service.bootstrap(Some("bootstrap-secret")).await.unwrap();

        let admin = service.find_by_name("admin").await.unwrap().unwrap();
        assert_eq!(admin.functions, functions::all());

        // Second bootstrap is a no-op.
        service.bootstrap(None).await.unwrap();
        assert_eq!(service.list_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_without_password_is_fatal() {
        let (_, service) = harness();
        let err = service.bootstrap(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerConfigurationError);
    }
}
