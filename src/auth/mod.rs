//! Authentication providers. A provider owns one credential method
//! end-to-end: shape-checking submitted details, deriving what is stored,
//! and verifying an offered credential against the stored record.

mod password;

pub use password::PasswordProvider;

use std::collections::HashMap;
use std::sync::Arc;

use mongodb::bson::Document;
use serde_json::Value;

use crate::error::AppError;

pub trait AuthProvider: Send + Sync {
    /// The `auth.type` value this provider handles.
    fn method(&self) -> &'static str;

    /// Shape-check submitted details, returning the cleaned subset that may
    /// be passed on to `commit` or `authenticate`.
    fn validate(&self, details: &Value) -> Result<Value, AppError>;

    /// Derive the stored record from cleaned details. Only called on writes.
    fn commit(&self, clean: &Value) -> Result<Document, AppError>;

    /// Verify an offered credential against the stored record.
    fn authenticate(&self, stored: &Document, offered: &Value) -> Result<(), AppError>;
}

/// Provider registry, assembled at startup. Lookup key is the method name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in providers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PasswordProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn AuthProvider>) {
        self.providers
            .insert(provider.method().to_string(), provider);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn AuthProvider>> {
        self.providers.get(method).cloned()
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.providers.keys().cloned().collect();
        methods.sort();
        methods
    }
}
