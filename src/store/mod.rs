//! Persistence seams. The core consumes two narrow interfaces: a document
//! store (shared across the cluster) and a byte-oriented state store (local
//! to the instance). Components receive namespaced views of both.

mod memory;
mod mongo;
mod state;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use state::{FsStateStore, ScopedStateStore, StateStore};

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::Document;

use crate::error::AppError;

/// Document collections with the five operations the core relies on.
/// Collection names are flat strings; namespacing is done by wrapping the
/// store in a [`ScopedDocumentStore`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, AppError>;

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, AppError>;

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), AppError>;

    /// Replace the first match, inserting when `upsert` and nothing matched.
    /// Returns whether an existing document was replaced.
    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        document: Document,
        upsert: bool,
    ) -> Result<bool, AppError>;

    /// Returns whether a document was deleted.
    async fn delete_one(&self, collection: &str, filter: Document) -> Result<bool, AppError>;
}

/// A view of a [`DocumentStore`] that prefixes every collection name with
/// `<namespace>.`, handed to components so their collections cannot collide
/// with the core's or each other's.
pub struct ScopedDocumentStore {
    inner: Arc<dyn DocumentStore>,
    namespace: String,
}

impl ScopedDocumentStore {
    pub fn new(inner: Arc<dyn DocumentStore>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    fn scoped(&self, collection: &str) -> String {
        format!("{}.{}", self.namespace, collection)
    }
}

#[async_trait]
impl DocumentStore for ScopedDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, AppError> {
        self.inner.find_one(&self.scoped(collection), filter).await
    }

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, AppError> {
        self.inner.find(&self.scoped(collection), filter).await
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), AppError> {
        self.inner
            .insert_one(&self.scoped(collection), document)
            .await
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        document: Document,
        upsert: bool,
    ) -> Result<bool, AppError> {
        self.inner
            .replace_one(&self.scoped(collection), filter, document, upsert)
            .await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> Result<bool, AppError> {
        self.inner
            .delete_one(&self.scoped(collection), filter)
            .await
    }
}
