use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::Document;
use tokio::sync::RwLock;

use super::DocumentStore;
use crate::error::AppError;

/// In-memory [`DocumentStore`] used by the test harness and embedded runs.
/// Documents keep insertion order; filters match on top-level field equality,
/// which is all the core's queries use.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, value)| document.get(key) == Some(value))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, AppError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| matches(d, &filter)).cloned()))
    }

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, AppError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        document: Document,
        upsert: bool,
    ) -> Result<bool, AppError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| matches(d, &filter)) {
            Some(existing) => {
                *existing = document;
                Ok(true)
            }
            None => {
                if upsert {
                    docs.push(document);
                }
                Ok(false)
            }
        }
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> Result<bool, AppError> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection) {
            if let Some(index) = docs.iter().position(|d| matches(d, &filter)) {
                docs.remove(index);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let store = MemoryStore::new();
        store
            .insert_one("rows", doc! { "_id": "1", "kind": "a" })
            .await
            .unwrap();
        store
            .insert_one("rows", doc! { "_id": "2", "kind": "b" })
            .await
            .unwrap();

        let found = store
            .find_one("rows", doc! { "kind": "b" })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_str("_id").unwrap(), "2");

        let all = store.find("rows", doc! {}).await.unwrap();
        assert_eq!(all.len(), 2);
        // Insertion order is preserved.
        assert_eq!(all[0].get_str("_id").unwrap(), "1");
    }

    #[tokio::test]
    async fn replace_one_without_upsert_is_a_noop_on_miss() {
        let store = MemoryStore::new();
        let replaced = store
            .replace_one("rows", doc! { "_id": "x" }, doc! { "_id": "x" }, false)
            .await
            .unwrap();
        assert!(!replaced);
        assert!(store.find("rows", doc! {}).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_one_upserts_on_miss() {
        let store = MemoryStore::new();
        let replaced = store
            .replace_one("rows", doc! { "_id": "x" }, doc! { "_id": "x", "n": 1 }, true)
            .await
            .unwrap();
        assert!(!replaced);

        let replaced = store
            .replace_one("rows", doc! { "_id": "x" }, doc! { "_id": "x", "n": 2 }, true)
            .await
            .unwrap();
        assert!(replaced);

        let all = store.find("rows", doc! {}).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get_i32("n").unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_one_removes_first_match_only() {
        let store = MemoryStore::new();
        store
            .insert_one("rows", doc! { "kind": "a", "n": 1 })
            .await
            .unwrap();
        store
            .insert_one("rows", doc! { "kind": "a", "n": 2 })
            .await
            .unwrap();

        assert!(store.delete_one("rows", doc! { "kind": "a" }).await.unwrap());
        let rest = store.find("rows", doc! {}).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].get_i32("n").unwrap(), 2);

        assert!(!store.delete_one("rows", doc! { "kind": "z" }).await.unwrap());
    }
}
