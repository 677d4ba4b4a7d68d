use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    options::ReplaceOptions,
    Client as MongoClient, Database,
};

use super::DocumentStore;
use crate::error::AppError;

/// MongoDB-backed [`DocumentStore`]. This is the cluster-shared store; every
/// server instance points at the same database.
#[derive(Clone)]
pub struct MongoStore {
    client: MongoClient,
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            AppError::from(e)
        })?;
        let db = client.database(database);
        Ok(Self { client, db })
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, AppError> {
        let collection = self.db.collection::<Document>(collection);
        Ok(collection.find_one(filter, None).await?)
    }

    async fn find(&self, collection: &str, filter: Document) -> Result<Vec<Document>, AppError> {
        let collection = self.db.collection::<Document>(collection);
        let cursor = collection.find(filter, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), AppError> {
        let collection = self.db.collection::<Document>(collection);
        collection.insert_one(document, None).await?;
        Ok(())
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: Document,
        document: Document,
        upsert: bool,
    ) -> Result<bool, AppError> {
        let collection = self.db.collection::<Document>(collection);
        let options = ReplaceOptions::builder().upsert(upsert).build();
        let result = collection.replace_one(filter, document, options).await?;
        Ok(result.modified_count > 0)
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> Result<bool, AppError> {
        let collection = self.db.collection::<Document>(collection);
        let result = collection.delete_one(filter, None).await?;
        Ok(result.deleted_count > 0)
    }
}
