use std::sync::Arc;

use chrono::Utc;
use mongodb::bson::{self, doc};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{collections, RuntimeInfo, ServerInstance};
use crate::store::DocumentStore;

const CHECK_IN_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// Maintains this server's liveness row: an upsert on start, a refresh of
/// `check_in_time` every 30 s, and a final `live=false` row on stop.
pub struct InstanceReporter {
    data: Arc<dyn DocumentStore>,
    instance_id: String,
    components: Vec<String>,
    runtime_info: RuntimeInfo,
    cancel: CancellationToken,
}

impl InstanceReporter {
    pub fn new(
        data: Arc<dyn DocumentStore>,
        instance_id: impl Into<String>,
        components: Vec<String>,
        runtime_info: RuntimeInfo,
    ) -> Self {
        Self {
            data,
            instance_id: instance_id.into(),
            components,
            runtime_info,
            cancel: CancellationToken::new(),
        }
    }

    fn row(&self, live: bool, stop_reason: Option<String>) -> ServerInstance {
        ServerInstance {
            id: self.instance_id.clone(),
            components: self.components.clone(),
            runtime_info: self.runtime_info.clone(),
            live,
            check_in_time: Utc::now(),
            stop_reason,
        }
    }

    async fn write(&self, live: bool, stop_reason: Option<String>) -> Result<(), AppError> {
        let row = self.row(live, stop_reason);
        self.data
            .replace_one(
                collections::INSTANCES,
                doc! { "_id": &self.instance_id },
                bson::to_document(&row)?,
                true,
            )
            .await?;
        Ok(())
    }

    /// Write the initial live row and start the periodic check-in task.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.write(true, None).await?;

        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_IN_PERIOD);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = reporter.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = reporter.write(true, None).await {
                            tracing::error!(error = %e, "Instance check-in failed");
                        }
                    }
                }
            }
        });

        tracing::info!(instance = %self.instance_id, "Instance reporter started");
        Ok(())
    }

    /// Stop checking in and finalize the row with the stop reason.
    pub async fn stop(&self, reason: &str) -> Result<(), AppError> {
        self.cancel.cancel();
        self.write(false, Some(reason.to_string())).await?;
        tracing::info!(instance = %self.instance_id, reason = %reason, "Instance reporter stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn reporter(store: Arc<MemoryStore>) -> Arc<InstanceReporter> {
        Arc::new(InstanceReporter::new(
            store,
            "instance-1",
            vec!["auth".into(), "client".into()],
            RuntimeInfo::capture(),
        ))
    }

    #[tokio::test]
    async fn start_writes_a_live_row() {
        let store = Arc::new(MemoryStore::new());
        let reporter = reporter(store.clone());
        reporter.start().await.unwrap();

        let row = store
            .find_one(collections::INSTANCES, doc! { "_id": "instance-1" })
            .await
            .unwrap()
            .unwrap();
        assert!(row.get_bool("live").unwrap());

        reporter.stop("test").await.unwrap();
    }

    #[tokio::test]
    async fn stop_finalizes_with_reason() {
        let store = Arc::new(MemoryStore::new());
        let reporter = reporter(store.clone());
        reporter.start().await.unwrap();
        reporter.stop("SIGTERM").await.unwrap();

        let row = store
            .find_one(collections::INSTANCES, doc! { "_id": "instance-1" })
            .await
            .unwrap()
            .unwrap();
        assert!(!row.get_bool("live").unwrap());
        assert_eq!(row.get_str("stopReason").unwrap(), "SIGTERM");

        // One row per instance id, not one per write.
        assert_eq!(
            store
                .find(collections::INSTANCES, doc! {})
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
