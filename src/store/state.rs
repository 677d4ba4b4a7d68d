use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;

/// Ordered key→bytes store, durable, local to the instance. Keys are
/// `/`-separated paths; the first segment is conventionally the owning
/// component's name.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError>;
}

/// Filesystem-backed [`StateStore`]: one file per key under the state
/// directory. Writes go through a temp file and rename.
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, AppError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            AppError::Configuration(format!(
                "cannot create state directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, AppError> {
        if key.is_empty() {
            return Err(AppError::RequestError("state key must not be empty".into()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains(std::path::MAIN_SEPARATOR)
            {
                return Err(AppError::RequestError(format!(
                    "invalid state key segment in {key:?}"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn collect_keys(dir: &Path, base: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_keys(&path, base, keys)?;
            } else if let Ok(rel) = path.strip_prefix(base) {
                keys.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), AppError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Append rather than replace the extension: `a.json` and `a.tmp`
        // are distinct keys and must not share a temp file.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".write.tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            if root.is_dir() {
                Self::collect_keys(&root, &root, &mut keys)?;
            }
            Ok::<_, std::io::Error>(keys)
        })
        .await
        .map_err(|e| AppError::Internal(anyhow::Error::new(e)))??;

        let mut keys: Vec<String> = keys
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// A component's view of the state store: every key lives under
/// `<component>/`.
pub struct ScopedStateStore {
    inner: Arc<dyn StateStore>,
    namespace: String,
}

impl ScopedStateStore {
    pub fn new(inner: Arc<dyn StateStore>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }
}

#[async_trait]
impl StateStore for ScopedStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), AppError> {
        self.inner.put(&self.scoped(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let scoped_prefix = if prefix.is_empty() {
            format!("{}/", self.namespace)
        } else {
            self.scoped(prefix)
        };
        let keys = self.inner.list(&scoped_prefix).await?;
        let strip = format!("{}/", self.namespace);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&strip).map(str::to_string))
            .collect())
    }
}
