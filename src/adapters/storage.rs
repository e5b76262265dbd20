//! Knowledge document bucket.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Deletion;
use crate::context::DeploymentContext;
use crate::error::{ApiResultExt, ProvisionError};
use crate::names::KNOWLEDGE_PREFIX;
use crate::provider::StorageApi;

/// Largest batch accepted by a multi-object delete.
const DELETE_BATCH: usize = 1000;

#[derive(Clone)]
pub struct StorageAdapter {
    ctx: Arc<DeploymentContext>,
    api: Arc<dyn StorageApi>,
}

impl StorageAdapter {
    pub fn new(ctx: Arc<DeploymentContext>, api: Arc<dyn StorageApi>) -> Self {
        Self { ctx, api }
    }

    pub fn bucket(&self) -> &str {
        &self.ctx.names.bucket
    }

    pub fn bucket_arn(&self) -> String {
        format!("arn:aws:s3:::{}", self.bucket())
    }

    pub async fn exists(&self, bucket: &str) -> Result<bool, ProvisionError> {
        Ok(self.api.head_bucket(bucket).await.optional()?.is_some())
    }

    /// Create the deployment bucket if needed and keep versioning on.
    pub async fn ensure_bucket(&self) -> Result<String, ProvisionError> {
        let bucket = self.bucket();
        if self.exists(bucket).await? {
            debug!(bucket, "Bucket exists");
        } else {
            match self.api.create_bucket(bucket, self.ctx.region()).await {
                Ok(()) => info!(bucket, region = self.ctx.region(), "Created bucket"),
                Err(e) if e.is_already_exists() => debug!(bucket, "Bucket appeared concurrently"),
                Err(e) => return Err(e.into()),
            }
        }
        self.api.put_bucket_versioning(bucket, true).await?;
        Ok(bucket.to_string())
    }

    /// Upload a file, or every file under a directory, below the knowledge
    /// prefix. Unreadable files are skipped with a warning; returns how many
    /// objects were written.
    pub async fn upload(&self, path: &Path) -> Result<usize, ProvisionError> {
        if !path.exists() {
            return Err(ProvisionError::Precondition(format!(
                "data path {} does not exist",
                path.display()
            )));
        }

        let files: Vec<(std::path::PathBuf, String)> = if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            vec![(path.to_path_buf(), name)]
        } else {
            WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(e) => Some(e),
                    Err(e) => {
                        warn!("Skipping unreadable entry: {}", e);
                        None
                    }
                })
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    let relative = e.path().strip_prefix(path).ok()?;
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect::<Vec<_>>()
                        .join("/");
                    Some((e.path().to_path_buf(), key))
                })
                .collect()
        };

        let bucket = self.bucket();
        let mut uploaded = 0;
        for (file, relative) in files {
            let body = match tokio::fs::read(&file).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(file = %file.display(), "Skipping file: {}", e);
                    continue;
                }
            };
            let key = format!("{}{}", KNOWLEDGE_PREFIX, relative);
            self.api.put_object(bucket, &key, body).await?;
            debug!(bucket, key = %key, "Uploaded object");
            uploaded += 1;
        }
        info!(bucket, uploaded, "Uploaded knowledge documents");
        Ok(uploaded)
    }

    /// Keys of the uploaded knowledge documents.
    pub async fn knowledge_documents(&self) -> Result<Vec<String>, ProvisionError> {
        Ok(self
            .api
            .list_objects(self.bucket(), Some(KNOWLEDGE_PREFIX))
            .await?)
    }

    /// Remove every object version and delete marker, then the bucket.
    pub async fn force_delete(&self, bucket: &str) -> Result<Deletion, ProvisionError> {
        if !self.exists(bucket).await? {
            return Ok(Deletion::NotFound);
        }

        let mut purged = 0;
        loop {
            let versions = self.api.list_object_versions(bucket).await?;
            if versions.is_empty() {
                break;
            }
            for batch in versions.chunks(DELETE_BATCH) {
                let removed = self.api.delete_objects(bucket, batch).await?;
                if removed == 0 {
                    return Err(ProvisionError::Precondition(format!(
                        "bucket {} still holds objects that cannot be deleted",
                        bucket
                    )));
                }
                purged += removed;
            }
        }
        if purged > 0 {
            info!(bucket, purged, "Emptied bucket");
        }

        let outcome = Deletion::from_result(self.api.delete_bucket(bucket).await)?;
        if outcome.is_deleted() {
            info!(bucket, "Deleted bucket");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing;
    use crate::provider::MemoryControlPlane;

    fn adapter() -> (Arc<MemoryControlPlane>, StorageAdapter) {
        let (sim, plane) = testing::plane();
        (sim, StorageAdapter::new(testing::context(), plane.storage))
    }

    #[tokio::test]
    async fn ensure_bucket_is_idempotent() {
        let (sim, storage) = adapter();
        storage.ensure_bucket().await.unwrap();
        storage.ensure_bucket().await.unwrap();
        assert_eq!(sim.calls("create_bucket"), 1);
        assert_eq!(sim.live_buckets(), vec![storage.bucket().to_string()]);
    }

    #[tokio::test]
    async fn uploads_directory_tree_under_prefix() {
        let (_sim, storage) = adapter();
        storage.ensure_bucket().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("faq.md"), "# FAQ").unwrap();
        std::fs::create_dir(dir.path().join("guides")).unwrap();
        std::fs::write(dir.path().join("guides").join("setup.txt"), "steps").unwrap();

        assert_eq!(storage.upload(dir.path()).await.unwrap(), 2);
        let mut keys = storage.knowledge_documents().await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["knowledge-base/faq.md", "knowledge-base/guides/setup.txt"]
        );
    }

    #[tokio::test]
    async fn uploads_single_file_and_rejects_missing_path() {
        let (_sim, storage) = adapter();
        storage.ensure_bucket().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "hello").unwrap();
        assert_eq!(storage.upload(&file).await.unwrap(), 1);

        let err = storage.upload(&dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Precondition(_)));
    }

    #[tokio::test]
    async fn force_delete_purges_versions_and_is_idempotent() {
        let (sim, storage) = adapter();
        let bucket = storage.ensure_bucket().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        storage.upload(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "2").unwrap();
        storage.upload(dir.path()).await.unwrap();

        assert_eq!(storage.force_delete(&bucket).await.unwrap(), Deletion::Deleted);
        assert!(sim.live_buckets().is_empty());
        assert_eq!(storage.force_delete(&bucket).await.unwrap(), Deletion::NotFound);
    }
}
