use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::configuration::ObjectStoreSettings;
use crate::domain::ArtifactRef;
use crate::domain::PipelineError;
use crate::domain::SubmissionId;

/// Bit-exact key layout for submission artifacts. The `{YYYYMM}` prefix
/// comes from the submission's receive time.
pub mod keys {
    use super::*;

    fn month(received_at: DateTime<Utc>) -> String {
        received_at.format("%Y%m").to_string()
    }

    pub fn raw(id: &SubmissionId, received_at: DateTime<Utc>) -> String {
        format!("{}/{}/request/raw.json", month(received_at), id)
    }

    pub fn parsed(id: &SubmissionId, received_at: DateTime<Utc>) -> String {
        format!("{}/{}/request/parsed.json", month(received_at), id)
    }

    pub fn enriched(id: &SubmissionId, received_at: DateTime<Utc>) -> String {
        format!("{}/{}/request/enriched.json", month(received_at), id)
    }

    pub fn canonical(id: &SubmissionId, received_at: DateTime<Utc>) -> String {
        format!("{}/{}/request/canonical.json", month(received_at), id)
    }

    pub fn payer_raw(id: &SubmissionId, received_at: DateTime<Utc>) -> String {
        format!("{}/{}/response/payer-raw.json", month(received_at), id)
    }

    pub fn final_response(id: &SubmissionId, received_at: DateTime<Utc>) -> String {
        format!("{}/{}/response/final.json", month(received_at), id)
    }

    pub fn attachment(
        id: &SubmissionId,
        received_at: DateTime<Utc>,
        attachment_id: &str,
    ) -> String {
        format!("{}/{}/attachments/{}", month(received_at), id, attachment_id)
    }
}

/// Large-payload storage by `(bucket, key)`. Payloads never travel on the
/// bus; stages exchange these references.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), PipelineError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, PipelineError>;

    /// Writes the downstream extract to the canonical
    /// `parsed-data/{tenant}/{submissionId}-parsed.json` path and returns
    /// the key.
    async fn put_parsed(
        &self,
        bucket: &str,
        tenant: &str,
        submission_id: &SubmissionId,
        bytes: &[u8],
    ) -> Result<String, PipelineError>;

    /// Whether the underlying store encrypts at rest (KMS is delegated to
    /// the store; the gateway only records the fact).
    fn encrypted_at_rest(&self) -> bool;
}

/// Filesystem-backed store: one directory per bucket under a configured
/// root. Key segments map to subdirectories.
pub struct FsObjectStore {
    root: PathBuf,
    encrypted_at_rest: bool,
}

impl FsObjectStore {
    pub fn new(settings: &ObjectStoreSettings) -> Self {
        Self {
            root: settings.root.clone(),
            encrypted_at_rest: settings.encrypted_at_rest,
        }
    }

    pub fn shared(settings: &ObjectStoreSettings) -> Arc<dyn ObjectStore> {
        Arc::new(Self::new(settings))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, PipelineError> {
        // keys are produced internally, but reject traversal anyway
        if key.split('/').any(|seg| seg == ".." || seg.is_empty()) || bucket.contains('/') {
            return Err(PipelineError::transient(anyhow::anyhow!(
                "invalid object key: {bucket}/{key}"
            )));
        }
        Ok(self.root.join(bucket).join(Path::new(key)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_parsed(
        &self,
        bucket: &str,
        tenant: &str,
        submission_id: &SubmissionId,
        bytes: &[u8],
    ) -> Result<String, PipelineError> {
        let key = format!("parsed-data/{tenant}/{submission_id}-parsed.json");
        self.put(bucket, &key, bytes).await?;
        Ok(key)
    }

    fn encrypted_at_rest(&self) -> bool {
        self.encrypted_at_rest
    }
}

/// Convenience wrapper: fetch the object an [`ArtifactRef`] points at.
pub async fn fetch(
    store: &dyn ObjectStore,
    artifact: &ArtifactRef,
) -> Result<Vec<u8>, PipelineError> {
    store.get(&artifact.bucket, &artifact.key).await
}
