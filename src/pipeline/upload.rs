use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::pipeline::encoder::EncodedVariant;
use crate::pipeline::planner::Variant;
use crate::services::progress::ProgressStore;
use crate::services::storage::{object_key, ObjectStore, StorageError};

/// Per-job artifact accounting shared by all upload workers of one job.
/// Counts only successful uploads and is never decremented.
#[derive(Debug, Default)]
pub struct JobProgress {
    expected: AtomicU64,
    completed: AtomicU64,
}

impl JobProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the expected-artifact total as plans materialize.
    pub fn expect(&self, count: u64) {
        self.expected.fetch_add(count, Ordering::Relaxed);
    }

    /// Record one durably stored artifact, returning the new count.
    pub fn record_completed(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }
}

/// Old→new public locator mapping, built incrementally as variants land
/// in storage and consumed once per job by the reconciler.
#[derive(Debug, Default)]
pub struct UrlMap {
    entries: Mutex<HashMap<String, String>>,
}

impl UrlMap {
    pub fn insert(&self, old: String, new: String) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(old, new);
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// The reconciler rewrites one locator per source image: the variant a
/// metadata document would reference. Secondary variants (profile
/// crops, trailing tiles) are discovered by clients through the key
/// grammar instead.
fn is_primary(variant: Variant) -> bool {
    match variant {
        Variant::Thumbnail | Variant::Wide | Variant::Passthrough => true,
        Variant::Tight => false,
        Variant::Tile { part, .. } => part == 1,
    }
}

/// Writes encoded variants to durable storage under the job's
/// namespace, bumps progress, stages URL-map entries, and cleans up
/// originals. A failed variant upload is logged and isolated; it never
/// blocks or rolls back sibling uploads.
pub struct UploadStage {
    store: Arc<dyn ObjectStore>,
    progress_store: Arc<dyn ProgressStore>,
    public_base_url: String,
    dest_prefix: String,
}

impl UploadStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        progress_store: Arc<dyn ProgressStore>,
        public_base_url: &str,
        dest_prefix: &str,
    ) -> Self {
        Self {
            store,
            progress_store,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            dest_prefix: dest_prefix.trim_matches('/').to_string(),
        }
    }

    fn dest_key(&self, job_id: &str, file: &str) -> String {
        format!("{}/{}/{}", self.dest_prefix, job_id, file)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Upload one encoded variant. On success the job progress counter
    /// is bumped (locally and in the progress store) and, for the
    /// source's primary variant, the old→new locator pair is staged for
    /// reconciliation.
    pub async fn upload_variant(
        &self,
        job_id: &str,
        source_url: &str,
        variant: &EncodedVariant,
        progress: &JobProgress,
        urls: &UrlMap,
    ) -> Result<(), StorageError> {
        let key = self.dest_key(job_id, &variant.key);
        self.store.put(&key, &variant.bytes, "image/jpeg").await?;

        let completed = progress.record_completed();
        metrics::counter!("variants_uploaded_total").increment(1);
        tracing::debug!(
            job_id = %job_id,
            key = %key,
            completed = completed,
            expected = progress.expected(),
            "variant stored"
        );

        // Observability counter only; its failure never fails the upload.
        if let Err(e) = self.progress_store.increment(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "progress counter update failed");
        }

        if is_primary(variant.variant) {
            urls.insert(source_url.to_string(), self.public_url(&key));
        }

        Ok(())
    }

    /// Remove the original source object. Attempted once per source
    /// after its variants were tried, even when some of those uploads
    /// failed: originals are disposable once processing was attempted.
    pub async fn delete_original(&self, job_id: &str, source_url: &str) {
        let Some(key) = object_key(source_url) else {
            return;
        };
        if let Err(e) = self.store.delete(key).await {
            tracing::warn!(
                job_id = %job_id,
                url = %source_url,
                error = %e,
                "failed to delete original"
            );
        }
    }
}
