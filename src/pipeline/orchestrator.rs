use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::db::documents::DocumentStore;
use crate::models::job::{Job, Role};
use crate::pipeline::encoder::{self, EncodedVariant};
use crate::pipeline::fetch::{FetchStage, FetchedImage};
use crate::pipeline::planner::{self, CropPlan, Variant};
use crate::pipeline::reconcile::UrlReconciler;
use crate::pipeline::upload::{JobProgress, UploadStage, UrlMap};
use crate::pipeline::JobSummary;
use crate::services::colors::ColorExtractor;
use crate::services::detector::RegionDetector;
use crate::services::progress::ProgressStore;
use crate::services::storage::ObjectStore;

/// Concurrency bounds and naming knobs, resolved once at startup and
/// injected into the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub fetch_workers: usize,
    pub variant_workers: usize,
    pub max_concurrent_jobs: usize,
    pub public_base_url: String,
    pub dest_prefix: String,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            fetch_workers: config.fetch_workers,
            variant_workers: config.variant_workers,
            max_concurrent_jobs: config.max_concurrent_jobs,
            public_base_url: config.public_base_url.clone(),
            dest_prefix: config.dest_prefix.clone(),
        }
    }
}

/// Owns the end-to-end per-job and per-batch control flow. All
/// collaborators are constructed by the process entry point and passed
/// in; the orchestrator holds no process-global state.
pub struct Orchestrator {
    fetch: FetchStage,
    upload: Arc<UploadStage>,
    reconciler: UrlReconciler,
    detector: Arc<dyn RegionDetector>,
    colors: Arc<dyn ColorExtractor>,
    variant_workers: usize,
    job_slots: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct SourceOutcome {
    produced: u64,
    skipped: usize,
    failed: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        detector: Arc<dyn RegionDetector>,
        colors: Arc<dyn ColorExtractor>,
        documents: Arc<dyn DocumentStore>,
        progress: Arc<dyn ProgressStore>,
        options: PipelineOptions,
    ) -> Self {
        let fetch = FetchStage::new(store.clone(), options.fetch_workers);
        let upload = Arc::new(UploadStage::new(
            store,
            progress,
            &options.public_base_url,
            &options.dest_prefix,
        ));
        let reconciler = UrlReconciler::new(documents);

        Self {
            fetch,
            upload,
            reconciler,
            detector,
            colors,
            variant_workers: options.variant_workers.max(1),
            job_slots: Arc::new(Semaphore::new(options.max_concurrent_jobs.max(1))),
        }
    }

    /// Process one job end to end: stream fetches into the bounded
    /// variant pool, join every source task (the barrier the reconciler
    /// depends on), then reconcile document URLs once. Nothing below
    /// job granularity escapes as an error.
    pub async fn process_job(&self, job: Job) -> JobSummary {
        let started = Instant::now();
        let job_id = job.id;
        let total_sources = job.sources.len();

        let progress = Arc::new(JobProgress::new());
        let urls = Arc::new(UrlMap::default());
        let limiter = Arc::new(Semaphore::new(self.variant_workers));

        let mut rx = self.fetch.spawn(&job_id, job.sources);
        let mut workers: JoinSet<SourceOutcome> = JoinSet::new();
        let mut fetched = 0usize;

        while let Some(image) = rx.recv().await {
            fetched += 1;
            let permit = match limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let job_id = job_id.clone();
            let detector = Arc::clone(&self.detector);
            let colors = Arc::clone(&self.colors);
            let upload = Arc::clone(&self.upload);
            let progress = Arc::clone(&progress);
            let urls = Arc::clone(&urls);

            workers.spawn(async move {
                let _permit = permit;
                process_source(image, job_id, detector, colors, upload, progress, urls).await
            });
        }

        // Join barrier: the reconciler needs the complete URL map.
        let mut produced = 0u64;
        let mut skipped = 0usize;
        let mut failed = total_sources - fetched;
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(outcome) => {
                    produced += outcome.produced;
                    skipped += outcome.skipped;
                    failed += outcome.failed;
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(job_id = %job_id, error = %e, "source task aborted");
                }
            }
        }

        let url_map = urls.snapshot();
        let reconciled = match self.reconciler.reconcile(&job_id, &url_map).await {
            Ok(modified) => modified,
            Err(e) => {
                // Uploads stand; the document stays stale until a
                // corrective run.
                tracing::error!(job_id = %job_id, error = %e, "URL reconciliation failed");
                0
            }
        };

        let elapsed = started.elapsed();
        metrics::histogram!("job_duration_seconds").record(elapsed.as_secs_f64());

        let summary = JobSummary {
            job_id,
            sources: total_sources,
            fetched,
            produced,
            skipped,
            failed,
            reconciled,
        };
        tracing::info!(
            job_id = %summary.job_id,
            sources = summary.sources,
            fetched = summary.fetched,
            produced = summary.produced,
            skipped = summary.skipped,
            failed = summary.failed,
            reconciled = summary.reconciled,
            elapsed_ms = elapsed.as_millis() as u64,
            "job finished"
        );
        summary
    }

    /// Process a batch of independent jobs in parallel, bounded by the
    /// job slot pool. One job's total failure never aborts its siblings.
    pub async fn process_batch(self: Arc<Self>, jobs: Vec<Job>) -> Vec<JobSummary> {
        let mut tasks = JoinSet::new();
        for job in jobs {
            let slot = match self.job_slots.clone().acquire_owned().await {
                Ok(slot) => slot,
                Err(_) => break,
            };
            let orchestrator = Arc::clone(&self);
            tasks.spawn(async move {
                let _slot = slot;
                orchestrator.process_job(job).await
            });
        }

        let mut summaries = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::error!(error = %e, "job task aborted"),
            }
        }
        summaries
    }
}

/// Process one fetched source: detect, plan, encode, upload its
/// variants, then clean up the original. Every failure is recorded and
/// contained here.
async fn process_source(
    image: FetchedImage,
    job_id: String,
    detector: Arc<dyn RegionDetector>,
    colors: Arc<dyn ColorExtractor>,
    upload: Arc<UploadStage>,
    progress: Arc<JobProgress>,
    urls: Arc<UrlMap>,
) -> SourceOutcome {
    let FetchedImage { role, url, bytes } = image;
    let mut outcome = SourceOutcome::default();

    let regions = if role.uses_detection() {
        match detector.detect(&bytes).await {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    role = %role,
                    url = %url,
                    error = %e,
                    "detection failed, planning without regions"
                );
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let decoded = tokio::task::spawn_blocking(move || encoder::decode(&bytes)).await;
    let img = match decoded {
        Ok(Ok(img)) => img,
        Ok(Err(e)) => {
            tracing::warn!(job_id = %job_id, role = %role, url = %url, error = %e, "source decode failed");
            outcome.failed += 1;
            return outcome;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, role = %role, url = %url, error = %e, "decode task aborted");
            outcome.failed += 1;
            return outcome;
        }
    };

    let (source_width, source_height) = (img.width(), img.height());
    let plans = planner::plan_crops(source_width, source_height, role, &regions);
    if plans.is_empty() {
        tracing::warn!(
            job_id = %job_id,
            role = %role,
            url = %url,
            width = source_width,
            height = source_height,
            "no viable crop plan"
        );
        outcome.skipped += 1;
        return outcome;
    }
    progress.expect(plans.len() as u64);

    // Sibling variants of the same image still attempt production when
    // one of them fails to encode.
    let encode_result = tokio::task::spawn_blocking(move || {
        let mut encoded: Vec<(CropPlan, Vec<u8>)> = Vec::new();
        let mut failures = 0usize;
        for plan in plans {
            match encoder::encode_crop(&img, plan.rect) {
                Ok(bytes) => encoded.push((plan, bytes)),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, variant = ?plan.variant, "variant encode failed");
                }
            }
        }
        (encoded, failures)
    })
    .await;
    let (encoded, encode_failures) = match encode_result {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(job_id = %job_id, role = %role, url = %url, error = %e, "encode task aborted");
            outcome.failed += 1;
            return outcome;
        }
    };
    outcome.failed += encode_failures;
    if encoded.is_empty() {
        return outcome;
    }

    // Color tag is resolved before any write so the key never changes
    // after the fact: thumbnails use their own crop, product variants
    // share the wide crop's color.
    let color_source = match role {
        Role::Thumbnail => encoded.first().map(|(_, bytes)| bytes),
        Role::Product => encoded
            .iter()
            .find(|(plan, _)| plan.variant == Variant::Wide)
            .map(|(_, bytes)| bytes),
        _ => None,
    };
    let color = match color_source {
        Some(bytes) => match colors.extract(bytes).await {
            Ok(tag) => Some(tag),
            Err(e) => {
                tracing::info!(
                    job_id = %job_id,
                    role = %role,
                    url = %url,
                    error = %e,
                    "color extraction failed, key omits color tag"
                );
                None
            }
        },
        None => None,
    };

    let base = encoder::source_basename(&url);
    for (plan, bytes) in encoded {
        let variant = EncodedVariant {
            key: encoder::variant_key(
                &base,
                plan.variant,
                source_width,
                source_height,
                color.as_deref(),
            ),
            role,
            variant: plan.variant,
            bytes,
        };
        match upload
            .upload_variant(&job_id, &url, &variant, &progress, &urls)
            .await
        {
            Ok(()) => outcome.produced += 1,
            Err(e) => {
                outcome.failed += 1;
                metrics::counter!("variants_failed_total").increment(1);
                tracing::warn!(
                    job_id = %job_id,
                    role = %role,
                    url = %url,
                    key = %variant.key,
                    error = %e,
                    "variant upload failed"
                );
            }
        }
    }

    // Original cleanup runs even when some sibling uploads failed.
    upload.delete_original(&job_id, &url).await;

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::documents::DocumentError;
    use crate::models::job::ImageSource;
    use crate::pipeline::planner::Region;
    use crate::services::colors::ColorError;
    use crate::services::detector::DetectorError;
    use crate::services::progress::ProgressError;
    use crate::services::storage::StorageError;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::Config(format!("missing {key}")))
        }

        async fn put(&self, key: &str, data: &[u8], _: &str) -> Result<(), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }

    struct NoRegions;

    #[async_trait]
    impl RegionDetector for NoRegions {
        async fn detect(&self, _: &[u8]) -> Result<Vec<Region>, DetectorError> {
            Ok(Vec::new())
        }
    }

    struct FixedColor;

    #[async_trait]
    impl ColorExtractor for FixedColor {
        async fn extract(&self, _: &[u8]) -> Result<String, ColorError> {
            Ok("705050".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingDocuments {
        doc: Mutex<Option<Value>>,
        updates: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DocumentStore for RecordingDocuments {
        async fn find(&self, _: &str, _: &[&str]) -> Result<Option<Value>, DocumentError> {
            Ok(self.doc.lock().unwrap().clone())
        }

        async fn update(
            &self,
            _: &str,
            updates: &[(String, String)],
        ) -> Result<u64, DocumentError> {
            self.updates.lock().unwrap().extend_from_slice(updates);
            Ok(1)
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        count: AtomicU64,
    }

    #[async_trait]
    impl ProgressStore for CountingProgress {
        async fn increment(&self, _: &str) -> Result<u64, ProgressError> {
            Ok(self.count.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 60, 30])));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            fetch_workers: 2,
            variant_workers: 4,
            max_concurrent_jobs: 2,
            public_base_url: "https://cdn.example.com".to_string(),
            dest_prefix: "processed".to_string(),
        }
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        documents: Arc<RecordingDocuments>,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            store,
            Arc::new(NoRegions),
            Arc::new(FixedColor),
            documents,
            Arc::new(CountingProgress::default()),
            options(),
        ))
    }

    #[tokio::test]
    async fn empty_job_yields_an_empty_summary() {
        let store = Arc::new(MemoryStore::default());
        let documents = Arc::new(RecordingDocuments::default());
        let orchestrator = orchestrator(store, documents.clone());

        let summary = orchestrator
            .process_job(Job {
                id: "job-0".to_string(),
                sources: Vec::new(),
            })
            .await;

        assert_eq!(summary.sources, 0);
        assert_eq!(summary.produced, 0);
        assert_eq!(summary.reconciled, 0);
        assert!(documents.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_to_its_source() {
        let store = Arc::new(MemoryStore::default());
        store
            .objects
            .lock()
            .unwrap()
            .insert("queue/cover.png".to_string(), png(1200, 900));
        // queue/item.png is intentionally absent

        let documents = Arc::new(RecordingDocuments::default());
        *documents.doc.lock().unwrap() = Some(json!({
            "thumbnail": "https://cdn.example.com/queue/cover.png",
        }));

        let orchestrator = orchestrator(store.clone(), documents.clone());
        let summary = orchestrator
            .process_job(Job {
                id: "job-1".to_string(),
                sources: vec![
                    ImageSource {
                        role: Role::Thumbnail,
                        url: "https://cdn.example.com/queue/cover.png".to_string(),
                    },
                    ImageSource {
                        role: Role::Product,
                        url: "https://cdn.example.com/queue/item.png".to_string(),
                    },
                ],
            })
            .await;

        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.produced, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.reconciled, 1);

        let objects = store.objects.lock().unwrap();
        assert!(objects.contains_key("processed/job-1/cover-c(705050).jpg"));
        // original deleted after processing
        assert!(!objects.contains_key("queue/cover.png"));

        let updates = documents.updates.lock().unwrap();
        assert_eq!(
            updates.as_slice(),
            &[(
                "thumbnail".to_string(),
                "https://cdn.example.com/processed/job-1/cover-c(705050).jpg".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn batch_jobs_run_independently() {
        let store = Arc::new(MemoryStore::default());
        store
            .objects
            .lock()
            .unwrap()
            .insert("queue/mark.png".to_string(), png(64, 64));

        let documents = Arc::new(RecordingDocuments::default());
        let orchestrator = orchestrator(store, documents);

        let jobs = vec![
            Job {
                id: "job-a".to_string(),
                sources: vec![ImageSource {
                    role: Role::Watermark,
                    url: "https://cdn.example.com/queue/mark.png".to_string(),
                }],
            },
            Job {
                id: "job-b".to_string(),
                sources: vec![ImageSource {
                    role: Role::Watermark,
                    url: "https://cdn.example.com/queue/missing.png".to_string(),
                }],
            },
        ];

        let mut summaries = orchestrator.process_batch(jobs).await;
        summaries.sort_by(|a, b| a.job_id.cmp(&b.job_id));

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].produced, 1);
        assert_eq!(summaries[1].produced, 0);
        assert_eq!(summaries[1].failed, 1);
    }
}
