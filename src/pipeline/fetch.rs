use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::models::job::{ImageSource, Role};
use crate::services::storage::{object_key, ObjectStore};

/// One successfully retrieved source image. Bytes are owned by the
/// receiver until handed to planning/encoding.
#[derive(Debug)]
pub struct FetchedImage {
    pub role: Role,
    pub url: String,
    pub bytes: Vec<u8>,
}

/// Concurrently retrieves raw bytes for every image reference in a job.
/// The pool is bounded independently of (and smaller than) the variant
/// processing pool; one failed retrieval never cancels its siblings.
pub struct FetchStage {
    store: Arc<dyn ObjectStore>,
    workers: usize,
}

impl FetchStage {
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize) -> Self {
        Self {
            store,
            workers: workers.max(1),
        }
    }

    /// Dispatch one retrieval per reference into the bounded pool and
    /// stream results back as they complete, not in submission order.
    /// The channel closes once every retrieval has finished; failed
    /// references are logged and simply never appear on the stream.
    pub fn spawn(&self, job_id: &str, sources: Vec<ImageSource>) -> mpsc::Receiver<FetchedImage> {
        let (tx, rx) = mpsc::channel(self.workers);
        let limiter = Arc::new(Semaphore::new(self.workers));

        for source in sources {
            let store = Arc::clone(&self.store);
            let tx = tx.clone();
            let limiter = Arc::clone(&limiter);
            let job_id = job_id.to_string();

            tokio::spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let Some(key) = object_key(&source.url) else {
                    tracing::warn!(
                        job_id = %job_id,
                        role = %source.role,
                        url = %source.url,
                        "source URL carries no object key, skipping"
                    );
                    return;
                };

                match store.get(key).await {
                    Ok(bytes) => {
                        tracing::debug!(
                            job_id = %job_id,
                            role = %source.role,
                            key = %key,
                            size = bytes.len(),
                            "fetched source"
                        );
                        let _ = tx
                            .send(FetchedImage {
                                role: source.role,
                                url: source.url,
                                bytes,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %job_id,
                            role = %source.role,
                            url = %source.url,
                            error = %e,
                            "source fetch failed"
                        );
                    }
                }
            });
        }

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::StorageError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MapStore {
        objects: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl ObjectStore for MapStore {
        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.objects
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::Config(format!("missing {key}")))
        }

        async fn put(&self, _: &str, _: &[u8], _: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn delete(&self, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn source(role: Role, url: &str) -> ImageSource {
        ImageSource {
            role,
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn failed_fetches_do_not_cancel_siblings() {
        let store = Arc::new(MapStore {
            objects: HashMap::from([
                ("queue/a.png".to_string(), vec![1u8]),
                ("queue/c.png".to_string(), vec![3u8]),
            ]),
        });
        let stage = FetchStage::new(store, 2);

        let mut rx = stage.spawn(
            "job-1",
            vec![
                source(Role::Thumbnail, "https://cdn.example.com/queue/a.png"),
                source(Role::Product, "https://cdn.example.com/queue/b.png"),
                source(Role::Product, "https://cdn.example.com/queue/c.png"),
            ],
        );

        let mut received = Vec::new();
        while let Some(image) = rx.recv().await {
            received.push(image.url);
        }
        received.sort();
        assert_eq!(
            received,
            vec![
                "https://cdn.example.com/queue/a.png",
                "https://cdn.example.com/queue/c.png",
            ]
        );
    }

    #[tokio::test]
    async fn stream_closes_when_every_reference_is_done() {
        let store = Arc::new(MapStore {
            objects: HashMap::new(),
        });
        let stage = FetchStage::new(store, 4);
        let mut rx = stage.spawn("job-2", Vec::new());
        assert!(rx.recv().await.is_none());
    }
}
