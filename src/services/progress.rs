use async_trait::async_trait;
use redis::AsyncCommands;

const PROGRESS_KEY_PREFIX: &str = "image_variants:progress:";

/// Completion-counter collaborator. Purely observability; the pipeline's
/// own accounting never depends on it.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Increment the completed-artifact count for a job, returning the
    /// new count.
    async fn increment(&self, job_id: &str) -> Result<u64, ProgressError>;
}

/// Redis counter, one key per job.
pub struct RedisProgress {
    client: redis::Client,
}

impl RedisProgress {
    pub fn new(redis_url: &str) -> Result<Self, ProgressError> {
        let client = redis::Client::open(redis_url).map_err(ProgressError::Redis)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProgressStore for RedisProgress {
    async fn increment(&self, job_id: &str) -> Result<u64, ProgressError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(ProgressError::Redis)?;
        let count: u64 = conn
            .incr(format!("{PROGRESS_KEY_PREFIX}{job_id}"), 1)
            .await
            .map_err(ProgressError::Redis)?;
        Ok(count)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
