use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Bind address for the observability endpoints (health, metrics).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (listing document store)
    pub database_url: String,

    /// Redis connection string for job queue and progress counters
    pub redis_url: String,

    /// Bucket name (S3-compatible)
    pub s3_bucket: String,

    /// Endpoint URL (S3-compatible)
    pub s3_endpoint: String,

    /// Region passed alongside the custom endpoint
    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// Access key ID
    pub s3_access_key: String,

    /// Secret access key
    pub s3_secret_key: String,

    /// Region-of-interest detector inference endpoint
    pub detector_url: String,

    /// Bearer token for the detector endpoint
    pub detector_api_token: Option<String>,

    /// Public base URL the bucket is served under (new locator prefix)
    pub public_base_url: String,

    /// Key prefix derived variants are written under
    #[serde(default = "default_dest_prefix")]
    pub dest_prefix: String,

    /// Bound on concurrent source fetches per job. Kept smaller than
    /// `variant_workers`; fetches are network-bound and feed the larger
    /// processing pool.
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    /// Bound on concurrent variant processing/upload tasks per job
    #[serde(default = "default_variant_workers")]
    pub variant_workers: usize,

    /// Bound on jobs processed in parallel by one worker process
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_dest_prefix() -> String {
    "processed".to_string()
}

fn default_fetch_workers() -> usize {
    10
}

fn default_variant_workers() -> usize {
    20
}

fn default_max_concurrent_jobs() -> usize {
    8
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
