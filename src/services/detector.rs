use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::pipeline::planner::Region;

/// Confidence floor passed to the inference endpoint; boxes below it are
/// never returned.
const CONFIDENCE_THRESHOLD: f32 = 0.25;

/// Region-of-interest detector collaborator. Implementations must be
/// safe to call concurrently from multiple workers.
#[async_trait]
pub trait RegionDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Region>, DetectorError>;
}

/// Client for an HTTP detector inference endpoint.
pub struct HttpDetector {
    http: Client,
    url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct DetectRequest {
    image: String,
    confidence_threshold: f32,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<Detection>,
}

#[derive(Deserialize)]
struct Detection {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    confidence: f32,
}

impl HttpDetector {
    pub fn new(url: String, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url,
            api_token,
        }
    }
}

#[async_trait]
impl RegionDetector for HttpDetector {
    /// Send an encoded image to the inference endpoint and parse the
    /// returned boxes, most confident first.
    async fn detect(&self, image: &[u8]) -> Result<Vec<Region>, DetectorError> {
        let request_body = DetectRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
            confidence_threshold: CONFIDENCE_THRESHOLD,
        };

        let mut request = self.http.post(&self.url).json(&request_body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(DetectorError::Http)?;
        let response = response
            .error_for_status()
            .map_err(DetectorError::Http)?;

        let mut detections = response
            .json::<DetectResponse>()
            .await
            .map_err(DetectorError::Http)?
            .detections;

        detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(detections
            .into_iter()
            .map(|d| Region {
                left: d.x,
                top: d.y,
                width: d.w,
                height: d.h,
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}
