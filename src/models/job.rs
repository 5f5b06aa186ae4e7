use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Semantic purpose of an image within a job. Drives which crop policy
/// applies and whether region detection runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Thumbnail,
    Description,
    Product,
    Watermark,
}

impl Role {
    /// Only thumbnail and product crops are anchored on detected regions.
    pub fn uses_detection(self) -> bool {
        matches!(self, Role::Thumbnail | Role::Product)
    }
}

/// One source image reference within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    pub role: Role,
    pub url: String,
}

/// A decomposed job ready for the pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub sources: Vec<ImageSource>,
}

/// Role→URL manifest as produced upstream: scalar for thumbnail and
/// watermark, list for description and product.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ImageManifest {
    #[garde(inner(length(min = 1, max = 2048)))]
    pub thumbnail: Option<String>,

    #[serde(default)]
    #[garde(inner(length(min = 1, max = 2048)))]
    pub description: Vec<String>,

    #[serde(default)]
    #[garde(inner(length(min = 1, max = 2048)))]
    pub product: Vec<String>,

    #[garde(inner(length(min = 1, max = 2048)))]
    pub watermark: Option<String>,
}

impl ImageManifest {
    pub fn is_empty(&self) -> bool {
        self.thumbnail.is_none()
            && self.description.is_empty()
            && self.product.is_empty()
            && self.watermark.is_none()
    }
}

/// Job payload serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueuedJob {
    /// Opaque identifier minted by the upstream producer.
    #[garde(length(min = 1, max = 128))]
    pub id: String,

    #[garde(dive)]
    pub images: ImageManifest,

    #[garde(skip)]
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Flatten the manifest into the pipeline's ordered source list.
    pub fn into_job(self) -> Job {
        let ImageManifest {
            thumbnail,
            description,
            product,
            watermark,
        } = self.images;

        let mut sources = Vec::new();
        if let Some(url) = thumbnail {
            sources.push(ImageSource {
                role: Role::Thumbnail,
                url,
            });
        }
        sources.extend(description.into_iter().map(|url| ImageSource {
            role: Role::Description,
            url,
        }));
        sources.extend(product.into_iter().map(|url| ImageSource {
            role: Role::Product,
            url,
        }));
        if let Some(url) = watermark {
            sources.push(ImageSource {
                role: Role::Watermark,
                url,
            });
        }

        Job {
            id: self.id,
            sources,
        }
    }
}
