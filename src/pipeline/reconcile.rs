use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::db::documents::{DocumentError, DocumentStore};

/// Mapping keys whose string values are eligible for substitution.
pub const DEFAULT_URL_FIELDS: &[&str] = &["thumbnail", "src", "image"];

/// Top-level document fields fetched for reconciliation.
pub const DEFAULT_PROJECTION: &[&str] = &["thumbnail", "description", "product"];

/// Rewrites URL-valued fields inside a job's metadata document from old
/// to new locators, once per job after all uploads finished. Targeted
/// substitution only: fields outside the allow-list, and values with no
/// map entry, are never touched.
pub struct UrlReconciler {
    documents: Arc<dyn DocumentStore>,
    allowed_fields: Vec<String>,
    projection: Vec<String>,
}

impl UrlReconciler {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            allowed_fields: DEFAULT_URL_FIELDS.iter().map(|s| s.to_string()).collect(),
            projection: DEFAULT_PROJECTION.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the default key allow-list.
    pub fn with_allowed_fields(mut self, fields: &[&str]) -> Self {
        self.allowed_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Stage and apply every eligible substitution as one write.
    /// Returns the number of documents modified (0 or 1).
    pub async fn reconcile(
        &self,
        job_id: &str,
        urls: &HashMap<String, String>,
    ) -> Result<u64, DocumentError> {
        if urls.is_empty() {
            return Ok(0);
        }

        let projection: Vec<&str> = self.projection.iter().map(String::as_str).collect();
        let Some(doc) = self.documents.find(job_id, &projection).await? else {
            tracing::warn!(job_id = %job_id, "no metadata document for job, nothing to reconcile");
            return Ok(0);
        };

        let updates = collect_updates(&doc, &self.allowed_fields, urls);
        if updates.is_empty() {
            tracing::debug!(job_id = %job_id, "no document fields reference uploaded sources");
            return Ok(0);
        }

        let modified = self.documents.update(job_id, &updates).await?;
        tracing::info!(
            job_id = %job_id,
            staged = updates.len(),
            modified = modified,
            "reconciled document URLs"
        );
        Ok(modified)
    }
}

/// Walk the document iteratively (explicit stack, bounded memory on
/// deep or wide documents) and collect dot-path → new-value pairs.
/// Mapping fields require an allow-listed key; sequence elements have
/// no key and match on value alone.
pub fn collect_updates(
    doc: &Value,
    allowed_fields: &[String],
    urls: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut updates = Vec::new();
    let mut stack: Vec<(String, &Value)> = vec![(String::new(), doc)];

    while let Some((path, value)) = stack.pop() {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = join_path(&path, key);
                    match child {
                        Value::String(s) if allowed_fields.iter().any(|f| f == key) => {
                            if let Some(new_url) = urls.get(s) {
                                updates.push((child_path, new_url.clone()));
                            }
                        }
                        Value::Object(_) | Value::Array(_) => stack.push((child_path, child)),
                        _ => {}
                    }
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let child_path = join_path(&path, &index.to_string());
                    match item {
                        Value::String(s) => {
                            if let Some(new_url) = urls.get(s) {
                                updates.push((child_path, new_url.clone()));
                            }
                        }
                        Value::Object(_) | Value::Array(_) => stack.push((child_path, item)),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    updates
}

fn join_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}
