use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

/// Read/write handle to the listing metadata documents. Paths are
/// dot-separated, with numeric segments indexing into sequences
/// (`description.2.src`).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, trimmed to the projected top-level fields.
    /// An empty projection returns the whole document.
    async fn find(&self, id: &str, projection: &[&str]) -> Result<Option<Value>, DocumentError>;

    /// Apply all staged path→value updates as one write, returning the
    /// number of documents modified.
    async fn update(&self, id: &str, updates: &[(String, String)]) -> Result<u64, DocumentError>;
}

/// Postgres-backed store, one JSONB document per listing.
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn find(&self, id: &str, projection: &[&str]) -> Result<Option<Value>, DocumentError> {
        let row = sqlx::query("SELECT doc FROM listings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let doc: Value = row.try_get("doc")?;

        if projection.is_empty() {
            return Ok(Some(doc));
        }

        match doc {
            Value::Object(map) => {
                let projected = map
                    .into_iter()
                    .filter(|(k, _)| projection.contains(&k.as_str()))
                    .collect();
                Ok(Some(Value::Object(projected)))
            }
            other => Ok(Some(other)),
        }
    }

    async fn update(&self, id: &str, updates: &[(String, String)]) -> Result<u64, DocumentError> {
        if updates.is_empty() {
            return Ok(0);
        }

        // UPDATE listings
        //   SET doc = jsonb_set(jsonb_set(doc, p1, v1), p2, v2), ...
        // applies every staged path in a single statement.
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE listings SET doc = ");
        for _ in updates {
            qb.push("jsonb_set(");
        }
        qb.push("doc");
        for (path, value) in updates {
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            qb.push(", ");
            qb.push_bind(segments);
            qb.push("::text[], to_jsonb(");
            qb.push_bind(value);
            qb.push("::text), false)");
        }
        qb.push(", updated_at = now() WHERE id = ");
        qb.push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}
