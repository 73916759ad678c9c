//! Document store contract and its SQLite implementation
//!
//! The reconciliation engine treats persistence as a schemaless document
//! store: JSON bodies keyed by id inside a named container, an opaque etag
//! per document, conditional replace on that etag, and paged queries over
//! top-level or nested fields. Anything honouring [`DocumentStore`] can back
//! the repositories; [`SqliteDocumentStore`] is the implementation shipped
//! with the service.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Logical document collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Resources,
    AirlockRequests,
    Templates,
}

impl Container {
    pub fn as_str(self) -> &'static str {
        match self {
            Container::Resources => "resources",
            Container::AirlockRequests => "airlock-requests",
            Container::Templates => "templates",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document together with its concurrency token
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub etag: String,
    pub body: Value,
    /// Store-assigned insertion sequence, used as the paging cursor
    pub seq: i64,
}

/// Equality predicate on a (possibly nested, dot separated) document field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub container: Container,
    pub filters: Vec<FieldFilter>,
}

impl DocumentQuery {
    pub fn new(container: Container) -> Self {
        Self {
            container,
            filters: Vec::new(),
        }
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    /// Cursor for the next page, `None` once the result set is exhausted
    pub next: Option<i64>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document. Fails with `Conflict` if the id is taken.
    async fn create_item(&self, container: Container, id: &str, body: &Value) -> Result<Document>;

    /// Read a document. Fails with `NotFound` if it does not exist.
    async fn read_item(&self, container: Container, id: &str) -> Result<Document>;

    /// Replace a document only if its stored etag still equals `etag`.
    async fn conditional_replace(
        &self,
        container: Container,
        id: &str,
        body: &Value,
        etag: &str,
    ) -> Result<Document>;

    /// One page of documents matching `query`, in insertion order.
    async fn query_page(
        &self,
        query: &DocumentQuery,
        after: Option<i64>,
        limit: u32,
    ) -> Result<DocumentPage>;

    /// Persist history entries pruned from a resource document. Entries are
    /// keyed by `(resource_id, resource_version)`, so repeating a call is
    /// harmless.
    async fn archive_history(&self, resource_id: &str, entries: &[(u64, Value)]) -> Result<()>;

    /// Round trip to the backing store
    async fn ping(&self) -> Result<()>;
}

pub type DocumentStream = BoxStream<'static, Result<Document>>;

struct QueryState {
    store: Arc<dyn DocumentStore>,
    query: DocumentQuery,
    page_size: u32,
    cursor: Option<i64>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

/// Lazily page through all documents matching `query`.
///
/// The stream is single pass: pages are fetched on demand and nothing is
/// retained once yielded.
pub fn query_stream(
    store: Arc<dyn DocumentStore>,
    query: DocumentQuery,
    page_size: u32,
) -> DocumentStream {
    let state = QueryState {
        store,
        query,
        page_size: page_size.max(1),
        cursor: None,
        buffer: VecDeque::new(),
        exhausted: false,
    };

    stream::try_unfold(state, next_document).boxed()
}

async fn next_document(mut state: QueryState) -> Result<Option<(Document, QueryState)>> {
    loop {
        if let Some(document) = state.buffer.pop_front() {
            return Ok(Some((document, state)));
        }
        if state.exhausted {
            return Ok(None);
        }

        let page = state
            .store
            .query_page(&state.query, state.cursor, state.page_size)
            .await?;
        state.exhausted = page.next.is_none();
        state.cursor = page.next;
        state.buffer.extend(page.documents);
    }
}

fn new_etag() -> String {
    Uuid::new_v4().to_string()
}

/// Build an SQLite JSON path for a dot separated field name.
fn json_path(field: &str) -> String {
    let mut path = String::from("$");
    for segment in field.split('.') {
        let plain = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if plain {
            path.push('.');
            path.push_str(segment);
        } else {
            path.push_str(&format!(".\"{}\"", segment.replace('"', "\\\"")));
        }
    }
    path
}

/// How a JSON value compares against `json_extract` output in SQLite
#[derive(Debug, PartialEq)]
enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Int(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    seq: i64,
    id: String,
    etag: String,
    body: String,
}

impl TryFrom<DocumentRow> for Document {
    type Error = OrchestratorError;

    fn try_from(row: DocumentRow) -> Result<Self> {
        Ok(Self {
            body: serde_json::from_str(&row.body)?,
            id: row.id,
            etag: row.etag,
            seq: row.seq,
        })
    }
}

/// [`DocumentStore`] on a single SQLite table
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Archived history entries of a resource, oldest first
    pub async fn archived_history(&self, resource_id: &str) -> Result<Vec<Value>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT entry FROM history_archive WHERE resource_id = ? ORDER BY resource_version",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|entry| serde_json::from_str(entry).map_err(OrchestratorError::from))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    #[instrument(skip(self, body), fields(container = %container))]
    async fn create_item(&self, container: Container, id: &str, body: &Value) -> Result<Document> {
        let etag = new_etag();
        let text = serde_json::to_string(body)?;

        let result = sqlx::query(
            "INSERT INTO documents (container, id, etag, body, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(container.as_str())
        .bind(id)
        .bind(&etag)
        .bind(&text)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(Document {
                id: id.to_string(),
                etag,
                body: body.clone(),
                seq: done.last_insert_rowid(),
            }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(OrchestratorError::Conflict(format!(
                    "{} document {} already exists",
                    container, id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_item(&self, container: Container, id: &str) -> Result<Document> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT seq, id, etag, body FROM documents WHERE container = ? AND id = ?",
        )
        .bind(container.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("{} document {}", container, id)))?;

        row.try_into()
    }

    #[instrument(skip(self, body), fields(container = %container))]
    async fn conditional_replace(
        &self,
        container: Container,
        id: &str,
        body: &Value,
        etag: &str,
    ) -> Result<Document> {
        let new_etag = new_etag();
        let text = serde_json::to_string(body)?;

        let seq: Option<i64> = sqlx::query_scalar(
            "UPDATE documents SET body = ?, etag = ?, updated_at = ?
             WHERE container = ? AND id = ? AND etag = ?
             RETURNING seq",
        )
        .bind(&text)
        .bind(&new_etag)
        .bind(Utc::now().timestamp_millis())
        .bind(container.as_str())
        .bind(id)
        .bind(etag)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(seq) = seq {
            return Ok(Document {
                id: id.to_string(),
                etag: new_etag,
                body: body.clone(),
                seq,
            });
        }

        // Nothing matched: either the document is gone or the etag moved on
        let current = self.read_item(container, id).await?;
        debug!(
            expected = etag,
            actual = %current.etag,
            "Conditional replace rejected"
        );
        Err(OrchestratorError::Conflict(format!(
            "etag mismatch for {} document {}",
            container, id
        )))
    }

    async fn query_page(
        &self,
        query: &DocumentQuery,
        after: Option<i64>,
        limit: u32,
    ) -> Result<DocumentPage> {
        let mut sql = "SELECT seq, id, etag, body FROM documents WHERE container = ?".to_string();

        if after.is_some() {
            sql.push_str(" AND seq > ?");
        }
        let values: Vec<(String, SqlValue)> = query
            .filters
            .iter()
            .map(|f| (json_path(&f.field), SqlValue::from(&f.value)))
            .collect();
        for (_, value) in &values {
            match value {
                SqlValue::Null => sql.push_str(" AND json_extract(body, ?) IS NULL"),
                _ => sql.push_str(" AND json_extract(body, ?) = ?"),
            }
        }
        sql.push_str(" ORDER BY seq LIMIT ?");

        let mut q = sqlx::query_as::<_, DocumentRow>(&sql).bind(query.container.as_str());
        if let Some(after) = after {
            q = q.bind(after);
        }
        for (path, value) in values {
            q = q.bind(path);
            q = match value {
                SqlValue::Null => q,
                SqlValue::Int(i) => q.bind(i),
                SqlValue::Real(r) => q.bind(r),
                SqlValue::Text(s) => q.bind(s),
            };
        }
        q = q.bind(i64::from(limit));

        let rows = q.fetch_all(&self.pool).await?;
        let full_page = rows.len() as u64 == u64::from(limit);

        let documents = rows
            .into_iter()
            .map(Document::try_from)
            .collect::<Result<Vec<_>>>()?;
        let next = if full_page {
            documents.last().map(|d| d.seq)
        } else {
            None
        };

        Ok(DocumentPage { documents, next })
    }

    async fn archive_history(&self, resource_id: &str, entries: &[(u64, Value)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for (version, entry) in entries {
            sqlx::query(
                "INSERT OR IGNORE INTO history_archive
                     (resource_id, resource_version, entry, archived_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(resource_id)
            .bind(*version as i64)
            .bind(serde_json::to_string(entry)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
