//! External collaborator interfaces.
//!
//! The engine consumes three opaque collaborators: a vector store
//! (put/query over embeddings), a document source (iterate raw documents),
//! and a run-history store (append and query run records). Each is a trait
//! so backends are swappable; the in-memory and JSON-directory
//! implementations here cover tests and local runs.

use crate::errors::StoreError;
use crate::trace::RunRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// A raw document handed to `ingest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The document text.
    pub text: String,
    /// Arbitrary source metadata carried through chunking.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    /// Creates a document from plain text with empty metadata.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One embedded chunk stored in a vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Unique record id.
    pub id: String,
    /// The chunk text.
    pub text: String,
    /// The chunk's embedding.
    pub embedding: Vec<f32>,
    /// Chunk metadata (source, chunk index, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A retrieval hit: a stored chunk with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    /// The chunk text.
    pub text: String,
    /// Similarity score, higher is better.
    pub score: f32,
    /// Chunk metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Put/query interface over an embedding index.
#[async_trait]
pub trait VectorStore: Send + Sync + fmt::Debug {
    /// Stores a batch of embedded chunks.
    async fn put(&self, records: Vec<VectorRecord>) -> Result<(), StoreError>;

    /// Returns the `k` most similar chunks to `embedding`.
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredDocument>, StoreError>;

    /// Number of stored chunks.
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Iteration interface over raw documents.
#[async_trait]
pub trait DocumentSource: Send + Sync + fmt::Debug {
    /// Fetches the source's documents.
    async fn fetch(&self) -> Result<Vec<Document>, StoreError>;
}

/// Append/query interface over persisted run records.
#[async_trait]
pub trait RunHistoryStore: Send + Sync + fmt::Debug {
    /// Appends one completed run record.
    async fn append(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Loads a run record by id.
    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError>;

    /// Lists run records created inside the given time range.
    async fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StoreError>;
}

/// In-memory vector store using cosine similarity.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn put(&self, records: Vec<VectorRecord>) -> Result<(), StoreError> {
        self.records.write().extend(records);
        Ok(())
    }

    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredDocument>, StoreError> {
        let records = self.records.read();
        let mut scored: Vec<ScoredDocument> = records
            .iter()
            .map(|record| ScoredDocument {
                text: record.text.clone(),
                score: cosine(embedding, &record.embedding),
                metadata: record.metadata.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().len())
    }
}

/// A fixed list of documents, useful for tests and demos.
#[derive(Debug, Default)]
pub struct StaticDocumentSource {
    documents: Vec<Document>,
}

impl StaticDocumentSource {
    /// Creates a source over the given documents.
    #[must_use]
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn fetch(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.documents.clone())
    }
}

/// In-memory run history, useful for tests.
#[derive(Debug, Default)]
pub struct InMemoryRunHistory {
    records: RwLock<Vec<RunRecord>>,
}

impl InMemoryRunHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunHistoryStore for InMemoryRunHistory {
    async fn append(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .find(|record| record.run_id == run_id)
            .cloned())
    }

    async fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|record| record.created_at >= from && record.created_at <= to)
            .cloned()
            .collect())
    }
}

/// Run history persisted as one JSON file per run under a directory.
///
/// Files are named `run_<id>.json`, mirroring the layout callers already
/// expect from earlier versions of this system.
#[derive(Debug)]
pub struct JsonDirRunHistory {
    dir: PathBuf,
}

impl JsonDirRunHistory {
    /// Creates a history rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("run_{run_id}.json"))
    }
}

#[async_trait]
impl RunHistoryStore for JsonDirRunHistory {
    async fn append(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.run_id);
        let encoded = serde_json::to_vec_pretty(record)?;
        std::fs::write(&path, encoded)?;
        debug!(path = %path.display(), "persisted run record");
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn list_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RunRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("run_") || !name.ends_with(".json") {
                continue;
            }
            let raw = std::fs::read(entry.path())?;
            let record: RunRecord = serde_json::from_slice(&raw)?;
            if record.created_at >= from && record.created_at <= to {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}
