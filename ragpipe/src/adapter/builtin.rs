//! Built-in deterministic adapters.
//!
//! These cover the default ingest and query pipelines without any external
//! model dependency: a sliding-window chunker, a hashing embedder, a
//! vector-store retriever, an extractive generator, and a lexical
//! evaluator. Real model-backed modules plug in through the same contract.

use super::{
    AdapterDescriptor, Capability, InvokeContext, ModuleAdapter, ValueShape,
};
use crate::errors::AdapterFailure;
use crate::stores::{ScoredDocument, VectorRecord, VectorStore};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_EMBEDDING_DIM: usize = 64;
const DEFAULT_CHUNK_SIZE: usize = 400;
const DEFAULT_CHUNK_OVERLAP: usize = 50;
const DEFAULT_TOP_K: usize = 5;
const DEFAULT_EVAL_THRESHOLD: f64 = 0.7;

/// Deterministic bag-of-tokens embedding.
///
/// Each lowercase token is hashed into one of `dim` buckets and the vector
/// is L2-normalized, so texts sharing vocabulary land near each other under
/// cosine similarity. Deterministic within a process, which is what the
/// built-in pipelines and tests need.
#[must_use]
pub fn hash_embedding(text: &str, dim: usize) -> Vec<f32> {
    let dim = dim.max(1);
    let mut vector = vec![0.0f32; dim];

    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        let bucket = (hasher.finish() % dim as u64) as usize;
        vector[bucket] += 1.0;
    }

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn token_f1(prediction: &str, reference: &str) -> f64 {
    let pred = tokens(prediction);
    let reference = tokens(reference);
    if pred.is_empty() || reference.is_empty() {
        return 0.0;
    }

    let mut reference_pool = reference.clone();
    let mut overlap = 0usize;
    for token in &pred {
        if let Some(pos) = reference_pool.iter().position(|t| t == token) {
            reference_pool.swap_remove(pos);
            overlap += 1;
        }
    }
    if overlap == 0 {
        return 0.0;
    }

    let precision = overlap as f64 / pred.len() as f64;
    let recall = overlap as f64 / reference.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, AdapterFailure> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterFailure::validation(format!("payload missing string field '{key}'")))
}

/// Normalizes the raw query into the pipeline's record payload.
#[derive(Debug, Default)]
pub struct PassthroughLoader;

impl PassthroughLoader {
    /// Creates the loader.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleAdapter for PassthroughLoader {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("passthrough", "0.1.0", Capability::Loader)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Text
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["query"])
    }

    async fn invoke(&self, payload: Value, _ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        let query = payload
            .as_str()
            .ok_or_else(|| AdapterFailure::validation("query payload must be a string"))?;
        let query = query.trim();
        if query.is_empty() {
            return Err(AdapterFailure::validation("query must not be empty"));
        }
        Ok(json!({ "query": query }))
    }
}

/// Embeds the query with the deterministic hashing embedder.
#[derive(Debug, Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    /// Creates the embedder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleAdapter for HashEmbedder {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("hash", "0.1.0", Capability::Embedder)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Object(&["query"])
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["query", "embedding"])
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        ctx.checkpoint()?;
        let query = require_str(&payload, "query")?;
        let dim = ctx
            .setting_usize("embedding_dim")
            .unwrap_or(DEFAULT_EMBEDDING_DIM);
        let embedding = hash_embedding(query, dim);

        Ok(json!({ "query": query, "embedding": embedding }))
    }
}

/// Retrieves the top-k contexts for an embedded query from a vector store.
#[derive(Debug)]
pub struct VectorRetriever {
    store: Arc<dyn VectorStore>,
}

impl VectorRetriever {
    /// Creates a retriever over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ModuleAdapter for VectorRetriever {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("vector", "0.1.0", Capability::Retriever)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Object(&["query", "embedding"])
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["query", "contexts"])
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        ctx.checkpoint()?;
        let query = require_str(&payload, "query")?.to_string();
        let embedding: Vec<f32> = payload
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| AdapterFailure::validation("payload missing 'embedding' array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let k = ctx.setting_usize("top_k").unwrap_or(DEFAULT_TOP_K);
        let contexts = self
            .store
            .query(&embedding, k)
            .await
            .map_err(|e| AdapterFailure::transient(format!("vector store query failed: {e}")))?;

        let contexts = serde_json::to_value(contexts)
            .map_err(|e| AdapterFailure::validation(format!("contexts not serializable: {e}")))?;
        Ok(json!({ "query": query, "contexts": contexts }))
    }
}

/// Produces an answer by extracting the best-scoring retrieved context.
#[derive(Debug, Default)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    /// Creates the generator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleAdapter for ExtractiveGenerator {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("extractive", "0.1.0", Capability::Generator)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Object(&["query", "contexts"])
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["query", "answer", "contexts"])
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        ctx.checkpoint()?;
        let query = require_str(&payload, "query")?.to_string();
        let contexts: Vec<ScoredDocument> = payload
            .get("contexts")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AdapterFailure::validation(format!("malformed contexts: {e}")))?
            .unwrap_or_default();

        let answer = contexts
            .first()
            .map_or_else(
                || "No relevant context was found for this query.".to_string(),
                |best| best.text.clone(),
            );

        Ok(json!({
            "query": query,
            "answer": answer,
            "contexts": payload.get("contexts").cloned().unwrap_or(Value::Array(Vec::new())),
        }))
    }
}

/// Scores an answer with lexical metrics.
///
/// Produces the metric dictionary shape downstream dashboards expect:
/// `exact_match`, `f1`, `answer_relevancy`, `overall_score`, `passed`.
#[derive(Debug, Default)]
pub struct LexicalEvaluator;

impl LexicalEvaluator {
    /// Creates the evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleAdapter for LexicalEvaluator {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("lexical", "0.1.0", Capability::Evaluator)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Object(&["query", "answer"])
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["evaluation"])
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        ctx.checkpoint()?;
        let query = require_str(&payload, "query")?;
        let answer = require_str(&payload, "answer")?;
        let ground_truth = payload.get("ground_truth").and_then(Value::as_str);
        let threshold = ctx
            .setting_f64("threshold")
            .unwrap_or(DEFAULT_EVAL_THRESHOLD);

        let answer_relevancy = token_f1(answer, query);
        let mut scores = vec![answer_relevancy];

        let mut evaluation = serde_json::Map::new();
        evaluation.insert("answer_relevancy".to_string(), json!(answer_relevancy));

        if let Some(truth) = ground_truth {
            let exact = if answer.trim().eq_ignore_ascii_case(truth.trim()) {
                1.0
            } else {
                0.0
            };
            let f1 = token_f1(answer, truth);
            scores.push(exact);
            scores.push(f1);
            evaluation.insert("exact_match".to_string(), json!(exact));
            evaluation.insert("f1".to_string(), json!(f1));
        }

        let overall = scores.iter().sum::<f64>() / scores.len() as f64;
        evaluation.insert("overall_score".to_string(), json!(overall));
        evaluation.insert("passed".to_string(), json!(overall >= threshold));

        Ok(json!({ "evaluation": evaluation }))
    }
}

/// Splits document text into overlapping sliding windows.
#[derive(Debug, Default)]
pub struct ChunkAdapter;

impl ChunkAdapter {
    /// Creates the chunker.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Sliding-window chunking over characters.
fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[async_trait]
impl ModuleAdapter for ChunkAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("chunk", "0.1.0", Capability::Custom)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Object(&["text"])
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["chunks"])
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        ctx.checkpoint()?;
        let text = require_str(&payload, "text")?;
        if text.trim().is_empty() {
            return Err(AdapterFailure::validation("document text must not be empty"));
        }
        let metadata = payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let chunk_size = ctx.setting_usize("chunk_size").unwrap_or(DEFAULT_CHUNK_SIZE);
        let overlap = ctx
            .setting_usize("chunk_overlap")
            .unwrap_or(DEFAULT_CHUNK_OVERLAP)
            .min(chunk_size.saturating_sub(1));

        let pieces = chunk_text(text, chunk_size, overlap);
        let total = pieces.len();
        let chunks: Vec<Value> = pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| {
                let mut meta = metadata.clone();
                meta.insert("chunk_index".to_string(), json!(index));
                meta.insert("total_chunks".to_string(), json!(total));
                json!({ "text": piece, "metadata": meta })
            })
            .collect();

        Ok(json!({ "chunks": chunks }))
    }
}

/// Embeds chunks and stores them in the vector store.
///
/// This is the "embed-and-store" unit of the ingest pipeline: one pluggable
/// adapter owning both halves, so a backend can batch them however it likes.
#[derive(Debug)]
pub struct IndexAdapter {
    store: Arc<dyn VectorStore>,
}

impl IndexAdapter {
    /// Creates an indexer over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ModuleAdapter for IndexAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("index", "0.1.0", Capability::Custom)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Object(&["chunks"])
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["indexed"])
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        let chunks = payload
            .get("chunks")
            .and_then(Value::as_array)
            .ok_or_else(|| AdapterFailure::validation("payload missing 'chunks' array"))?;
        let dim = ctx
            .setting_usize("embedding_dim")
            .unwrap_or(DEFAULT_EMBEDDING_DIM);

        let mut records = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ctx.checkpoint()?;
            let text = require_str(chunk, "text")?;
            let metadata = chunk
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            records.push(VectorRecord {
                id: Uuid::new_v4().to_string(),
                text: text.to_string(),
                embedding: hash_embedding(text, dim),
                metadata,
            });
        }

        let indexed = records.len();
        self.store
            .put(records)
            .await
            .map_err(|e| AdapterFailure::transient(format!("vector store put failed: {e}")))?;

        Ok(json!({ "indexed": indexed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StageSettings;
    use crate::cancellation::CancellationToken;
    use crate::stores::InMemoryVectorStore;
    use std::time::{Duration, Instant};

    fn ctx() -> InvokeContext {
        ctx_with(StageSettings::new())
    }

    fn ctx_with(settings: StageSettings) -> InvokeContext {
        InvokeContext::new(
            "run-1",
            "stage",
            1,
            Instant::now() + Duration::from_secs(5),
            Arc::new(CancellationToken::new()),
            Arc::new(settings),
        )
    }

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let a = hash_embedding("the quick brown fox", 32);
        let b = hash_embedding("the quick brown fox", 32);
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_embed_closer_than_unrelated() {
        let dim = 64;
        let query = hash_embedding("rust borrow checker", dim);
        let related = hash_embedding("the rust borrow checker enforces ownership", dim);
        let unrelated = hash_embedding("banana smoothie recipe with yogurt", dim);

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[test]
    fn chunking_covers_text_with_overlap() {
        let text = "a".repeat(1000);
        let chunks = chunk_text(&text, 400, 50);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 400));
        let covered: usize = chunks.iter().map(|c| c.chars().count()).sum();
        // Overlap means total chunk characters exceed the source length.
        assert!(covered >= 1000);
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("short", 400, 50), vec!["short".to_string()]);
    }

    #[test]
    fn token_f1_exact_and_disjoint() {
        assert!((token_f1("a b c", "a b c") - 1.0).abs() < 1e-9);
        assert_eq!(token_f1("a b c", "x y z"), 0.0);
        assert_eq!(token_f1("", "a"), 0.0);
    }

    #[tokio::test]
    async fn loader_rejects_empty_query() {
        let loader = PassthroughLoader::new();
        let err = loader.invoke(json!("   "), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::Validation);

        let err = loader.invoke(json!(42), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::FailureKind::Validation);
    }

    #[tokio::test]
    async fn embedder_adds_embedding() {
        let loader_out = json!({ "query": "hello world" });
        let embedder = HashEmbedder::new();
        let out = embedder.invoke(loader_out, &ctx()).await.unwrap();

        assert_eq!(out["query"], "hello world");
        assert_eq!(out["embedding"].as_array().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn retriever_returns_top_k() {
        let store = Arc::new(InMemoryVectorStore::new());
        let index = IndexAdapter::new(store.clone());
        index
            .invoke(
                json!({ "chunks": [
                    { "text": "rust is a systems language" },
                    { "text": "python is a scripting language" },
                    { "text": "the weather is sunny today" },
                ]}),
                &ctx(),
            )
            .await
            .unwrap();

        let mut settings = StageSettings::new();
        settings.insert("top_k".to_string(), json!(2));

        let retriever = VectorRetriever::new(store);
        let embedding = hash_embedding("rust language", DEFAULT_EMBEDDING_DIM);
        let out = retriever
            .invoke(
                json!({ "query": "rust language", "embedding": embedding }),
                &ctx_with(settings),
            )
            .await
            .unwrap();

        let contexts = out["contexts"].as_array().unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts[0]["text"].as_str().unwrap().contains("rust"));
    }

    #[tokio::test]
    async fn generator_extracts_best_context() {
        let generator = ExtractiveGenerator::new();
        let out = generator
            .invoke(
                json!({
                    "query": "q",
                    "contexts": [
                        { "text": "best", "score": 0.9, "metadata": {} },
                        { "text": "worse", "score": 0.4, "metadata": {} },
                    ],
                }),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(out["answer"], "best");
    }

    #[tokio::test]
    async fn generator_handles_no_contexts() {
        let generator = ExtractiveGenerator::new();
        let out = generator
            .invoke(json!({ "query": "q", "contexts": [] }), &ctx())
            .await
            .unwrap();
        assert!(out["answer"].as_str().unwrap().contains("No relevant context"));
    }

    #[tokio::test]
    async fn evaluator_scores_exact_answer() {
        let evaluator = LexicalEvaluator::new();
        let out = evaluator
            .invoke(
                json!({
                    "query": "what is rust",
                    "answer": "rust is a language",
                    "ground_truth": "rust is a language",
                }),
                &ctx(),
            )
            .await
            .unwrap();

        let evaluation = out["evaluation"].as_object().unwrap();
        assert_eq!(evaluation["exact_match"], json!(1.0));
        assert_eq!(evaluation["f1"], json!(1.0));
        assert_eq!(evaluation["passed"], json!(true));
    }

    #[tokio::test]
    async fn chunker_attaches_chunk_metadata() {
        let mut settings = StageSettings::new();
        settings.insert("chunk_size".to_string(), json!(10));
        settings.insert("chunk_overlap".to_string(), json!(2));

        let chunker = ChunkAdapter::new();
        let out = chunker
            .invoke(
                json!({ "text": "abcdefghijklmnopqrstuvwxyz", "metadata": { "source": "test" } }),
                &ctx_with(settings),
            )
            .await
            .unwrap();

        let chunks = out["chunks"].as_array().unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0]["metadata"]["chunk_index"], json!(0));
        assert_eq!(chunks[0]["metadata"]["source"], json!("test"));
        assert_eq!(
            chunks[0]["metadata"]["total_chunks"],
            json!(chunks.len())
        );
    }
}
