//! Structured-memory store (§4.9, Component I): typed observations an agent
//! writes and later recalls via `search`.

use chrono::Utc;
use thiserror::Error;

use crate::{
    embeddings::EmbeddingProvider,
    schema::StructuredMemoryDoc,
    search::SearchResult,
    store::MemoryStore,
};

pub const STRUCTURED_TYPES: &[&str] = &[
    "decision",
    "preference",
    "person",
    "todo",
    "fact",
    "project",
    "architecture",
    "custom",
];

const DEFAULT_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Error)]
pub enum StructuredMemoryError {
    #[error("unknown structured-memory type: {0}")]
    UnknownType(String),
    #[error("confidence {0} is outside the [0,1] range")]
    ConfidenceOutOfRange(f64),
}

#[derive(Debug, Clone)]
pub struct StructuredMemoryWrite {
    pub kind: String,
    pub key: String,
    pub value: String,
    pub context: Option<String>,
    pub confidence: Option<f64>,
    pub tags: Vec<String>,
    pub source: String,
    pub agent_id: String,
}

#[derive(Debug, Clone)]
pub struct StructuredMemoryWriteResult {
    pub upserted: bool,
    pub id: String,
}

/// Validates `write.kind` and `write.confidence` synchronously (§7 Integrity
/// errors reject without mutating state), embeds `value` best-effort, then
/// upserts by `(type, key, agentId)` (§3 I5: no duplicates for the same key).
pub async fn write_structured_memory(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    write: StructuredMemoryWrite,
) -> anyhow::Result<StructuredMemoryWriteResult> {
    if !STRUCTURED_TYPES.contains(&write.kind.as_str()) {
        return Err(StructuredMemoryError::UnknownType(write.kind).into());
    }
    let confidence = write.confidence.unwrap_or(DEFAULT_CONFIDENCE);
    if !(0.0..=1.0).contains(&confidence) {
        return Err(StructuredMemoryError::ConfidenceOutOfRange(confidence).into());
    }

    let id = StructuredMemoryDoc::compose_id(&write.kind, &write.key, &write.agent_id);
    let embedding = match embedder {
        Some(e) => e.embed(&write.value).await.ok(),
        None => None,
    };

    let now = Utc::now();
    let doc = StructuredMemoryDoc {
        id: id.clone(),
        kind: write.kind,
        key: write.key,
        agent_id: write.agent_id,
        value: write.value,
        context: write.context,
        confidence,
        source: write.source,
        tags: write.tags,
        embedding,
        created_at: now,
        updated_at: now,
    };

    let upserted = store.upsert_structured(&doc).await?;
    Ok(StructuredMemoryWriteResult { upserted, id })
}

/// Structured-memory contribution to `search` (§4.9): cosine-similarity
/// scored when a query vector is available, falling back to substring match
/// on `value`/`context` otherwise.
pub async fn search_structured(
    store: &dyn MemoryStore,
    agent_id: &str,
    query_vector: Option<&[f32]>,
    query_text: &str,
    limit: usize,
) -> anyhow::Result<Vec<SearchResult>> {
    store.search_structured(agent_id, query_vector, query_text, limit).await
}
