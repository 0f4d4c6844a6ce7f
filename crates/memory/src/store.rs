//! The storage seam: a `MemoryStore` trait covering every Mongo collection
//! operation the sync engine, search dispatcher, KB pipeline, and
//! structured-memory store need. `MongoStore` is the real backend;
//! `store_mock::MockStore` is an in-memory fake used by unit tests so
//! dispatch logic can be exercised without a live `mongod` (§10.4).

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    capability::is_transaction_unsupported_error,
    schema::{ChunkDoc, EmbeddingCacheDoc, FileDoc, KbChunkDoc, KbDocumentDoc, MetaDoc, StructuredMemoryDoc},
    search::SearchResult,
};

/// Which corpus a search/chunk operation targets. `chunks`/`kb_chunks` share
/// an identical shape; the scope just picks the collection and `source`
/// semantics (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Memory,
    Kb,
}

/// Outcome of an atomic per-file write (§4.5): whether the transactional
/// path was used, or the engine degraded to non-transactional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Transactional,
    Degraded,
}

/// Aggregate stats for `getKBStats()` (§4.8).
#[derive(Debug, Clone, Default)]
pub struct KbStats {
    pub documents: usize,
    pub chunks: usize,
    pub categories: Vec<String>,
    pub sources_by_type: std::collections::HashMap<String, usize>,
}

/// Coverage breakdown for the doctor probe (§4.12).
#[derive(Debug, Clone, Default)]
pub struct EmbeddingCoverage {
    pub success: usize,
    pub failed: usize,
    pub pending: usize,
    pub total: usize,
}

/// The storage seam every other component depends on. Implementors must be
/// `Send + Sync` so the manager can share one instance across background
/// tasks.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // ── files ────────────────────────────────────────────────────────────
    async fn get_file(&self, path: &str) -> anyhow::Result<Option<FileDoc>>;
    async fn list_files(&self, source: Option<&str>) -> anyhow::Result<Vec<FileDoc>>;
    async fn delete_file(&self, path: &str) -> anyhow::Result<()>;

    // ── chunks ───────────────────────────────────────────────────────────
    async fn delete_chunks_for_file(&self, path: &str) -> anyhow::Result<()>;
    async fn get_chunk_by_id(&self, scope: Scope, id: &str) -> anyhow::Result<Option<ChunkDoc>>;

    /// Atomically delete the old chunks for `file.path`, upsert the new
    /// ones, and upsert the file metadata row (§4.5's atomic per-file
    /// write). `allow_transaction` gates whether a transaction is even
    /// attempted; on a transaction-unsupported error the call degrades to
    /// non-transactional writes internally and reports that back via
    /// `WriteMode::Degraded` rather than failing.
    async fn atomic_write_file(
        &self,
        file: &FileDoc,
        chunks: &[ChunkDoc],
        allow_transaction: bool,
    ) -> anyhow::Result<WriteMode>;

    // ── search primitives ───────────────────────────────────────────────
    async fn vector_search(
        &self,
        scope: Scope,
        vector: &[f32],
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>>;

    async fn text_search(
        &self,
        scope: Scope,
        query: &str,
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>>;

    /// Server-side `$scoreFusion` (§4.7 tier 1). `Ok(None)` means the store
    /// doesn't implement this tier — the dispatcher falls through.
    async fn score_fusion_search(
        &self,
        _scope: Scope,
        _vector: &[f32],
        _query: &str,
        _k: usize,
        _vector_weight: f64,
        _text_weight: f64,
        _source_filter: Option<&str>,
    ) -> anyhow::Result<Option<Vec<SearchResult>>> {
        Ok(None)
    }

    /// Server-side `$rankFusion` (§4.7 tier 2). `Ok(None)` means the store
    /// doesn't implement this tier — the dispatcher falls through.
    async fn rank_fusion_search(
        &self,
        _scope: Scope,
        _vector: &[f32],
        _query: &str,
        _k: usize,
        _source_filter: Option<&str>,
    ) -> anyhow::Result<Option<Vec<SearchResult>>> {
        Ok(None)
    }

    // ── knowledge base ──────────────────────────────────────────────────
    async fn get_kb_document_by_hash(&self, content_hash: &str) -> anyhow::Result<Option<KbDocumentDoc>>;
    async fn insert_kb_document(&self, doc: &KbDocumentDoc) -> anyhow::Result<()>;
    async fn delete_kb_document(&self, id: &str) -> anyhow::Result<bool>;
    async fn upsert_kb_chunks(&self, chunks: &[KbChunkDoc]) -> anyhow::Result<()>;
    async fn delete_kb_chunks_for_doc(&self, doc_id: &str) -> anyhow::Result<()>;
    async fn list_kb_documents(
        &self,
        category: Option<&str>,
        tag: Option<&str>,
    ) -> anyhow::Result<Vec<KbDocumentDoc>>;
    async fn kb_stats(&self) -> anyhow::Result<KbStats>;

    // ── structured memory ───────────────────────────────────────────────
    /// Upserts by `(type, key, agentId)`. Returns `true` if a new row was
    /// inserted, `false` if an existing row was replaced in place.
    async fn upsert_structured(&self, doc: &StructuredMemoryDoc) -> anyhow::Result<bool>;
    async fn search_structured(
        &self,
        agent_id: &str,
        query_vector: Option<&[f32]>,
        query_text: &str,
        k: usize,
    ) -> anyhow::Result<Vec<SearchResult>>;

    // ── embedding cache ──────────────────────────────────────────────────
    async fn get_cached_embedding(&self, model: &str, text_hash: &str) -> anyhow::Result<Option<Vec<f32>>>;
    async fn put_cached_embedding(&self, model: &str, text_hash: &str, vector: &[f32]) -> anyhow::Result<()>;

    // ── meta ─────────────────────────────────────────────────────────────
    async fn get_meta(&self, agent_id: &str) -> anyhow::Result<Option<MetaDoc>>;
    async fn put_meta(&self, meta: &MetaDoc) -> anyhow::Result<()>;

    // ── doctor ───────────────────────────────────────────────────────────
    async fn embedding_coverage(&self) -> anyhow::Result<EmbeddingCoverage>;
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 for
/// mismatched or zero-magnitude vectors rather than panicking — used by both
/// the mock store and the client-side RRF path's score normalisation.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

pub mod mongo;
pub mod store_mock;

pub use mongo::MongoStore;
pub use store_mock::MockStore;

fn transaction_degraded(err: &anyhow::Error) -> bool {
    err.downcast_ref::<mongodb::error::Error>()
        .map(is_transaction_unsupported_error)
        .unwrap_or(false)
}
