//! In-memory `MemoryStore` used by unit tests (§10.4) so the sync engine,
//! search dispatcher, and KB pipeline can be exercised without a live
//! `mongod`. Deliberately simple: linear scans, no indexes, no durability.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    schema::{ChunkDoc, EmbeddingCacheDoc, FileDoc, KbChunkDoc, KbDocumentDoc, MetaDoc, StructuredMemoryDoc},
    search::SearchResult,
    store::{cosine_similarity, EmbeddingCoverage, KbStats, MemoryStore, Scope, WriteMode},
};

#[derive(Default)]
pub struct MockStore {
    files: Mutex<HashMap<String, FileDoc>>,
    chunks: Mutex<HashMap<String, ChunkDoc>>,
    kb_chunks: Mutex<HashMap<String, KbChunkDoc>>,
    kb_documents: Mutex<HashMap<String, KbDocumentDoc>>,
    structured: Mutex<HashMap<String, StructuredMemoryDoc>>,
    embedding_cache: Mutex<HashMap<String, Vec<f32>>>,
    meta: Mutex<HashMap<String, MetaDoc>>,
    /// Simulates a FullStack deployment's `$scoreFusion`/`$rankFusion`
    /// support. Off by default so tests exercise the client-side RRF path
    /// unless they opt in.
    supports_fusion: bool,
    /// Simulates whether the underlying "deployment" supports transactions.
    supports_transactions: Mutex<bool>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            supports_transactions: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn with_fusion_support(mut self) -> Self {
        self.supports_fusion = true;
        self
    }

    pub fn without_transaction_support(self) -> Self {
        *self.supports_transactions.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn insert_chunk_for_test(&self, chunk: ChunkDoc) {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).insert(chunk.id.clone(), chunk);
    }

    fn score_text(text: &str, query: &str) -> f32 {
        let text_lower = text.to_lowercase();
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return 0.0;
        }
        let hits = terms.iter().filter(|t| text_lower.contains(*t)).count();
        hits as f32 / terms.len() as f32
    }
}

#[async_trait]
impl MemoryStore for MockStore {
    async fn get_file(&self, path: &str) -> anyhow::Result<Option<FileDoc>> {
        Ok(self.files.lock().unwrap_or_else(|e| e.into_inner()).get(path).cloned())
    }

    async fn list_files(&self, source: Option<&str>) -> anyhow::Result<Vec<FileDoc>> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        Ok(files
            .values()
            .filter(|f| source.map(|s| f.source == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn delete_file(&self, path: &str) -> anyhow::Result<()> {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
        Ok(())
    }

    async fn delete_chunks_for_file(&self, path: &str) -> anyhow::Result<()> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).retain(|_, c| c.path != path);
        Ok(())
    }

    async fn get_chunk_by_id(&self, scope: Scope, id: &str) -> anyhow::Result<Option<ChunkDoc>> {
        match scope {
            Scope::Memory => Ok(self.chunks.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()),
            Scope::Kb => Ok(self
                .kb_chunks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(id)
                .map(|k| ChunkDoc {
                    id: k.id.clone(),
                    path: k.doc_id.clone(),
                    source: "kb".to_string(),
                    start_line: k.start_line,
                    end_line: k.end_line,
                    text: k.text.clone(),
                    hash: k.hash.clone(),
                    embedding: k.embedding.clone(),
                    embedding_status: k.embedding_status.clone(),
                    embedding_model: k.embedding_model.clone(),
                    updated_at: k.updated_at,
                })),
        }
    }

    async fn atomic_write_file(
        &self,
        file: &FileDoc,
        chunks: &[ChunkDoc],
        allow_transaction: bool,
    ) -> anyhow::Result<WriteMode> {
        let supports_txn = *self.supports_transactions.lock().unwrap_or_else(|e| e.into_inner());
        self.delete_chunks_for_file(&file.path).await?;
        {
            let mut store = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
            for chunk in chunks {
                store.insert(chunk.id.clone(), chunk.clone());
            }
        }
        self.files.lock().unwrap_or_else(|e| e.into_inner()).insert(file.path.clone(), file.clone());

        if allow_transaction && supports_txn {
            Ok(WriteMode::Transactional)
        } else {
            Ok(WriteMode::Degraded)
        }
    }

    async fn vector_search(
        &self,
        scope: Scope,
        vector: &[f32],
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let mut out = match scope {
            Scope::Memory => {
                let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
                chunks
                    .values()
                    .filter(|c| source_filter.map(|s| c.source == s).unwrap_or(true))
                    .filter_map(|c| {
                        let embedding = c.embedding.as_ref()?;
                        let score = cosine_similarity(vector, embedding);
                        Some(SearchResult {
                            chunk_id: c.id.clone(),
                            path: c.path.clone(),
                            source: c.source.clone(),
                            start_line: c.start_line,
                            end_line: c.end_line,
                            score,
                            text: c.text.clone(),
                        })
                    })
                    .collect::<Vec<_>>()
            },
            Scope::Kb => {
                let chunks = self.kb_chunks.lock().unwrap_or_else(|e| e.into_inner());
                chunks
                    .values()
                    .filter_map(|c| {
                        let embedding = c.embedding.as_ref()?;
                        let score = cosine_similarity(vector, embedding);
                        Some(SearchResult {
                            chunk_id: c.id.clone(),
                            path: c.doc_id.clone(),
                            source: "kb".to_string(),
                            start_line: c.start_line,
                            end_line: c.end_line,
                            score,
                            text: c.text.clone(),
                        })
                    })
                    .collect::<Vec<_>>()
            },
        };
        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(k);
        Ok(out)
    }

    async fn text_search(
        &self,
        scope: Scope,
        query: &str,
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let mut out = match scope {
            Scope::Memory => {
                let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
                chunks
                    .values()
                    .filter(|c| source_filter.map(|s| c.source == s).unwrap_or(true))
                    .map(|c| (Self::score_text(&c.text, query), c))
                    .filter(|(score, _)| *score > 0.0)
                    .map(|(score, c)| SearchResult {
                        chunk_id: c.id.clone(),
                        path: c.path.clone(),
                        source: c.source.clone(),
                        start_line: c.start_line,
                        end_line: c.end_line,
                        score,
                        text: c.text.clone(),
                    })
                    .collect::<Vec<_>>()
            },
            Scope::Kb => {
                let chunks = self.kb_chunks.lock().unwrap_or_else(|e| e.into_inner());
                chunks
                    .values()
                    .map(|c| (Self::score_text(&c.text, query), c))
                    .filter(|(score, _)| *score > 0.0)
                    .map(|(score, c)| SearchResult {
                        chunk_id: c.id.clone(),
                        path: c.doc_id.clone(),
                        source: "kb".to_string(),
                        start_line: c.start_line,
                        end_line: c.end_line,
                        score,
                        text: c.text.clone(),
                    })
                    .collect::<Vec<_>>()
            },
        };
        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(k);
        Ok(out)
    }

    async fn score_fusion_search(
        &self,
        scope: Scope,
        vector: &[f32],
        query: &str,
        k: usize,
        vector_weight: f64,
        text_weight: f64,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Option<Vec<SearchResult>>> {
        if !self.supports_fusion {
            return Ok(None);
        }
        let vec_results = self.vector_search(scope, vector, k * 3, source_filter).await?;
        let text_results = self.text_search(scope, query, k * 3, source_filter).await?;
        let mut combined: HashMap<String, (f32, SearchResult)> = HashMap::new();
        for r in vec_results {
            let entry = combined.entry(r.chunk_id.clone()).or_insert((0.0, r.clone()));
            entry.0 += r.score * vector_weight as f32;
        }
        for r in text_results {
            let entry = combined.entry(r.chunk_id.clone()).or_insert((0.0, r.clone()));
            entry.0 += r.score * text_weight as f32;
        }
        let mut out: Vec<SearchResult> = combined
            .into_values()
            .map(|(score, mut r)| {
                r.score = score;
                r
            })
            .collect();
        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(k);
        Ok(Some(out))
    }

    async fn rank_fusion_search(
        &self,
        scope: Scope,
        vector: &[f32],
        query: &str,
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Option<Vec<SearchResult>>> {
        if !self.supports_fusion {
            return Ok(None);
        }
        // Reciprocal-rank style combination, same shape as `$rankFusion`'s raw
        // (un-normalized) output — the dispatcher normalizes this tier itself.
        let vec_results = self.vector_search(scope, vector, k * 3, source_filter).await?;
        let text_results = self.text_search(scope, query, k * 3, source_filter).await?;
        Ok(Some(raw_reciprocal_rank_fusion(&[vec_results, text_results], k)))
    }

    async fn get_kb_document_by_hash(&self, content_hash: &str) -> anyhow::Result<Option<KbDocumentDoc>> {
        Ok(self
            .kb_documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|d| d.content_hash == content_hash)
            .cloned())
    }

    async fn insert_kb_document(&self, doc: &KbDocumentDoc) -> anyhow::Result<()> {
        self.kb_documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete_kb_document(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.kb_documents.lock().unwrap_or_else(|e| e.into_inner()).remove(id).is_some())
    }

    async fn upsert_kb_chunks(&self, chunks: &[KbChunkDoc]) -> anyhow::Result<()> {
        let mut store = self.kb_chunks.lock().unwrap_or_else(|e| e.into_inner());
        for chunk in chunks {
            store.insert(chunk.id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn delete_kb_chunks_for_doc(&self, doc_id: &str) -> anyhow::Result<()> {
        self.kb_chunks.lock().unwrap_or_else(|e| e.into_inner()).retain(|_, c| c.doc_id != doc_id);
        Ok(())
    }

    async fn list_kb_documents(
        &self,
        category: Option<&str>,
        tag: Option<&str>,
    ) -> anyhow::Result<Vec<KbDocumentDoc>> {
        let docs = self.kb_documents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs
            .values()
            .filter(|d| category.map(|c| d.category.as_deref() == Some(c)).unwrap_or(true))
            .filter(|d| tag.map(|t| d.tags.iter().any(|dt| dt == t)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn kb_stats(&self) -> anyhow::Result<KbStats> {
        let docs = self.kb_documents.lock().unwrap_or_else(|e| e.into_inner());
        let chunks = self.kb_chunks.lock().unwrap_or_else(|e| e.into_inner());
        let mut categories = Vec::new();
        let mut sources_by_type = HashMap::new();
        for d in docs.values() {
            if let Some(c) = &d.category {
                if !categories.contains(c) {
                    categories.push(c.clone());
                }
            }
            *sources_by_type.entry(d.importer.clone()).or_insert(0) += 1;
        }
        Ok(KbStats {
            documents: docs.len(),
            chunks: chunks.len(),
            categories,
            sources_by_type,
        })
    }

    async fn upsert_structured(&self, doc: &StructuredMemoryDoc) -> anyhow::Result<bool> {
        let mut store = self.structured.lock().unwrap_or_else(|e| e.into_inner());
        let is_new = !store.contains_key(&doc.id);
        store.insert(doc.id.clone(), doc.clone());
        Ok(is_new)
    }

    async fn search_structured(
        &self,
        agent_id: &str,
        query_vector: Option<&[f32]>,
        query_text: &str,
        k: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let store = self.structured.lock().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(f32, StructuredMemoryDoc)> = store
            .values()
            .filter(|m| m.agent_id == agent_id)
            .map(|m| {
                let lexical = Self::score_text(&m.value, query_text);
                let semantic = match (query_vector, &m.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => 0.0,
                };
                (
                    crate::search::normalize_score(lexical.max(semantic), crate::search::ScoreKind::Cosine),
                    m.clone(),
                )
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(score, m)| SearchResult {
                chunk_id: m.id,
                path: m.key,
                source: format!("structured:{}", m.kind),
                start_line: 0,
                end_line: 0,
                score,
                text: m.value,
            })
            .collect())
    }

    async fn get_cached_embedding(&self, model: &str, text_hash: &str) -> anyhow::Result<Option<Vec<f32>>> {
        let id = EmbeddingCacheDoc::compose_id(model, text_hash);
        Ok(self.embedding_cache.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned())
    }

    async fn put_cached_embedding(&self, model: &str, text_hash: &str, vector: &[f32]) -> anyhow::Result<()> {
        let id = EmbeddingCacheDoc::compose_id(model, text_hash);
        self.embedding_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, vector.to_vec());
        Ok(())
    }

    async fn get_meta(&self, agent_id: &str) -> anyhow::Result<Option<MetaDoc>> {
        Ok(self.meta.lock().unwrap_or_else(|e| e.into_inner()).get(agent_id).cloned())
    }

    async fn put_meta(&self, meta: &MetaDoc) -> anyhow::Result<()> {
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meta.agent_id.clone(), meta.clone());
        Ok(())
    }

    async fn embedding_coverage(&self) -> anyhow::Result<EmbeddingCoverage> {
        let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        let total = chunks.len();
        let success = chunks.values().filter(|c| c.embedding_status == "success").count();
        let failed = chunks.values().filter(|c| c.embedding_status == "failed").count();
        let pending = total.saturating_sub(success).saturating_sub(failed);
        Ok(EmbeddingCoverage {
            success,
            failed,
            pending,
            total,
        })
    }
}

/// Raw (un-normalized) reciprocal rank fusion, same `k` as
/// `search::reciprocal_rank_fusion`, standing in for `$rankFusion`'s raw
/// server-side score so the dispatcher's own `ScoreKind::Rrf` normalization
/// can be exercised against a tier that hasn't already normalized it.
fn raw_reciprocal_rank_fusion(result_lists: &[Vec<SearchResult>], limit: usize) -> Vec<SearchResult> {
    const K: f64 = 60.0;
    let mut scores: HashMap<String, (f64, SearchResult)> = HashMap::new();
    for list in result_lists {
        for (rank, result) in list.iter().enumerate() {
            let contribution = 1.0 / (K + (rank + 1) as f64);
            let entry = scores.entry(result.chunk_id.clone()).or_insert((0.0, result.clone()));
            entry.0 += contribution;
        }
    }
    let mut merged: Vec<SearchResult> = scores
        .into_values()
        .map(|(score, mut r)| {
            r.score = score as f32;
            r
        })
        .collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    merged
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn make_chunk(id: &str, path: &str, text: &str, embedding: Vec<f32>) -> ChunkDoc {
        ChunkDoc {
            id: id.to_string(),
            path: path.to_string(),
            source: "memory".to_string(),
            start_line: 1,
            end_line: 5,
            text: text.to_string(),
            hash: "h".to_string(),
            embedding: Some(embedding),
            embedding_status: "success".to_string(),
            embedding_model: "test".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn vector_search_ranks_by_cosine_similarity() {
        let store = MockStore::new();
        store.insert_chunk_for_test(make_chunk("a", "a.md", "alpha", vec![1.0, 0.0]));
        store.insert_chunk_for_test(make_chunk("b", "b.md", "beta", vec![0.0, 1.0]));

        let results = store
            .vector_search(Scope::Memory, &[1.0, 0.0], 2, None)
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "a");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn text_search_filters_out_zero_score_results() {
        let store = MockStore::new();
        store.insert_chunk_for_test(make_chunk("a", "a.md", "mongo driver setup", vec![1.0, 0.0]));
        store.insert_chunk_for_test(make_chunk("b", "b.md", "completely unrelated", vec![0.0, 1.0]));

        let results = store.text_search(Scope::Memory, "mongo driver", 10, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn fusion_tiers_report_unsupported_by_default() {
        let store = MockStore::new();
        let result = store
            .score_fusion_search(Scope::Memory, &[1.0, 0.0], "q", 5, 0.7, 0.3, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn fusion_tiers_available_when_enabled() {
        let store = MockStore::new().with_fusion_support();
        store.insert_chunk_for_test(make_chunk("a", "a.md", "mongo vector search", vec![1.0, 0.0]));
        let result = store
            .score_fusion_search(Scope::Memory, &[1.0, 0.0], "mongo", 5, 0.7, 0.3, None)
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn atomic_write_degrades_when_transactions_unsupported() {
        let store = MockStore::new().without_transaction_support();
        let file = FileDoc {
            path: "a.md".to_string(),
            source: "memory".to_string(),
            hash: "h".to_string(),
            mtime: 0,
            size: 0,
            updated_at: Utc::now(),
        };
        let mode = store.atomic_write_file(&file, &[], true).await.unwrap();
        assert_eq!(mode, WriteMode::Degraded);
    }
}
