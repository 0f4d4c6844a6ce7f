//! The real `MemoryStore` backend: one `mongodb::Database` handle and the
//! collection names resolved from config (§4.2's `collectionPrefix`).

use bson::{doc, Bson, Document};
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::{options::FindOptions, ClientSession, Database};

use async_trait::async_trait;
use moltis_config::MemoryConfig;
use tracing::{debug, warn};

use crate::{
    schema::{ChunkDoc, EmbeddingCacheDoc, FileDoc, KbChunkDoc, KbDocumentDoc, MetaDoc, StructuredMemoryDoc},
    search::{normalize_score, ScoreKind, SearchResult},
    store::{cosine_similarity, transaction_degraded, EmbeddingCoverage, KbStats, MemoryStore, Scope, WriteMode},
};

pub struct MongoStore {
    db: Database,
    files: String,
    chunks: String,
    kb_documents: String,
    kb_chunks: String,
    structured_memory: String,
    embedding_cache: String,
    meta: String,
    /// Approx-NN candidate pool for `$vectorSearch` (§6 `numCandidates`),
    /// clamped to 10,000 (§8 boundary behavior).
    num_candidates: usize,
}

impl MongoStore {
    pub fn new(db: Database, config: &MemoryConfig) -> Self {
        Self {
            files: config.collection_name("files"),
            chunks: config.collection_name("chunks"),
            kb_documents: config.collection_name("kb_documents"),
            kb_chunks: config.collection_name("kb_chunks"),
            structured_memory: config.collection_name("structured_memory"),
            embedding_cache: config.collection_name("embedding_cache"),
            meta: config.collection_name("meta"),
            num_candidates: config.num_candidates.min(10_000),
            db,
        }
    }

    /// The candidate pool to request for a `$vectorSearch` returning `k`
    /// results: the configured `numCandidates`, widened to never undercut
    /// the caller's own result limit.
    fn vector_search_candidates(&self, k: usize) -> i64 {
        self.num_candidates.max(k) as i64
    }

    fn collection_name(&self, scope: Scope) -> &str {
        match scope {
            Scope::Memory => &self.chunks,
            Scope::Kb => &self.kb_chunks,
        }
    }

    fn files_coll(&self) -> mongodb::Collection<FileDoc> {
        self.db.collection(&self.files)
    }

    fn chunks_coll(&self, scope: Scope) -> mongodb::Collection<Document> {
        self.db.collection(self.collection_name(scope))
    }

    fn kb_documents_coll(&self) -> mongodb::Collection<KbDocumentDoc> {
        self.db.collection(&self.kb_documents)
    }

    fn structured_coll(&self) -> mongodb::Collection<StructuredMemoryDoc> {
        self.db.collection(&self.structured_memory)
    }

    fn embedding_cache_coll(&self) -> mongodb::Collection<EmbeddingCacheDoc> {
        self.db.collection(&self.embedding_cache)
    }

    fn meta_coll(&self) -> mongodb::Collection<MetaDoc> {
        self.db.collection(&self.meta)
    }

    /// Non-transactional fallback for `atomic_write_file`: best-effort, no
    /// rollback if the process dies mid-way. The sync engine re-derives
    /// chunk state from the filesystem on the next run, so a partial write
    /// here is self-healing rather than catastrophic.
    async fn write_file_plain(&self, file: &FileDoc, chunks: &[ChunkDoc]) -> anyhow::Result<()> {
        self.chunks_coll(Scope::Memory)
            .delete_many(doc! { "path": &file.path })
            .await?;
        if !chunks.is_empty() {
            let docs: Vec<Document> = chunks
                .iter()
                .map(bson::to_document)
                .collect::<Result<_, _>>()?;
            self.chunks_coll(Scope::Memory).insert_many(docs).await?;
        }
        self.files_coll()
            .replace_one(doc! { "_id": &file.path }, file)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn write_file_txn(
        &self,
        session: &mut ClientSession,
        file: &FileDoc,
        chunks: &[ChunkDoc],
    ) -> anyhow::Result<()> {
        self.chunks_coll(Scope::Memory)
            .delete_many(doc! { "path": &file.path })
            .session(&mut *session)
            .await?;
        if !chunks.is_empty() {
            let docs: Vec<Document> = chunks
                .iter()
                .map(bson::to_document)
                .collect::<Result<_, _>>()?;
            self.chunks_coll(Scope::Memory)
                .insert_many(docs)
                .session(&mut *session)
                .await?;
        }
        self.files_coll()
            .replace_one(doc! { "_id": &file.path }, file)
            .upsert(true)
            .session(&mut *session)
            .await?;
        Ok(())
    }

    fn doc_to_result(scope: Scope, doc: &Document, score: f32) -> Option<SearchResult> {
        let id = doc.get_str("_id").ok()?.to_string();
        let (path, source) = match scope {
            Scope::Memory => (
                doc.get_str("path").unwrap_or_default().to_string(),
                doc.get_str("source").unwrap_or_default().to_string(),
            ),
            Scope::Kb => (
                doc.get_str("docId").unwrap_or_default().to_string(),
                "kb".to_string(),
            ),
        };
        Some(SearchResult {
            chunk_id: id,
            path,
            source,
            start_line: doc.get_i64("startLine").unwrap_or(0),
            end_line: doc.get_i64("endLine").unwrap_or(0),
            score,
            text: doc.get_str("text").unwrap_or_default().to_string(),
        })
    }
}

#[async_trait]
impl MemoryStore for MongoStore {
    async fn get_file(&self, path: &str) -> anyhow::Result<Option<FileDoc>> {
        Ok(self.files_coll().find_one(doc! { "_id": path }).await?)
    }

    async fn list_files(&self, source: Option<&str>) -> anyhow::Result<Vec<FileDoc>> {
        let filter = match source {
            Some(s) => doc! { "source": s },
            None => doc! {},
        };
        let cursor = self.files_coll().find(filter).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn delete_file(&self, path: &str) -> anyhow::Result<()> {
        self.files_coll().delete_one(doc! { "_id": path }).await?;
        Ok(())
    }

    async fn delete_chunks_for_file(&self, path: &str) -> anyhow::Result<()> {
        self.chunks_coll(Scope::Memory)
            .delete_many(doc! { "path": path })
            .await?;
        Ok(())
    }

    async fn get_chunk_by_id(&self, scope: Scope, id: &str) -> anyhow::Result<Option<ChunkDoc>> {
        let doc = self
            .chunks_coll(scope)
            .find_one(doc! { "_id": id })
            .await?;
        Ok(doc.map(bson::from_document).transpose()?)
    }

    async fn atomic_write_file(
        &self,
        file: &FileDoc,
        chunks: &[ChunkDoc],
        allow_transaction: bool,
    ) -> anyhow::Result<WriteMode> {
        if !allow_transaction {
            self.write_file_plain(file, chunks).await?;
            return Ok(WriteMode::Degraded);
        }

        let mut session = self.db.client().start_session().await?;
        session.start_transaction().await?;
        let result = self.write_file_txn(&mut session, file, chunks).await;
        match result {
            Ok(()) => {
                session.commit_transaction().await?;
                Ok(WriteMode::Transactional)
            },
            Err(e) if transaction_degraded(&e) => {
                let _ = session.abort_transaction().await;
                warn!("transactions unsupported on this deployment, degrading to plain writes");
                self.write_file_plain(file, chunks).await?;
                Ok(WriteMode::Degraded)
            },
            Err(e) => {
                let _ = session.abort_transaction().await;
                Err(e)
            },
        }
    }

    async fn vector_search(
        &self,
        scope: Scope,
        vector: &[f32],
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let mut vector_search_stage = doc! {
            "index": match scope { Scope::Memory => "chunk_vector_idx", Scope::Kb => "kb_chunk_vector_idx" },
            "path": "embedding",
            "queryVector": vector.iter().map(|v| Bson::Double(*v as f64)).collect::<Vec<_>>(),
            "numCandidates": self.vector_search_candidates(k),
            "limit": k as i64,
        };
        if let Some(source) = source_filter {
            vector_search_stage.insert("filter", doc! { "source": source });
        }

        let pipeline = vec![
            doc! { "$vectorSearch": vector_search_stage },
            doc! { "$addFields": { "score": { "$meta": "vectorSearchScore" } } },
        ];

        let mut cursor = self.chunks_coll(scope).aggregate(pipeline).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let score = doc.get_f64("score").unwrap_or(0.0) as f32;
            if let Some(r) = Self::doc_to_result(scope, &doc, score) {
                out.push(r);
            }
        }
        Ok(out)
    }

    async fn text_search(
        &self,
        scope: Scope,
        query: &str,
        k: usize,
        source_filter: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let mut filter = doc! { "$text": { "$search": query } };
        if let Some(source) = source_filter {
            filter.insert("source", source);
        }
        let options = FindOptions::builder()
            .projection(doc! { "score": { "$meta": "textScore" } })
            .sort(doc! { "score": { "$meta": "textScore" } })
            .limit(k as i64)
            .build();

        let mut cursor = self
            .chunks_coll(scope)
            .find(filter)
            .with_options(options)
            .await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let score = doc.get_f64("score").unwrap_or(0.0) as f32;
            if let Some(r) = Self::doc_to_result(scope, &doc, score) {
                out.push(r);
            }
        }
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
        let index_name = match scope {
            Scope::Memory => "chunk_vector_idx",
            Scope::Kb => "kb_chunk_vector_idx",
        };
        let text_index_name = match scope {
            Scope::Memory => "chunk_text_fts",
            Scope::Kb => "kb_chunk_text_fts",
        };

        let mut vector_pipeline = vec![doc! {
            "$vectorSearch": {
                "index": index_name,
                "path": "embedding",
                "queryVector": vector.iter().map(|v| Bson::Double(*v as f64)).collect::<Vec<_>>(),
                "numCandidates": self.vector_search_candidates(k),
                "limit": k as i64,
            }
        }];
        let mut text_pipeline = vec![
            doc! {
                "$search": {
                    "index": text_index_name,
                    "text": { "query": query, "path": "text" }
                }
            },
            doc! { "$limit": k as i64 },
        ];
        if let Some(source) = source_filter {
            vector_pipeline.push(doc! { "$match": { "source": source } });
            text_pipeline.push(doc! { "$match": { "source": source } });
        }

        let pipeline = vec![doc! {
            "$scoreFusion": {
                "input": {
                    "pipelines": {
                        "vector": vector_pipeline,
                        "text": text_pipeline,
                    },
                    "normalization": "sigmoid",
                },
                "combination": {
                    "weights": { "vector": vector_weight, "text": text_weight }
                },
                "scoreDetails": false,
            }
        }];

        let mut cursor = match self.chunks_coll(scope).aggregate(pipeline).await {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "scoreFusion unavailable, dispatcher will fall back");
                return Ok(None);
            },
        };
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let score = doc.get_f64("score").unwrap_or(0.0) as f32;
            if let Some(r) = Self::doc_to_result(scope, &doc, score) {
                out.push(r);
            }
        }
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
        let index_name = match scope {
            Scope::Memory => "chunk_vector_idx",
            Scope::Kb => "kb_chunk_vector_idx",
        };
        let text_index_name = match scope {
            Scope::Memory => "chunk_text_fts",
            Scope::Kb => "kb_chunk_text_fts",
        };

        let mut vector_pipeline = vec![doc! {
            "$vectorSearch": {
                "index": index_name,
                "path": "embedding",
                "queryVector": vector.iter().map(|v| Bson::Double(*v as f64)).collect::<Vec<_>>(),
                "numCandidates": self.vector_search_candidates(k),
                "limit": k as i64,
            }
        }];
        let mut text_pipeline = vec![
            doc! {
                "$search": {
                    "index": text_index_name,
                    "text": { "query": query, "path": "text" }
                }
            },
            doc! { "$limit": k as i64 },
        ];
        if let Some(source) = source_filter {
            vector_pipeline.push(doc! { "$match": { "source": source } });
            text_pipeline.push(doc! { "$match": { "source": source } });
        }

        let pipeline = vec![doc! {
            "$rankFusion": {
                "input": {
                    "pipelines": {
                        "vector": vector_pipeline,
                        "text": text_pipeline,
                    }
                }
            }
        }];

        let mut cursor = match self.chunks_coll(scope).aggregate(pipeline).await {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "rankFusion unavailable, dispatcher will fall back");
                return Ok(None);
            },
        };
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let score = doc.get_f64("score").unwrap_or(0.0) as f32;
            if let Some(r) = Self::doc_to_result(scope, &doc, score) {
                out.push(r);
            }
        }
        Ok(Some(out))
    }

    async fn get_kb_document_by_hash(&self, content_hash: &str) -> anyhow::Result<Option<KbDocumentDoc>> {
        Ok(self
            .kb_documents_coll()
            .find_one(doc! { "contentHash": content_hash })
            .await?)
    }

    async fn insert_kb_document(&self, doc: &KbDocumentDoc) -> anyhow::Result<()> {
        self.kb_documents_coll()
            .replace_one(bson::doc! { "_id": &doc.id }, doc)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete_kb_document(&self, id: &str) -> anyhow::Result<bool> {
        let result = self.kb_documents_coll().delete_one(doc! { "_id": id }).await?;
        Ok(result.deleted_count > 0)
    }

    async fn upsert_kb_chunks(&self, chunks: &[KbChunkDoc]) -> anyhow::Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let docs: Vec<Document> = chunks.iter().map(bson::to_document).collect::<Result<_, _>>()?;
        self.db
            .collection::<Document>(&self.kb_chunks)
            .insert_many(docs)
            .await?;
        Ok(())
    }

    async fn delete_kb_chunks_for_doc(&self, doc_id: &str) -> anyhow::Result<()> {
        self.chunks_coll(Scope::Kb)
            .delete_many(doc! { "docId": doc_id })
            .await?;
        Ok(())
    }

    async fn list_kb_documents(
        &self,
        category: Option<&str>,
        tag: Option<&str>,
    ) -> anyhow::Result<Vec<KbDocumentDoc>> {
        let mut filter = Document::new();
        if let Some(category) = category {
            filter.insert("category", category);
        }
        if let Some(tag) = tag {
            filter.insert("tags", tag);
        }
        let cursor = self.kb_documents_coll().find(filter).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn kb_stats(&self) -> anyhow::Result<KbStats> {
        let documents = self.kb_documents_coll().count_documents(doc! {}).await? as usize;
        let chunks = self.chunks_coll(Scope::Kb).count_documents(doc! {}).await? as usize;

        let mut categories = Vec::new();
        let mut sources_by_type = std::collections::HashMap::new();
        let mut cursor = self.kb_documents_coll().find(doc! {}).await?;
        while let Some(kb_doc) = cursor.try_next().await? {
            if let Some(category) = kb_doc.category {
                if !categories.contains(&category) {
                    categories.push(category);
                }
            }
            *sources_by_type.entry(kb_doc.importer).or_insert(0) += 1;
        }

        Ok(KbStats {
            documents,
            chunks,
            categories,
            sources_by_type,
        })
    }

    async fn upsert_structured(&self, doc: &StructuredMemoryDoc) -> anyhow::Result<bool> {
        let existing = self
            .structured_coll()
            .find_one(bson::doc! { "_id": &doc.id })
            .await?;
        self.structured_coll()
            .replace_one(bson::doc! { "_id": &doc.id }, doc)
            .upsert(true)
            .await?;
        Ok(existing.is_none())
    }

    async fn search_structured(
        &self,
        agent_id: &str,
        query_vector: Option<&[f32]>,
        query_text: &str,
        k: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let cursor = self
            .structured_coll()
            .find(doc! { "agentId": agent_id })
            .await?;
        let all: Vec<StructuredMemoryDoc> = cursor.try_collect().await?;

        let mut scored: Vec<(f32, StructuredMemoryDoc)> = all
            .into_iter()
            .map(|m| {
                let lexical = if m.value.to_lowercase().contains(&query_text.to_lowercase()) {
                    1.0
                } else {
                    0.0
                };
                let semantic = match (query_vector, &m.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => 0.0,
                };
                (normalize_score(lexical.max(semantic), ScoreKind::Cosine), m)
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
        Ok(self
            .embedding_cache_coll()
            .find_one(doc! { "_id": id })
            .await?
            .map(|d| d.embedding))
    }

    async fn put_cached_embedding(&self, model: &str, text_hash: &str, vector: &[f32]) -> anyhow::Result<()> {
        let id = EmbeddingCacheDoc::compose_id(model, text_hash);
        let cache_doc = EmbeddingCacheDoc {
            id: id.clone(),
            embedding: vector.to_vec(),
            created_at: Utc::now(),
        };
        self.embedding_cache_coll()
            .replace_one(doc! { "_id": id }, &cache_doc)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn get_meta(&self, agent_id: &str) -> anyhow::Result<Option<MetaDoc>> {
        Ok(self.meta_coll().find_one(doc! { "_id": agent_id }).await?)
    }

    async fn put_meta(&self, meta: &MetaDoc) -> anyhow::Result<()> {
        self.meta_coll()
            .replace_one(doc! { "_id": &meta.agent_id }, meta)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn embedding_coverage(&self) -> anyhow::Result<EmbeddingCoverage> {
        let total = self.chunks_coll(Scope::Memory).count_documents(doc! {}).await? as usize;
        let success = self
            .chunks_coll(Scope::Memory)
            .count_documents(doc! { "embeddingStatus": "success" })
            .await? as usize;
        let failed = self
            .chunks_coll(Scope::Memory)
            .count_documents(doc! { "embeddingStatus": "failed" })
            .await? as usize;
        let pending = total.saturating_sub(success).saturating_sub(failed);
        Ok(EmbeddingCoverage {
            success,
            failed,
            pending,
            total,
        })
    }
}
