//! Knowledge-base ingestion + search pipeline (§4.8, Component H).

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    capability::Features,
    chunker::{self, KB_CHUNK_OVERLAP, KB_CHUNK_TOKENS},
    embeddings::EmbeddingProvider,
    schema::{KbChunkDoc, KbDocumentDoc},
    search::{self, SearchResult},
    store::{KbStats, MemoryStore, Scope},
};

/// One document to ingest. `source` is the originating path/URL/`manual`/
/// `api`; `importer` names the pipeline that produced it (§3).
#[derive(Debug, Clone)]
pub struct KbDocInput {
    pub title: String,
    pub content: String,
    pub source: String,
    pub importer: String,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KbIngestOptions {
    pub embedding_mode_managed: bool,
    pub tokens: usize,
    pub overlap: usize,
    pub force: bool,
    pub max_document_size: usize,
}

impl Default for KbIngestOptions {
    fn default() -> Self {
        Self {
            embedding_mode_managed: true,
            tokens: KB_CHUNK_TOKENS,
            overlap: KB_CHUNK_OVERLAP,
            force: false,
            max_document_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KbIngestReport {
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// `{completed, total, label}` streamed during a batch ingest (§4.8).
#[derive(Debug, Clone)]
pub struct KbIngestProgress {
    pub completed: usize,
    pub total: usize,
    pub label: String,
}

pub async fn ingest_to_kb(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    docs: &[KbDocInput],
    opts: &KbIngestOptions,
    mut on_progress: impl FnMut(KbIngestProgress),
) -> anyhow::Result<KbIngestReport> {
    let mut report = KbIngestReport::default();
    let total = docs.len();

    for (index, doc) in docs.iter().enumerate() {
        on_progress(KbIngestProgress {
            completed: index,
            total,
            label: doc.title.clone(),
        });

        if doc.content.len() > opts.max_document_size {
            report.errors.push(format!("{}: exceeds max document size", doc.title));
            continue;
        }

        let content_hash = chunker::hash_text(&doc.content);
        if !opts.force {
            match store.get_kb_document_by_hash(&content_hash).await {
                Ok(Some(_)) => {
                    report.skipped += 1;
                    continue;
                },
                Ok(None) => {},
                Err(e) => {
                    report.errors.push(format!("{}: {e}", doc.title));
                    continue;
                },
            }
        } else if let Ok(Some(existing)) = store.get_kb_document_by_hash(&content_hash).await {
            if let Err(e) = store.delete_kb_chunks_for_doc(&existing.id).await {
                report.errors.push(format!("{}: {e}", doc.title));
                continue;
            }
            if let Err(e) = store.delete_kb_document(&existing.id).await {
                report.errors.push(format!("{}: {e}", doc.title));
                continue;
            }
        }

        let doc_id = Uuid::new_v4().to_string();
        let chunks = chunker::chunk_markdown(&doc.content, opts.tokens, opts.overlap);

        let embeddings: Vec<Option<Vec<f32>>> = if let Some(embedder) =
            embedder.filter(|_| opts.embedding_mode_managed)
        {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match embedder.embed_batch(&texts).await {
                Ok(vectors) => vectors.into_iter().map(Some).collect(),
                Err(e) => {
                    warn!(title = %doc.title, error = %e, "KB embedding batch failed, persisting without vectors");
                    vec![None; chunks.len()]
                },
            }
        } else {
            vec![None; chunks.len()]
        };

        let now = Utc::now();
        let model = embedder.map(|e| e.model_name().to_string()).unwrap_or_else(|| "none".to_string());
        let kb_chunks: Vec<KbChunkDoc> = chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| KbChunkDoc {
                id: KbChunkDoc::compose_id(&doc_id, chunk.start_line as i64, chunk.end_line as i64),
                doc_id: doc_id.clone(),
                source: doc.source.clone(),
                start_line: chunk.start_line as i64,
                end_line: chunk.end_line as i64,
                text: chunker::cap_snippet(&chunk.text),
                hash: chunker::hash_text(&chunk.text),
                embedding: embedding.clone(),
                embedding_status: if embedding.is_some() { "success" } else { "failed" }.to_string(),
                embedding_model: model.clone(),
                updated_at: now,
            })
            .collect();

        let document = KbDocumentDoc {
            id: doc_id,
            title: doc.title.clone(),
            content: doc.content.clone(),
            source: doc.source.clone(),
            importer: doc.importer.clone(),
            tags: doc.tags.clone(),
            category: doc.category.clone(),
            content_hash,
            chunk_count: kb_chunks.len() as i64,
            updated_at: now,
        };

        if let Err(e) = store.insert_kb_document(&document).await {
            report.errors.push(format!("{}: {e}", doc.title));
            continue;
        }
        if let Err(e) = store.upsert_kb_chunks(&kb_chunks).await {
            report.errors.push(format!("{}: {e}", doc.title));
            continue;
        }

        report.documents_processed += 1;
        report.chunks_created += kb_chunks.len();
    }

    on_progress(KbIngestProgress {
        completed: total,
        total,
        label: "done".to_string(),
    });

    Ok(report)
}

/// Walks `paths`, collecting `.md`/`.txt` files (recursively unless
/// `recursive = false`), skipping symlinks, and ingests them as KB
/// documents titled by file stem.
pub async fn ingest_files_to_kb(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    paths: &[PathBuf],
    recursive: bool,
    opts: &KbIngestOptions,
    on_progress: impl FnMut(KbIngestProgress),
) -> anyhow::Result<KbIngestReport> {
    let mut docs = Vec::new();
    for path in paths {
        collect_kb_files(path, recursive, &mut docs)?;
    }
    ingest_to_kb(store, embedder, &docs, opts, on_progress).await
}

fn collect_kb_files(path: &Path, recursive: bool, out: &mut Vec<KbDocInput>) -> anyhow::Result<()> {
    if path.is_file() {
        if let Some(doc) = read_kb_file(path)? {
            out.push(doc);
        }
        return Ok(());
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    for entry in WalkDir::new(path)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        if let Some(doc) = read_kb_file(entry.path())? {
            out.push(doc);
        }
    }
    Ok(())
}

fn read_kb_file(path: &Path) -> anyhow::Result<Option<KbDocInput>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    if !matches!(ext, "md" | "txt") {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let title = path.file_stem().and_then(|s| s.to_str()).unwrap_or("untitled").to_string();
    Ok(Some(KbDocInput {
        title,
        content,
        source: path.to_string_lossy().to_string(),
        importer: "filesystem".to_string(),
        tags: Vec::new(),
        category: None,
    }))
}

/// Hybrid search scoped to the KB chunk collection (§4.8), reusing the
/// same dispatcher as workspace memory search.
#[allow(clippy::too_many_arguments)]
pub async fn search_kb(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    features: Features,
    query: &str,
    limit: usize,
    vector_weight: f64,
    text_weight: f64,
) -> anyhow::Result<Vec<SearchResult>> {
    search::hybrid_search(store, embedder, features, Scope::Kb, query, limit, vector_weight, text_weight, None).await
}

pub async fn list_kb_documents(
    store: &dyn MemoryStore,
    category: Option<&str>,
    tag: Option<&str>,
) -> anyhow::Result<Vec<KbDocumentDoc>> {
    let mut docs = store.list_kb_documents(category, tag).await?;
    docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(docs)
}

pub async fn remove_kb_document(store: &dyn MemoryStore, id: &str) -> anyhow::Result<bool> {
    store.delete_kb_chunks_for_doc(id).await?;
    store.delete_kb_document(id).await
}

pub async fn get_kb_stats(store: &dyn MemoryStore) -> anyhow::Result<KbStats> {
    store.kb_stats().await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use async_trait::async_trait;

    use super::*;
    use crate::store::MockStore;

    struct StubEmbedder;
    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn provider_key(&self) -> &str {
            "stub"
        }
    }

    fn doc(title: &str, content: &str) -> KbDocInput {
        KbDocInput {
            title: title.to_string(),
            content: content.to_string(),
            source: "manual".to_string(),
            importer: "test".to_string(),
            tags: vec![],
            category: None,
        }
    }

    #[tokio::test]
    async fn ingest_is_hash_idempotent() {
        let store = MockStore::new();
        let embedder = StubEmbedder;
        let docs = vec![doc("guide", "some reasonably long guide content about mongo")];
        let opts = KbIngestOptions::default();

        let first = ingest_to_kb(&store, Some(&embedder), &docs, &opts, |_| {}).await.unwrap();
        assert_eq!(first.documents_processed, 1);
        assert_eq!(first.skipped, 0);

        let second = ingest_to_kb(&store, Some(&embedder), &docs, &opts, |_| {}).await.unwrap();
        assert_eq!(second.documents_processed, 0);
        assert_eq!(second.skipped, 1);

        let stats = get_kb_stats(&store).await.unwrap();
        assert_eq!(stats.documents, 1);
    }

    #[tokio::test]
    async fn oversize_document_is_rejected() {
        let store = MockStore::new();
        let embedder = StubEmbedder;
        let docs = vec![doc("huge", "x")];
        let opts = KbIngestOptions {
            max_document_size: 0,
            ..KbIngestOptions::default()
        };

        let report = ingest_to_kb(&store, Some(&embedder), &docs, &opts, |_| {}).await.unwrap();
        assert_eq!(report.documents_processed, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_chunks_before_document() {
        let store = MockStore::new();
        let embedder = StubEmbedder;
        let docs = vec![doc("guide", "content to chunk and embed for removal test")];
        let opts = KbIngestOptions::default();
        ingest_to_kb(&store, Some(&embedder), &docs, &opts, |_| {}).await.unwrap();

        let listed = list_kb_documents(&store, None, None).await.unwrap();
        assert_eq!(listed.len(), 1);

        let removed = remove_kb_document(&store, &listed[0].id).await.unwrap();
        assert!(removed);

        let stats = get_kb_stats(&store).await.unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.chunks, 0);
    }
}
