//! Memory manager façade (§4.10, Component J): the single handle callers hold.
//! Wires capability detection, schema provisioning, the sync engine, the
//! search dispatcher, the KB pipeline, structured memory, and the watchers
//! into one API surface.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use mongodb::{bson::Document, options::ClientOptions, Client, Collection, Database};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use moltis_config::{Backend, EmbeddingMode, MemoryConfig};

use crate::{
    capability::{detect_topology, Topology},
    chunker,
    embeddings::EmbeddingProvider,
    error::{redact_uri, MemoryError, Result},
    kb::{self, KbDocInput, KbIngestOptions, KbIngestProgress, KbIngestReport},
    reranking::RerankerProvider,
    schema::{ensure_schema, ChunkDoc, KbDocumentDoc, MetaDoc},
    search::{self, parse_session_key, ChatScope, SearchResult},
    session_export::{SessionExportConfig, SessionExporter, SessionTranscript},
    store::{now, KbStats, MemoryStore, MongoStore, Scope},
    structured::{self, StructuredMemoryWrite, StructuredMemoryWriteResult},
    sync::{self, SyncOptions, SyncReason, SyncReport},
};

#[cfg(feature = "file-watcher")]
use crate::watcher::{ChangeStreamWatcher, FileWatcher};

/// Options accepted by [`MemoryManager::search`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    pub min_score: f32,
    pub source_filter: Option<String>,
    /// §4.7's `sessionKey`: the sentinels `__memory__`/`__sessions__` narrow
    /// `source_filter`; anything else is parsed for `direct`/`group`/`channel`
    /// tokens to gate citation formatting in `CitationMode::Auto` (§4.10).
    /// Takes priority over `source_filter` when it resolves to a sentinel.
    pub session_key: Option<String>,
    pub include_kb: bool,
    pub include_structured: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 5,
            min_score: 0.0,
            source_filter: None,
            session_key: None,
            include_kb: true,
            include_structured: true,
        }
    }
}

/// Result of [`MemoryManager::search`]: the merged, deduplicated results plus
/// whether citations were attached and a feedback hint for low-confidence
/// result sets (§4.10).
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub citations_applied: bool,
    pub hint: Option<String>,
}

/// `status()`'s shape (§4.10).
#[derive(Debug, Clone)]
pub struct MemoryStatus {
    pub backend: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub dirty: bool,
    pub fallback: Option<String>,
}

/// The memory manager façade. Construct via [`MemoryManager::create`]; every
/// other public method requires the manager not yet be closed.
pub struct MemoryManager {
    config: MemoryConfig,
    agent_id: String,
    workspace_root: PathBuf,
    session_dir: PathBuf,
    extra_memory_paths: Vec<PathBuf>,
    /// `None` under the test constructor ([`MemoryManager::for_testing`]),
    /// which swaps in a [`crate::store::MockStore`] with no live server to
    /// subscribe a change stream against.
    db: Option<Database>,
    store: Arc<dyn MemoryStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    reranker: Option<Arc<dyn RerankerProvider>>,
    session_exporter: SessionExporter,
    topology: Topology,
    transactions_degraded: Arc<AtomicBool>,
    dirty: Arc<AtomicBool>,
    sync_lock: AsyncMutex<()>,
    closed: Arc<AtomicBool>,
    #[cfg(feature = "file-watcher")]
    file_watcher: std::sync::Mutex<Option<FileWatcher>>,
    #[cfg(feature = "file-watcher")]
    change_stream_watcher: AsyncMutex<Option<ChangeStreamWatcher>>,
}

impl MemoryManager {
    /// Connects, runs the capability probe, ensures the schema, runs an
    /// initial sync, and starts the watchers. Returns `Ok(None)` when the
    /// configured backend isn't `mongodb` (§4.10: "Returns `null` if the
    /// backend is disabled for this agent").
    pub async fn create(
        config: MemoryConfig,
        agent_id: impl Into<String>,
        workspace_root: PathBuf,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        reranker: Option<Arc<dyn RerankerProvider>>,
    ) -> Result<Option<Arc<Self>>> {
        if config.backend != Backend::MongoDb {
            debug!(backend = ?config.backend, "memory backend is not mongodb, manager disabled");
            return Ok(None);
        }

        let agent_id = agent_id.into();
        let mut client_options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| MemoryError::Connection(format!("{}: {e}", redact_uri(&config.uri))))?;
        client_options.server_selection_timeout = Some(Duration::from_secs(10));
        client_options.connect_timeout = Some(Duration::from_secs(10));
        let client =
            Client::with_options(client_options).map_err(|e| MemoryError::Connection(e.to_string()))?;
        let db = client.database(&config.database);

        let topology = detect_topology(&db).await;
        ensure_schema(&db, &config, topology.features)
            .await
            .map_err(MemoryError::Other)?;

        let store: Arc<dyn MemoryStore> = Arc::new(MongoStore::new(db.clone(), &config));

        let transactions_degraded = Arc::new(AtomicBool::new(false));
        if let Some(meta) = store.get_meta(&agent_id).await.map_err(MemoryError::Other)? {
            transactions_degraded.store(meta.transactions_degraded, Ordering::SeqCst);
        }

        let session_dir = config
            .session_dir
            .clone()
            .unwrap_or_else(|| workspace_root.join("memory").join("sessions"));
        let extra_memory_paths: Vec<PathBuf> = config
            .memory_dirs
            .iter()
            .filter(|p| p.as_os_str() != "memory")
            .cloned()
            .collect();

        let manager = Arc::new(Self {
            agent_id,
            workspace_root: workspace_root.clone(),
            session_exporter: SessionExporter::new(SessionExportConfig {
                export_dir: session_dir.clone(),
                ..SessionExportConfig::default()
            }),
            session_dir,
            extra_memory_paths,
            db: Some(db),
            store,
            embedder,
            reranker,
            topology,
            transactions_degraded,
            dirty: Arc::new(AtomicBool::new(true)),
            sync_lock: AsyncMutex::new(()),
            closed: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "file-watcher")]
            file_watcher: std::sync::Mutex::new(None),
            #[cfg(feature = "file-watcher")]
            change_stream_watcher: AsyncMutex::new(None),
            config,
        });

        manager.sync(SyncReason::Startup).await?;

        #[cfg(feature = "file-watcher")]
        manager.clone().spawn_watchers().await;

        Ok(Some(manager))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::programmer("memory manager used after close()"));
        }
        Ok(())
    }

    /// §4.7 + §4.8 + §4.9 merged: workspace memory, knowledge base, and
    /// structured memory, deduplicated by chunk content hash (highest score
    /// wins), citation-formatted per `config.citations`, with a feedback hint
    /// attached when confidence is low.
    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<SearchOutcome> {
        self.ensure_open()?;
        if opts.max_results == 0 {
            return Ok(SearchOutcome::default());
        }

        let fetch_limit = opts.max_results.saturating_mul(2).max(opts.max_results);
        let embedder = self.embedder.as_deref();

        let (sentinel_source, chat_scope) = opts
            .session_key
            .as_deref()
            .map(parse_session_key)
            .unwrap_or((None, ChatScope::Unknown));
        let effective_source_filter = sentinel_source.map(str::to_string).or_else(|| opts.source_filter.clone());

        let mut results = search::hybrid_search(
            self.store.as_ref(),
            embedder,
            self.topology.features,
            Scope::Memory,
            query,
            fetch_limit,
            self.config.vector_weight as f64,
            self.config.keyword_weight as f64,
            effective_source_filter.as_deref(),
        )
        .await
        .map_err(MemoryError::Other)?;

        if opts.include_kb {
            let kb_results = kb::search_kb(
                self.store.as_ref(),
                embedder,
                self.topology.features,
                query,
                fetch_limit,
                self.config.vector_weight as f64,
                self.config.keyword_weight as f64,
            )
            .await
            .map_err(MemoryError::Other)?;
            results.extend(kb_results);
        }

        if opts.include_structured {
            let query_vector = match embedder {
                Some(e) if self.topology.features.vector_search => e.embed(query).await.ok(),
                _ => None,
            };
            let structured_results = structured::search_structured(
                self.store.as_ref(),
                &self.agent_id,
                query_vector.as_deref(),
                query,
                fetch_limit,
            )
            .await
            .map_err(MemoryError::Other)?;
            results.extend(structured_results);
        }

        let mut results = dedup_by_content_hash(results);

        if self.config.llm_reranking
            && let Some(reranker) = &self.reranker
        {
            results = reranker
                .rerank(query, results, fetch_limit)
                .await
                .map_err(MemoryError::Other)?;
        }

        results.retain(|r| r.score >= opts.min_score);
        results.truncate(opts.max_results);

        let hint = compute_feedback_hint(&results);
        let citations_applied = SearchResult::should_include_citations(self.config.citations, chat_scope);
        if citations_applied {
            for r in &mut results {
                r.text = r.text_with_citation();
            }
        }

        Ok(SearchOutcome { results, citations_applied, hint })
    }

    /// Retrieve a chunk by id, checked against both the memory and KB scopes.
    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<SearchResult>> {
        self.ensure_open()?;
        if let Some(chunk) = self
            .store
            .get_chunk_by_id(Scope::Memory, chunk_id)
            .await
            .map_err(MemoryError::Other)?
        {
            return Ok(Some(chunk_to_result(chunk)));
        }
        if let Some(chunk) = self
            .store
            .get_chunk_by_id(Scope::Kb, chunk_id)
            .await
            .map_err(MemoryError::Other)?
        {
            return Ok(Some(chunk_to_result(chunk)));
        }
        Ok(None)
    }

    /// Reads `lines` lines starting at `from` (1-based) from a
    /// workspace-relative path; rejects paths outside the workspace.
    pub async fn read_file(&self, path: &str, from: Option<usize>, lines: Option<usize>) -> Result<String> {
        self.ensure_open()?;
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative.components().any(|c| matches!(c, Component::ParentDir))
        {
            return Err(MemoryError::integrity(format!("path escapes workspace: {path}")));
        }

        let full = self.workspace_root.join(relative);
        let canonical_workspace = self
            .workspace_root
            .canonicalize()
            .map_err(|e| MemoryError::Other(e.into()))?;
        let canonical = full
            .canonicalize()
            .map_err(|e| MemoryError::integrity(format!("{path}: {e}")))?;
        if !canonical.starts_with(&canonical_workspace) {
            return Err(MemoryError::integrity(format!("path escapes workspace: {path}")));
        }

        let contents = tokio::fs::read_to_string(&canonical)
            .await
            .map_err(|e| MemoryError::Other(e.into()))?;
        let all_lines: Vec<&str> = contents.lines().collect();
        let start = from.unwrap_or(1).max(1) - 1;
        if start >= all_lines.len() {
            return Ok(String::new());
        }
        let end = match lines {
            Some(n) => (start + n).min(all_lines.len()),
            None => all_lines.len(),
        };
        Ok(all_lines[start..end].join("\n"))
    }

    /// §4.9. The `write` capability is implicit once the manager exists:
    /// every mongodb tier supports a plain upsert, so there is no further
    /// gate beyond the backend check `create()` already performed.
    pub async fn write_structured_memory(
        &self,
        write: StructuredMemoryWrite,
    ) -> Result<StructuredMemoryWriteResult> {
        self.ensure_open()?;
        structured::write_structured_memory(self.store.as_ref(), self.embedder.as_deref(), write)
            .await
            .map_err(MemoryError::Other)
    }

    /// §4.5. Concurrent calls are coalesced by serializing on `sync_lock`: a
    /// caller that arrives while a sync is in flight waits for it, and its
    /// own pass then finds nothing left to do.
    pub async fn sync(&self, reason: SyncReason) -> Result<SyncReport> {
        self.ensure_open()?;
        let _guard = self.sync_lock.lock().await;

        let embedder = self.embedder.as_deref();
        let opts = SyncOptions {
            reason,
            force: false,
            workspace_root: &self.workspace_root,
            session_dir: Some(self.session_dir.as_path()),
            extra_memory_paths: &self.extra_memory_paths,
            embedding_mode_managed: self.config.embedding_mode == EmbeddingMode::Managed,
            embedding_model: embedder.map(EmbeddingProvider::model_name),
            max_session_chunks: self.config.max_session_chunks,
        };

        let report = sync::run_sync(self.store.as_ref(), embedder, &opts, &self.transactions_degraded)
            .await
            .map_err(MemoryError::Other)?;

        self.dirty.store(false, Ordering::SeqCst);

        let mut meta = self
            .store
            .get_meta(&self.agent_id)
            .await
            .map_err(MemoryError::Other)?
            .unwrap_or_else(|| MetaDoc {
                agent_id: self.agent_id.clone(),
                ..MetaDoc::default()
            });
        meta.last_sync_at = Some(now());
        meta.transactions_degraded = self.transactions_degraded.load(Ordering::SeqCst);
        self.store.put_meta(&meta).await.map_err(MemoryError::Other)?;

        if !report.errors.is_empty() {
            warn!(errors = ?report.errors, "sync completed with errors");
        }

        Ok(report)
    }

    /// Writes a sanitized session transcript to the directory Phase B of
    /// `sync` scans, so the next sync picks it up (§11.2 wiring).
    pub async fn export_session(&self, transcript: &SessionTranscript) -> Result<PathBuf> {
        self.ensure_open()?;
        self.session_exporter.export(transcript).await.map_err(MemoryError::Other)
    }

    pub async fn kb_ingest(
        &self,
        docs: &[KbDocInput],
        opts: &KbIngestOptions,
        on_progress: impl FnMut(KbIngestProgress),
    ) -> Result<KbIngestReport> {
        self.ensure_open()?;
        kb::ingest_to_kb(self.store.as_ref(), self.embedder.as_deref(), docs, opts, on_progress)
            .await
            .map_err(MemoryError::Other)
    }

    pub async fn kb_ingest_paths(
        &self,
        paths: &[PathBuf],
        recursive: bool,
        opts: &KbIngestOptions,
        on_progress: impl FnMut(KbIngestProgress),
    ) -> Result<KbIngestReport> {
        self.ensure_open()?;
        kb::ingest_files_to_kb(self.store.as_ref(), self.embedder.as_deref(), paths, recursive, opts, on_progress)
            .await
            .map_err(MemoryError::Other)
    }

    pub async fn kb_list(&self, category: Option<&str>, tag: Option<&str>) -> Result<Vec<KbDocumentDoc>> {
        self.ensure_open()?;
        kb::list_kb_documents(self.store.as_ref(), category, tag).await.map_err(MemoryError::Other)
    }

    pub async fn kb_search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        kb::search_kb(
            self.store.as_ref(),
            self.embedder.as_deref(),
            self.topology.features,
            query,
            max_results,
            self.config.vector_weight as f64,
            self.config.keyword_weight as f64,
        )
        .await
        .map_err(MemoryError::Other)
    }

    pub async fn kb_remove(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        kb::remove_kb_document(self.store.as_ref(), id).await.map_err(MemoryError::Other)
    }

    pub async fn kb_stats(&self) -> Result<KbStats> {
        self.ensure_open()?;
        kb::get_kb_stats(self.store.as_ref()).await.map_err(MemoryError::Other)
    }

    pub fn citation_mode(&self) -> moltis_config::CitationMode {
        self.config.citations
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn store(&self) -> &dyn MemoryStore {
        self.store.as_ref()
    }

    pub fn status(&self) -> MemoryStatus {
        MemoryStatus {
            backend: "mongodb".to_string(),
            provider: self.embedder.as_ref().map(|e| e.provider_key().to_string()),
            model: self.embedder.as_ref().map(|e| e.model_name().to_string()),
            dirty: self.dirty.load(Ordering::SeqCst),
            fallback: self
                .transactions_degraded
                .load(Ordering::SeqCst)
                .then(|| "non-transactional writes".to_string()),
        }
    }

    /// Idempotent: stops watchers and clears timers. Further calls are no-ops.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "file-watcher")]
        {
            self.file_watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(mut watcher) = self.change_stream_watcher.lock().await.take() {
                watcher.close();
            }
        }
        info!(agent_id = %self.agent_id, "memory manager closed");
    }

    /// Starts the filesystem watcher and, if the topology supports change
    /// streams, the change-stream subscriber (§4.6). Both mark the manager
    /// dirty and arm a coalescing sync on receipt.
    #[cfg(feature = "file-watcher")]
    async fn spawn_watchers(self: Arc<Self>) {
        let mut watch_paths = vec![
            self.workspace_root.join("MEMORY.md"),
            self.workspace_root.join("memory.md"),
            self.workspace_root.join("memory"),
            self.session_dir.clone(),
        ];
        watch_paths.extend(self.extra_memory_paths.iter().map(|p| self.workspace_root.join(p)));

        match FileWatcher::start(&watch_paths, self.config.watch_debounce_ms) {
            Ok((watcher, mut rx)) => {
                *self.file_watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
                let weak = Arc::downgrade(&self);
                tokio::spawn(async move {
                    while let Some(_batch) = rx.recv().await {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.dirty.store(true, Ordering::SeqCst);
                        if let Err(e) = manager.sync(SyncReason::Watch).await {
                            warn!(error = %e, "filesystem-triggered sync failed");
                        }
                    }
                });
            },
            Err(e) => warn!(error = %e, "failed to start file watcher"),
        }

        if let (true, Some(db)) = (
            self.config.enable_change_streams && self.topology.features.change_streams,
            self.db.as_ref(),
        ) {
            let chunks: Collection<Document> = db.collection(&self.config.collection_name("chunks"));
            let mut watcher = ChangeStreamWatcher::new();
            let weak = Arc::downgrade(&self);
            let debounce_ms = self.config.change_stream_debounce_ms;
            let started = watcher
                .start(chunks, debounce_ms, move |_batch| {
                    if let Some(manager) = weak.upgrade() {
                        manager.dirty.store(true, Ordering::SeqCst);
                        tokio::spawn(async move {
                            if let Err(e) = manager.sync(SyncReason::ChangeStream).await {
                                warn!(error = %e, "change-stream-triggered sync failed");
                            }
                        });
                    }
                })
                .await;
            match started {
                Ok(true) => *self.change_stream_watcher.lock().await = Some(watcher),
                Ok(false) => debug!("change streams unsupported on this deployment"),
                Err(e) => warn!(error = %e, "failed to start change stream watcher"),
            }
        }
    }

    /// Builds a manager over a supplied store without connecting to a real
    /// server (§10.4): the dispatch logic, workspace-escape checks, and
    /// façade behavior are exercised with a [`crate::store::MockStore`].
    #[cfg(test)]
    pub(crate) fn for_testing(
        config: MemoryConfig,
        agent_id: impl Into<String>,
        workspace_root: PathBuf,
        store: Arc<dyn MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Arc<Self> {
        let session_dir = config
            .session_dir
            .clone()
            .unwrap_or_else(|| workspace_root.join("memory").join("sessions"));
        Arc::new(Self {
            agent_id: agent_id.into(),
            workspace_root: workspace_root.clone(),
            session_exporter: SessionExporter::new(SessionExportConfig {
                export_dir: session_dir.clone(),
                ..SessionExportConfig::default()
            }),
            session_dir,
            extra_memory_paths: Vec::new(),
            db: None,
            store,
            embedder,
            reranker: None,
            topology: Topology {
                tier: crate::capability::Tier::FullStack,
                is_replica_set: true,
                replica_set_name: Some("rs0".to_string()),
                server_version: "8.2.0".to_string(),
                has_search_engine: true,
                has_transactions: true,
                features: crate::capability::Features {
                    transactions: true,
                    change_streams: true,
                    text_search: true,
                    vector_search: true,
                    rank_fusion: true,
                    score_fusion: true,
                },
            },
            transactions_degraded: Arc::new(AtomicBool::new(false)),
            dirty: Arc::new(AtomicBool::new(true)),
            sync_lock: AsyncMutex::new(()),
            closed: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "file-watcher")]
            file_watcher: std::sync::Mutex::new(None),
            #[cfg(feature = "file-watcher")]
            change_stream_watcher: AsyncMutex::new(None),
            config,
        })
    }
}

fn chunk_to_result(chunk: ChunkDoc) -> SearchResult {
    SearchResult {
        chunk_id: chunk.id,
        path: chunk.path,
        source: chunk.source,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        score: 1.0,
        text: chunk.text,
    }
}

/// §4.10: deduplicates by chunk content hash, keeping the highest-scoring
/// occurrence when the same text shows up via more than one source.
fn dedup_by_content_hash(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut best: HashMap<String, SearchResult> = HashMap::new();
    for result in results {
        let key = chunker::hash_text(&result.text);
        match best.get(&key) {
            Some(existing) if existing.score >= result.score => {},
            _ => {
                best.insert(key, result);
            },
        }
    }
    let mut merged: Vec<SearchResult> = best.into_values().collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

/// Pure function behind §4.10's feedback hint: fewer than 2 results, all
/// scoring below 0.3.
fn compute_feedback_hint(results: &[SearchResult]) -> Option<String> {
    if results.len() >= 2 || results.iter().any(|r| r.score >= 0.3) {
        return None;
    }
    Some(
        "Low confidence results. Consider rephrasing your query or trying kb_search for broader coverage."
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use async_trait::async_trait;

    use super::*;

    struct KeywordEmbedder;

    const KEYWORDS: [&str; 6] = ["rust", "mongo", "search", "memory", "cooking", "music"];

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let lower = text.to_lowercase();
            Ok(KEYWORDS
                .iter()
                .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
                .collect())
        }

        fn model_name(&self) -> &str {
            "keyword-mock"
        }

        fn dimensions(&self) -> usize {
            KEYWORDS.len()
        }

        fn provider_key(&self) -> &str {
            "mock"
        }
    }

    fn make_result(id: &str, text: &str, score: f32) -> SearchResult {
        SearchResult {
            chunk_id: id.into(),
            path: "memory/note.md".into(),
            source: "memory".into(),
            start_line: 1,
            end_line: 2,
            score,
            text: text.into(),
        }
    }

    #[test]
    fn feedback_hint_fires_below_threshold() {
        let results = vec![make_result("a", "barely relevant", 0.1)];
        let hint = compute_feedback_hint(&results);
        assert!(hint.is_some());
        let hint = hint.unwrap();
        assert!(hint.contains("Low confidence"));
        assert!(hint.contains("kb_search"));
        assert!(hint.to_lowercase().contains("rephrasing"));
    }

    #[test]
    fn feedback_hint_absent_with_confident_result() {
        let results = vec![make_result("a", "clearly relevant", 0.8)];
        assert!(compute_feedback_hint(&results).is_none());
    }

    #[test]
    fn feedback_hint_absent_with_two_or_more_results() {
        let results = vec![make_result("a", "x", 0.1), make_result("b", "y", 0.1)];
        assert!(compute_feedback_hint(&results).is_none());
    }

    #[test]
    fn dedup_keeps_highest_scoring_duplicate() {
        let dup_text = "duplicated content across sources";
        let results = vec![
            make_result("mem:1:2", dup_text, 0.4),
            make_result("kb:doc:1:2", dup_text, 0.9),
            make_result("unique", "something else entirely", 0.5),
        ];
        let merged = dedup_by_content_hash(results);
        assert_eq!(merged.len(), 2);
        let winner = merged.iter().find(|r| r.text == dup_text).unwrap();
        assert_eq!(winner.chunk_id, "kb:doc:1:2");
    }

    use crate::store::MockStore;

    fn test_manager(workspace_root: PathBuf) -> Arc<MemoryManager> {
        let config = MemoryConfig {
            vector_weight: 0.7,
            keyword_weight: 0.3,
            ..MemoryConfig::default()
        };
        let store: Arc<dyn MemoryStore> = Arc::new(MockStore::new());
        let embedder: Option<Arc<dyn EmbeddingProvider>> = Some(Arc::new(KeywordEmbedder));
        MemoryManager::for_testing(config, "agent-1", workspace_root, store, embedder)
    }

    #[tokio::test]
    async fn sync_indexes_memory_files_and_search_finds_them() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("MEMORY.md"), "Rust has great memory safety.\n").expect("write");
        let manager = test_manager(tmp.path().to_path_buf());

        let report = manager.sync(SyncReason::Manual).await.expect("sync");
        assert_eq!(report.files_updated, 1);

        let outcome = manager
            .search("rust memory", SearchOptions::default())
            .await
            .expect("search");
        assert!(!outcome.results.is_empty());
    }

    #[tokio::test]
    async fn search_with_memory_sentinel_excludes_session_files() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("MEMORY.md"), "Rust has great memory safety.\n").expect("write");
        let session_dir = tmp.path().join("memory").join("sessions");
        std::fs::create_dir_all(&session_dir).expect("mkdir");
        std::fs::write(session_dir.join("s1.md"), "Rust has great memory safety.\n").expect("write");
        let manager = test_manager(tmp.path().to_path_buf());

        manager.sync(SyncReason::Manual).await.expect("sync");

        let opts = SearchOptions {
            session_key: Some("__memory__".to_string()),
            ..SearchOptions::default()
        };
        let outcome = manager.search("rust memory", opts).await.expect("search");
        assert!(!outcome.results.is_empty());
        assert!(outcome.results.iter().all(|r| r.source == "memory"));
    }

    #[tokio::test]
    async fn search_with_sessions_sentinel_excludes_memory_files() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("MEMORY.md"), "Rust has great memory safety.\n").expect("write");
        let session_dir = tmp.path().join("memory").join("sessions");
        std::fs::create_dir_all(&session_dir).expect("mkdir");
        std::fs::write(session_dir.join("s1.md"), "Rust has great memory safety.\n").expect("write");
        let manager = test_manager(tmp.path().to_path_buf());

        manager.sync(SyncReason::Manual).await.expect("sync");

        let opts = SearchOptions {
            session_key: Some("__sessions__".to_string()),
            ..SearchOptions::default()
        };
        let outcome = manager.search("rust memory", opts).await.expect("search");
        assert!(!outcome.results.is_empty());
        assert!(outcome.results.iter().all(|r| r.source == "sessions"));
    }

    #[tokio::test]
    async fn search_citations_auto_mode_gated_by_session_key_scope() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("MEMORY.md"), "Rust has great memory safety.\n").expect("write");
        let mut config = MemoryConfig::default();
        config.citations = moltis_config::CitationMode::Auto;
        let store: Arc<dyn MemoryStore> = Arc::new(MockStore::new());
        let embedder: Option<Arc<dyn EmbeddingProvider>> = Some(Arc::new(KeywordEmbedder));
        let manager = MemoryManager::for_testing(config, "agent-1", tmp.path().to_path_buf(), store, embedder);
        manager.sync(SyncReason::Manual).await.expect("sync");

        let direct_outcome = manager
            .search(
                "rust memory",
                SearchOptions {
                    session_key: Some("direct:user-1".to_string()),
                    ..SearchOptions::default()
                },
            )
            .await
            .expect("search");
        assert!(direct_outcome.citations_applied);

        let group_outcome = manager
            .search(
                "rust memory",
                SearchOptions {
                    session_key: Some("group:team-1".to_string()),
                    ..SearchOptions::default()
                },
            )
            .await
            .expect("search");
        assert!(!group_outcome.citations_applied);

        let no_key_outcome = manager.search("rust memory", SearchOptions::default()).await.expect("search");
        assert!(!no_key_outcome.citations_applied);
    }

    #[tokio::test]
    async fn read_file_rejects_path_escaping_workspace() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("MEMORY.md"), "content\n").expect("write");
        let manager = test_manager(tmp.path().to_path_buf());

        let err = manager.read_file("../../etc/passwd", None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::Integrity(_)));
    }

    #[tokio::test]
    async fn read_file_returns_requested_line_window() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("notes.md"), "one\ntwo\nthree\nfour\n").expect("write");
        let manager = test_manager(tmp.path().to_path_buf());

        let slice = manager.read_file("notes.md", Some(2), Some(2)).await.expect("read");
        assert_eq!(slice, "two\nthree");
    }

    #[tokio::test]
    async fn write_structured_memory_round_trips_through_search() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let manager = test_manager(tmp.path().to_path_buf());

        let write = StructuredMemoryWrite {
            kind: "preference".to_string(),
            key: "editor.indent".to_string(),
            value: "prefers tabs for indentation".to_string(),
            context: None,
            confidence: None,
            tags: vec![],
            source: "agent".to_string(),
            agent_id: "agent-1".to_string(),
        };
        let result = manager.write_structured_memory(write).await.expect("write");
        assert!(result.upserted);
    }

    #[tokio::test]
    async fn closed_manager_rejects_further_calls() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let manager = test_manager(tmp.path().to_path_buf());
        manager.close().await;

        let err = manager.sync(SyncReason::Manual).await.unwrap_err();
        assert!(matches!(err, MemoryError::Programmer(_)));
    }
}
