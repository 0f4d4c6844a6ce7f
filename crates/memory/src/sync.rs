//! Sync engine (§4.5, Component E): walks workspace memory files and session
//! transcripts, re-chunks and re-embeds whatever changed, and sweeps stale
//! rows. Phases run in order; only one sync runs at a time per manager (the
//! caller — `manager.rs` — owns that mutex, not this module).

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    chunker::{self, MEMORY_CHUNK_OVERLAP, MEMORY_CHUNK_TOKENS},
    embeddings::EmbeddingProvider,
    schema::{ChunkDoc, FileDoc},
    store::{MemoryStore, WriteMode},
};

/// Why a sync was triggered, surfaced through `status()`/logs only — it
/// doesn't change the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Startup,
    Watch,
    ChangeStream,
    Manual,
}

impl SyncReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Watch => "watch",
            Self::ChangeStream => "change_stream",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub errors: Vec<String>,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub degraded_to_non_transactional: bool,
}

pub struct SyncOptions<'a> {
    pub reason: SyncReason,
    pub force: bool,
    pub workspace_root: &'a Path,
    pub session_dir: Option<&'a Path>,
    pub extra_memory_paths: &'a [PathBuf],
    pub embedding_mode_managed: bool,
    pub embedding_model: Option<&'a str>,
    pub max_session_chunks: usize,
}

/// Runs all three phases of §4.5 and returns the combined report.
/// `transactions_degraded` is threaded in from the manager so the
/// "degrade once, stay degraded for the rest of the sync" rule holds across
/// files within this call.
pub async fn run_sync(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    opts: &SyncOptions<'_>,
    transactions_degraded: &AtomicBool,
) -> anyhow::Result<SyncReport> {
    info!(reason = opts.reason.as_str(), force = opts.force, "sync starting");
    let mut report = SyncReport::default();
    let mut valid_paths: HashSet<String> = HashSet::new();

    // Phase A — memory files.
    let memory_files = enumerate_memory_files(opts.workspace_root, opts.extra_memory_paths);
    sync_file_set(
        store,
        embedder,
        opts,
        "memory",
        &memory_files,
        opts.workspace_root,
        transactions_degraded,
        &mut valid_paths,
        &mut report,
    )
    .await;

    // Phase B — session transcripts.
    if let Some(session_dir) = opts.session_dir {
        let session_files = enumerate_session_files(session_dir);
        sync_file_set(
            store,
            embedder,
            opts,
            "sessions",
            &session_files,
            session_dir,
            transactions_degraded,
            &mut valid_paths,
            &mut report,
        )
        .await;

        if let Err(e) = enforce_session_cap(store, opts.max_session_chunks).await {
            warn!(error = %e, "failed to enforce session chunk cap");
        }
    }

    // Phase C — stale cleanup.
    match store.list_files(None).await {
        Ok(existing) => {
            for file in existing {
                if !valid_paths.contains(&file.path) {
                    if let Err(e) = store.delete_chunks_for_file(&file.path).await {
                        report.errors.push(format!("{}: {e}", file.path));
                        continue;
                    }
                    if let Err(e) = store.delete_file(&file.path).await {
                        report.errors.push(format!("{}: {e}", file.path));
                        continue;
                    }
                    report.files_removed += 1;
                }
            }
        },
        Err(e) => report.errors.push(format!("listing files for stale cleanup: {e}")),
    }

    info!(
        files_updated = report.files_updated,
        files_unchanged = report.files_unchanged,
        files_removed = report.files_removed,
        errors = report.errors.len(),
        "sync complete"
    );
    Ok(report)
}

/// Workspace memory files per §4.5 phase A: `MEMORY.md`, `memory.md`,
/// `memory/**`, plus any configured extra paths. Symlinks are skipped.
fn enumerate_memory_files(workspace_root: &Path, extra_paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for candidate in ["MEMORY.md", "memory.md"] {
        let path = workspace_root.join(candidate);
        if path.is_file() {
            out.push(path);
        }
    }
    for dir_name in ["memory"].iter().chain(extra_paths.iter().filter_map(|p| p.to_str())) {
        let dir = workspace_root.join(dir_name);
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(Result::ok) {
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            if matches!(entry.path().extension().and_then(|e| e.to_str()), Some("md") | Some("markdown")) {
                out.push(entry.path().to_path_buf());
            }
        }
    }
    out
}

fn enumerate_session_files(session_dir: &Path) -> Vec<PathBuf> {
    if !session_dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(session_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !e.path_is_symlink() && e.file_type().is_file())
        .filter(|e| matches!(e.path().extension().and_then(|x| x.to_str()), Some("md") | Some("markdown")))
        .map(|e| e.path().to_path_buf())
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn sync_file_set(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    opts: &SyncOptions<'_>,
    source: &str,
    files: &[PathBuf],
    base_dir: &Path,
    transactions_degraded: &AtomicBool,
    valid_paths: &mut HashSet<String>,
    report: &mut SyncReport,
) {
    for abs_path in files {
        let rel_path = abs_path
            .strip_prefix(base_dir)
            .unwrap_or(abs_path)
            .to_string_lossy()
            .replace('\\', "/");
        valid_paths.insert(rel_path.clone());

        match sync_one_file(store, embedder, opts, source, abs_path, &rel_path, transactions_degraded).await {
            Ok(true) => report.files_updated += 1,
            Ok(false) => report.files_unchanged += 1,
            Err(e) => {
                warn!(path = %rel_path, error = %e, "failed to sync file");
                report.errors.push(format!("{rel_path}: {e}"));
            },
        }
    }
}

/// Syncs a single file, returning `Ok(true)` if it was re-indexed and
/// `Ok(false)` if the stored hash already matched.
async fn sync_one_file(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    opts: &SyncOptions<'_>,
    source: &str,
    abs_path: &Path,
    rel_path: &str,
    transactions_degraded: &AtomicBool,
) -> anyhow::Result<bool> {
    let contents = std::fs::read_to_string(abs_path)?;
    let hash = chunker::hash_text(&contents);

    let existing = store.get_file(rel_path).await?;
    let needs_reindex = opts.force || existing.as_ref().map(|f| f.hash != hash).unwrap_or(true);
    if !needs_reindex {
        return Ok(false);
    }

    let metadata = std::fs::metadata(abs_path)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let chunks = chunker::chunk_markdown(&contents, MEMORY_CHUNK_TOKENS, MEMORY_CHUNK_OVERLAP);
    let model = opts.embedding_model.unwrap_or("none").to_string();

    let embeddings: Vec<Option<Vec<f32>>> = if let Some(embedder) =
        embedder.filter(|_| opts.embedding_mode_managed)
    {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match embedder.embed_batch(&texts).await {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(e) => {
                warn!(path = rel_path, error = %e, "embedding batch failed, persisting chunks without vectors");
                vec![None; chunks.len()]
            },
        }
    } else {
        vec![None; chunks.len()]
    };

    let now = Utc::now();
    let chunk_docs: Vec<ChunkDoc> = chunks
        .iter()
        .zip(embeddings.iter())
        .map(|(chunk, embedding)| ChunkDoc {
            id: ChunkDoc::compose_id(rel_path, chunk.start_line as i64, chunk.end_line as i64),
            path: rel_path.to_string(),
            source: source.to_string(),
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

    let file_doc = FileDoc {
        path: rel_path.to_string(),
        source: source.to_string(),
        hash,
        mtime,
        size: metadata.len() as i64,
        updated_at: now,
    };

    let allow_transaction = !transactions_degraded.load(Ordering::SeqCst);
    let mode = store.atomic_write_file(&file_doc, &chunk_docs, allow_transaction).await?;
    if mode == WriteMode::Degraded && allow_transaction {
        transactions_degraded.store(true, Ordering::SeqCst);
    }

    Ok(true)
}

/// Open Question resolution (documented in DESIGN.md): `maxSessionChunks`
/// is enforced at file granularity. Session files are ordered oldest-first
/// by `updatedAt`; once the tracked session-file count exceeds the cap,
/// the oldest files (and their chunks) are dropped entirely rather than
/// trimming individual chunks within a file.
async fn enforce_session_cap(store: &dyn MemoryStore, max_session_chunks: usize) -> anyhow::Result<()> {
    if max_session_chunks == 0 {
        return Ok(());
    }
    let mut session_files = store.list_files(Some("sessions")).await?;
    if session_files.len() <= max_session_chunks {
        return Ok(());
    }
    session_files.sort_by_key(|f| f.updated_at);
    let overflow = session_files.len() - max_session_chunks;
    for file in session_files.into_iter().take(overflow) {
        store.delete_chunks_for_file(&file.path).await?;
        store.delete_file(&file.path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::store::MockStore;

    struct StubEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    fn opts(workspace_root: &Path) -> SyncOptions<'_> {
        SyncOptions {
            reason: SyncReason::Manual,
            force: false,
            workspace_root,
            session_dir: None,
            extra_memory_paths: &[],
            embedding_mode_managed: true,
            embedding_model: Some("stub"),
            max_session_chunks: 50,
        }
    }

    #[tokio::test]
    async fn first_sync_indexes_memory_md() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "line one\nline two\n").unwrap();

        let store = MockStore::new();
        let embedder = StubEmbedder { calls: AtomicUsize::new(0) };
        let degraded = AtomicBool::new(false);

        let report = run_sync(&store, Some(&embedder), &opts(dir.path()), &degraded).await.unwrap();
        assert_eq!(report.files_updated, 1);
        assert_eq!(report.files_removed, 0);
        assert!(store.chunk_count() >= 1);
    }

    #[tokio::test]
    async fn unchanged_file_is_skipped_on_second_sync() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "stable content\n").unwrap();

        let store = MockStore::new();
        let embedder = StubEmbedder { calls: AtomicUsize::new(0) };
        let degraded = AtomicBool::new(false);

        run_sync(&store, Some(&embedder), &opts(dir.path()), &degraded).await.unwrap();
        let second = run_sync(&store, Some(&embedder), &opts(dir.path()), &degraded).await.unwrap();
        assert_eq!(second.files_updated, 0);
        assert_eq!(second.files_unchanged, 1);
    }

    #[tokio::test]
    async fn removed_file_is_swept_on_next_sync() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("MEMORY.md");
        std::fs::write(&path, "will be deleted\n").unwrap();

        let store = MockStore::new();
        let embedder = StubEmbedder { calls: AtomicUsize::new(0) };
        let degraded = AtomicBool::new(false);

        run_sync(&store, Some(&embedder), &opts(dir.path()), &degraded).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let second = run_sync(&store, Some(&embedder), &opts(dir.path()), &degraded).await.unwrap();
        assert_eq!(second.files_removed, 1);
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn transaction_degradation_sticks_for_rest_of_sync() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "a\n").unwrap();
        std::fs::create_dir(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/notes.md"), "b\n").unwrap();

        let store = MockStore::new().without_transaction_support();
        let embedder = StubEmbedder { calls: AtomicUsize::new(0) };
        let degraded = AtomicBool::new(false);

        run_sync(&store, Some(&embedder), &opts(dir.path()), &degraded).await.unwrap();
        assert!(degraded.load(Ordering::SeqCst));
    }
}
