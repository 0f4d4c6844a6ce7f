//! `moltis kb` — knowledge-base ingest/list/search/stats/remove (spec §6).

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{bail, Context, Result},
    clap::Subcommand,
    serde_json::json,
    walkdir::WalkDir,
};

use moltis_memory::{
    embeddings::{EmbeddingProvider, RetryingEmbeddingProvider},
    embeddings_openai::OpenAiEmbeddingProvider,
    kb::{KbDocInput, KbIngestOptions},
    manager::MemoryManager,
    reranking::NoOpReranker,
};

#[derive(Subcommand)]
pub enum KbAction {
    /// Ingest files or directories into the knowledge base.
    Ingest {
        /// Files or directories to ingest (`.md`/`.txt`, recursive by default).
        paths: Vec<PathBuf>,
        /// Agent whose workspace/config scopes this ingest.
        #[arg(long, default_value = "default")]
        agent: String,
        /// Comma-separated tags applied to every ingested document.
        #[arg(long)]
        tags: Option<String>,
        /// Category applied to every ingested document.
        #[arg(long)]
        category: Option<String>,
        /// Re-ingest even if the content hash matches an existing document.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Don't recurse into subdirectories.
        #[arg(long, default_value_t = false)]
        no_recursive: bool,
        /// Print per-file progress as it streams.
        #[arg(long, default_value_t = false)]
        verbose: bool,
    },
    /// List ingested knowledge-base documents.
    List {
        #[arg(long, default_value = "default")]
        agent: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        tags: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Search the knowledge base.
    Search {
        query: String,
        #[arg(long, default_value = "default")]
        agent: String,
        #[arg(long, default_value_t = 10)]
        max_results: usize,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print aggregate knowledge-base statistics.
    Stats {
        #[arg(long, default_value = "default")]
        agent: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove a knowledge-base document (and its chunks) by id.
    Remove {
        id: String,
        #[arg(long, default_value = "default")]
        agent: String,
        /// Skip the confirmation prompt.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

pub async fn handle_kb(action: KbAction) -> Result<()> {
    match action {
        KbAction::Ingest {
            paths,
            agent,
            tags,
            category,
            force,
            no_recursive,
            verbose,
        } => ingest(paths, &agent, tags, category, force, !no_recursive, verbose).await,
        KbAction::List { agent, category, tags, json } => list(&agent, category, tags, json).await,
        KbAction::Search { query, agent, max_results, json } => search(&query, &agent, max_results, json).await,
        KbAction::Stats { agent, json } => stats(&agent, json).await,
        KbAction::Remove { id, agent, yes } => remove(&id, &agent, yes).await,
    }
}

/// Builds an embedding provider from `OPENAI_API_KEY` when present; `None`
/// degrades the manager to keyword-only search per §4.4/§7's "transient
/// provider" handling — the manager itself treats a missing provider as
/// managed-mode-without-vectors, not an error.
fn build_embedder() -> Option<Arc<dyn EmbeddingProvider>> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let provider = OpenAiEmbeddingProvider::new(api_key);
    Some(Arc::new(RetryingEmbeddingProvider::new(Box::new(provider))))
}

async fn open_manager(agent: &str) -> Result<Arc<MemoryManager>> {
    let config = moltis_config::discover_and_load();
    let workspace_root = std::env::current_dir().context("resolve workspace root")?;
    let embedder = build_embedder();
    let reranker = config.llm_reranking.then(|| Arc::new(NoOpReranker) as Arc<_>);

    let manager = MemoryManager::create(config, agent, workspace_root, embedder, reranker)
        .await
        .context("connect memory manager")?;

    match manager {
        Some(manager) => Ok(manager),
        None => bail!("memory backend is not `mongodb` for agent `{agent}` — check your config"),
    }
}

fn parse_tags(tags: Option<String>) -> Vec<String> {
    tags.map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn collect_kb_docs(paths: &[PathBuf], recursive: bool, tags: &[String], category: &Option<String>) -> Result<Vec<KbDocInput>> {
    let mut docs = Vec::new();
    for path in paths {
        if path.is_file() {
            if let Some(doc) = read_one(path, tags, category)? {
                docs.push(doc);
            }
            continue;
        }
        let max_depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(path)
            .max_depth(max_depth)
            .follow_links(false)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if entry.path_is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            if let Some(doc) = read_one(entry.path(), tags, category)? {
                docs.push(doc);
            }
        }
    }
    Ok(docs)
}

fn read_one(path: &std::path::Path, tags: &[String], category: &Option<String>) -> Result<Option<KbDocInput>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    if !matches!(ext, "md" | "txt") {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let title = path.file_stem().and_then(|s| s.to_str()).unwrap_or("untitled").to_string();
    Ok(Some(KbDocInput {
        title,
        content,
        source: path.to_string_lossy().to_string(),
        importer: "cli".to_string(),
        tags: tags.to_vec(),
        category: category.clone(),
    }))
}

async fn ingest(
    paths: Vec<PathBuf>,
    agent: &str,
    tags: Option<String>,
    category: Option<String>,
    force: bool,
    recursive: bool,
    verbose: bool,
) -> Result<()> {
    if paths.is_empty() {
        bail!("provide at least one path to ingest");
    }
    let manager = open_manager(agent).await?;
    let tags = parse_tags(tags);
    let docs = collect_kb_docs(&paths, recursive, &tags, &category)?;
    if docs.is_empty() {
        println!("documentsProcessed=0 chunksCreated=0 skipped=0");
        return Ok(());
    }

    let opts = KbIngestOptions {
        force,
        ..KbIngestOptions::default()
    };

    let report = manager
        .kb_ingest(&docs, &opts, |progress| {
            if verbose {
                eprintln!("  [{}/{}] {}", progress.completed, progress.total, progress.label);
            }
        })
        .await
        .context("kb ingest")?;

    println!(
        "documentsProcessed={} chunksCreated={} skipped={}",
        report.documents_processed, report.chunks_created, report.skipped
    );
    for err in &report.errors {
        eprintln!("error: {err}");
    }
    manager.close().await;
    if !report.errors.is_empty() {
        bail!("{} error(s) during ingest", report.errors.len());
    }
    Ok(())
}

async fn list(agent: &str, category: Option<String>, tags: Option<String>, json: bool) -> Result<()> {
    let manager = open_manager(agent).await?;
    let tag_filter = parse_tags(tags);
    let docs = manager.kb_list(category.as_deref(), tag_filter.first().map(String::as_str)).await?;
    manager.close().await;

    if json {
        let value: Vec<_> = docs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "title": d.title,
                    "source": d.source,
                    "tags": d.tags,
                    "category": d.category,
                    "chunkCount": d.chunk_count,
                    "updatedAt": d.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if docs.is_empty() {
        println!("no documents ingested yet");
    } else {
        for doc in &docs {
            println!(
                "{}  {:<40}  {} chunks  {}",
                doc.id,
                doc.title,
                doc.chunk_count,
                doc.category.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

async fn search(query: &str, agent: &str, max_results: usize, json: bool) -> Result<()> {
    let manager = open_manager(agent).await?;
    let results = manager.kb_search(query, max_results).await?;
    manager.close().await;

    if json {
        let value: Vec<_> = results
            .iter()
            .map(|r| {
                json!({
                    "chunkId": r.chunk_id,
                    "path": r.path,
                    "score": r.score,
                    "text": r.text,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if results.is_empty() {
        println!("no results");
    } else {
        for r in &results {
            println!("[{:.3}] {} ({}:{}-{})", r.score, r.path, r.chunk_id, r.start_line, r.end_line);
            println!("    {}", r.text.lines().next().unwrap_or(""));
        }
    }
    Ok(())
}

async fn stats(agent: &str, json: bool) -> Result<()> {
    let manager = open_manager(agent).await?;
    let stats = manager.kb_stats().await?;
    manager.close().await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "documents": stats.documents,
                "chunks": stats.chunks,
                "categories": stats.categories,
                "sourcesByType": stats.sources_by_type,
            }))?
        );
    } else {
        println!("documents: {}", stats.documents);
        println!("chunks:    {}", stats.chunks);
        println!("categories: {}", stats.categories.join(", "));
    }
    Ok(())
}

async fn remove(id: &str, agent: &str, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to remove `{id}` without --yes (no interactive confirmation in this surface)");
    }
    let manager = open_manager(agent).await?;
    let removed = manager.kb_remove(id).await?;
    manager.close().await;

    if removed {
        println!("removed {id}");
        Ok(())
    } else {
        bail!("no such document: {id}")
    }
}
