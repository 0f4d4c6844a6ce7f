//! Document types for the memory/KB collections (§3) and the schema
//! provisioner (§4.2). All operations here must be safe to call on an
//! already-provisioned database — `ensure_schema` is idempotent.

use std::time::Duration;

use {
    bson::doc,
    chrono::{DateTime, Utc},
    mongodb::{
        Database, IndexModel,
        options::{IndexOptions, SearchIndexModel},
    },
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use moltis_config::MemoryConfig;

/// A tracked file row (`files` collection, §3). Primary key is the
/// workspace-relative path. Snake_case on the wire — nothing queries this
/// collection with raw camelCase keys (the TTL index in `ensure_schema`
/// targets `updated_at` directly), so no rename is needed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDoc {
    #[serde(rename = "_id")]
    pub path: String,
    /// `memory` or `sessions`.
    pub source: String,
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
    pub updated_at: DateTime<Utc>,
}

/// A chunk row (`chunks` collection, §3). Primary key is the composite
/// `path:startLine:endLine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
    /// `success` / `failed` / `pending`.
    pub embedding_status: String,
    pub embedding_model: String,
    pub updated_at: DateTime<Utc>,
}

impl ChunkDoc {
    pub fn compose_id(path: &str, start_line: i64, end_line: i64) -> String {
        format!("{path}:{start_line}:{end_line}")
    }
}

/// A knowledge-base document (`kb_documents` collection, §3). Primary key is
/// a random UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbDocumentDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub content: String,
    /// File path / URL / `manual` / `api`.
    pub source: String,
    pub importer: String,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub content_hash: String,
    pub chunk_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// A knowledge-base chunk (`kb_chunks` collection, §3). Primary key is
/// `docId:startLine:endLine` here (implementation free per spec).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbChunkDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub doc_id: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_status: String,
    pub embedding_model: String,
    pub updated_at: DateTime<Utc>,
}

impl KbChunkDoc {
    pub fn compose_id(doc_id: &str, start_line: i64, end_line: i64) -> String {
        format!("{doc_id}:{start_line}:{end_line}")
    }
}

/// A typed structured-memory observation (`structured_memory` collection,
/// §3, §4.9). Primary key is `(type, key, agentId)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredMemoryDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub agent_id: String,
    pub value: String,
    pub context: Option<String>,
    pub confidence: f64,
    pub source: String,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StructuredMemoryDoc {
    pub fn compose_id(kind: &str, key: &str, agent_id: &str) -> String {
        format!("{kind}:{key}:{agent_id}")
    }
}

/// Cached embedding (`embedding_cache` collection, §3). Primary key is
/// `textHash:model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingCacheDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingCacheDoc {
    pub fn compose_id(model: &str, text_hash: &str) -> String {
        format!("{text_hash}:{model}")
    }
}

/// Singleton-per-agent key/value store (`meta` collection, §3): capability
/// cache, last sync token, change-stream resume point.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetaDoc {
    #[serde(rename = "_id")]
    pub agent_id: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub change_stream_resume_token: Option<bson::Bson>,
    pub transactions_degraded: bool,
}

/// Idempotently ensures the collections, standard indexes, and (when
/// supported) search indexes described in §4.2 exist.
pub async fn ensure_schema(
    db: &Database,
    config: &MemoryConfig,
    features: crate::capability::Features,
) -> anyhow::Result<()> {
    let files = config.collection_name("files");
    let chunks = config.collection_name("chunks");
    let kb_documents = config.collection_name("kb_documents");
    let kb_chunks = config.collection_name("kb_chunks");
    let structured_memory = config.collection_name("structured_memory");
    let embedding_cache = config.collection_name("embedding_cache");
    let meta = config.collection_name("meta");

    for name in [
        files.as_str(),
        chunks.as_str(),
        kb_documents.as_str(),
        kb_chunks.as_str(),
        structured_memory.as_str(),
        embedding_cache.as_str(),
        meta.as_str(),
    ] {
        ensure_collection_exists(db, name).await?;
    }

    ensure_standard_text_index(db, &chunks, "chunk_text_fts").await?;
    ensure_standard_text_index(db, &kb_chunks, "kb_chunk_text_fts").await?;

    if features.vector_search && config.embedding_mode == moltis_config::EmbeddingMode::Managed {
        ensure_vector_index(db, &chunks, "chunk_vector_idx", config.num_dimensions).await?;
        ensure_vector_index(db, &kb_chunks, "kb_chunk_vector_idx", config.num_dimensions).await?;
    }

    if config.embedding_cache_ttl_days > 0 {
        ensure_ttl_index(
            db,
            &embedding_cache,
            "created_at",
            "embedding_cache_ttl",
            config.embedding_cache_ttl_days,
        )
        .await?;
    }

    if config.memory_ttl_days > 0 {
        ensure_ttl_index(db, &files, "updated_at", "files_ttl", config.memory_ttl_days).await?;
    }

    Ok(())
}

/// Mongo creates collections lazily on first write, but an empty collection
/// with pre-built indexes is what later provisioning steps expect — create
/// it explicitly so index creation below never races a first insert.
async fn ensure_collection_exists(db: &Database, name: &str) -> anyhow::Result<()> {
    let existing: Vec<String> = db.list_collection_names().await?;
    if existing.iter().any(|n| n == name) {
        return Ok(());
    }
    match db.create_collection(name).await {
        Ok(()) => debug!(collection = name, "created collection"),
        Err(e) => {
            // Racing provisioners (two agents starting concurrently) both
            // calling create_collection is expected; only surface genuine
            // failures.
            if !e.to_string().to_lowercase().contains("already exists") {
                return Err(e.into());
            }
        },
    }
    Ok(())
}

async fn ensure_standard_text_index(
    db: &Database,
    collection: &str,
    index_name: &str,
) -> anyhow::Result<()> {
    let coll = db.collection::<bson::Document>(collection);
    let model = IndexModel::builder()
        .keys(doc! { "text": "text" })
        .options(IndexOptions::builder().name(index_name.to_string()).build())
        .build();
    match coll.create_index(model).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.to_string().to_lowercase().contains("already exists") {
                Ok(())
            } else {
                warn!(collection, error = %e, "failed to create text index");
                Err(e.into())
            }
        },
    }
}

async fn ensure_ttl_index(
    db: &Database,
    collection: &str,
    field: &str,
    index_name: &str,
    ttl_days: u64,
) -> anyhow::Result<()> {
    let coll = db.collection::<bson::Document>(collection);
    let model = IndexModel::builder()
        .keys(doc! { field: 1 })
        .options(
            IndexOptions::builder()
                .name(index_name.to_string())
                .expire_after(Some(Duration::from_secs(ttl_days * 86_400)))
                .build(),
        )
        .build();
    match coll.create_index(model).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.to_string().to_lowercase().contains("already exists") {
                Ok(())
            } else {
                warn!(collection, error = %e, "failed to create TTL index");
                Err(e.into())
            }
        },
    }
}

/// Vector index creation goes through `createSearchIndexes` (Atlas Search /
/// `mongot`); on deployments without a search engine this is gated out by
/// `features.vector_search` before we ever call it.
async fn ensure_vector_index(
    db: &Database,
    collection: &str,
    index_name: &str,
    num_dimensions: usize,
) -> anyhow::Result<()> {
    let coll = db.collection::<bson::Document>(collection);
    let definition = doc! {
        "fields": [{
            "type": "vector",
            "path": "embedding",
            "numDimensions": num_dimensions as i32,
            "similarity": "cosine",
        }]
    };
    let model = SearchIndexModel::builder()
        .name(Some(index_name.to_string()))
        .definition(definition)
        .index_type(Some(mongodb::options::SearchIndexType::VectorSearch))
        .build();
    match coll.create_search_index(model).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("already exists") || msg.contains("duplicate") {
                Ok(())
            } else {
                warn!(collection, error = %e, "failed to create vector search index");
                // Non-fatal: callers gated this by `features.vector_search`
                // already, so a failure here just means a degraded search
                // dispatcher at query time.
                Ok(())
            }
        },
    }
}
