//! The resolved configuration consumed by the memory manager (spec §6).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which memory implementation the manager should use. Only `MongoDb` is
/// implemented by this workspace; the other variants round-trip through
/// config files for forward compatibility with deployments that haven't
/// migrated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Builtin,
    #[default]
    MongoDb,
    Qmd,
}

/// Narrows the defaults the capability probe otherwise infers from the live
/// server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentProfile {
    #[default]
    AtlasDefault,
    AtlasM0,
    CommunityMongot,
    CommunityBare,
}

/// `managed`: the application computes embeddings and supplies vectors.
/// `automated`: the database computes query embeddings in-engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    #[default]
    Managed,
    Automated,
}

/// Preferred hybrid search strategy (§4.7); the dispatcher falls through to
/// cheaper strategies when the preferred one is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FusionMethod {
    #[default]
    #[serde(rename = "scoreFusion")]
    ScoreFusion,
    #[serde(rename = "rankFusion")]
    RankFusion,
    #[serde(rename = "js-merge")]
    JsMerge,
}

/// Snippet citation attachment policy (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationMode {
    On,
    Off,
    #[default]
    Auto,
}

impl std::str::FromStr for CitationMode {
    type Err = std::convert::Infallible;

    /// Parse from string (case-insensitive). Never fails — defaults to `Auto`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "on" | "true" | "yes" | "always" => Self::On,
            "off" | "false" | "no" | "never" => Self::Off,
            _ => Self::Auto,
        })
    }
}

/// Chunking parameters for one corpus (workspace memory or KB documents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub tokens: usize,
    pub overlap: usize,
}

/// KB pipeline tuning (§4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    pub chunking: ChunkingConfig,
    pub max_document_size: usize,
    pub auto_import_paths: Vec<PathBuf>,
    pub auto_refresh_hours: u64,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig {
                tokens: 600,
                overlap: 100,
            },
            max_document_size: 10 * 1024 * 1024,
            auto_import_paths: Vec::new(),
            auto_refresh_hours: 24,
        }
    }
}

/// The resolved configuration the memory manager (J) consumes. Every field
/// mirrors a row of the table in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub backend: Backend,
    /// Database connection string. Env override: `OPENCLAW_MONGODB_URI`.
    pub uri: String,
    pub database: String,
    pub collection_prefix: String,
    pub deployment_profile: DeploymentProfile,
    pub embedding_mode: EmbeddingMode,
    pub fusion_method: FusionMethod,
    pub num_dimensions: usize,
    pub watch_debounce_ms: u64,
    pub change_stream_debounce_ms: u64,
    pub enable_change_streams: bool,
    pub num_candidates: usize,
    pub memory_ttl_days: u64,
    pub embedding_cache_ttl_days: u64,
    pub max_session_chunks: usize,
    pub kb: KbConfig,
    pub citations: CitationMode,

    /// Directories scanned for workspace memory files (`MEMORY.md`,
    /// `memory/**`, plus these extras). Not named directly in §6's table but
    /// implied by §4.5 Phase A's enumerator.
    pub memory_dirs: Vec<PathBuf>,
    /// Directory scanned for session transcripts (§4.5 Phase B).
    pub session_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub batch_embeddings: bool,
    pub batch_threshold: usize,
    pub llm_reranking: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            uri: "mongodb://localhost:27017".into(),
            database: "openclaw".into(),
            collection_prefix: "openclaw_".into(),
            deployment_profile: DeploymentProfile::default(),
            embedding_mode: EmbeddingMode::default(),
            fusion_method: FusionMethod::default(),
            num_dimensions: 1024,
            watch_debounce_ms: 500,
            change_stream_debounce_ms: 1000,
            enable_change_streams: false,
            num_candidates: 200,
            memory_ttl_days: 0,
            embedding_cache_ttl_days: 30,
            max_session_chunks: 50,
            kb: KbConfig::default(),
            citations: CitationMode::default(),
            memory_dirs: vec![PathBuf::from("memory")],
            session_dir: None,
            chunk_size: 400,
            chunk_overlap: 80,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            batch_embeddings: false,
            batch_threshold: 50,
            llm_reranking: false,
        }
    }
}

impl MemoryConfig {
    /// Applies environment-variable overrides named in spec §6, config value
    /// as fallback. Call once after loading, before connecting.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var("OPENCLAW_MONGODB_URI") {
            self.uri = uri;
        }
        // `numCandidates` requested above 10,000 is clamped (§8 boundary behaviors).
        self.num_candidates = self.num_candidates.min(10_000);
    }

    pub fn collection_name(&self, logical: &str) -> String {
        format!("{}{}", self.collection_prefix, logical)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn citation_mode_from_str() {
        assert_eq!("on".parse::<CitationMode>().unwrap(), CitationMode::On);
        assert_eq!("OFF".parse::<CitationMode>().unwrap(), CitationMode::Off);
        assert_eq!(
            "anything".parse::<CitationMode>().unwrap(),
            CitationMode::Auto
        );
    }

    #[test]
    fn num_candidates_clamped_by_env_overrides() {
        let mut cfg = MemoryConfig {
            num_candidates: 50_000,
            ..Default::default()
        };
        cfg.apply_env_overrides();
        assert_eq!(cfg.num_candidates, 10_000);
    }

    #[test]
    fn default_collection_prefix_applied() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.collection_name("chunks"), "openclaw_chunks");
    }

    #[test]
    #[allow(unsafe_code)] // std::env::set_var is unsafe under the 2024 edition; test runs single-threaded w.r.t. this var.
    fn uri_env_override_takes_precedence() {
        unsafe { std::env::set_var("OPENCLAW_MONGODB_URI", "mongodb://override:27017") };
        let mut cfg = MemoryConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.uri, "mongodb://override:27017");
        unsafe { std::env::remove_var("OPENCLAW_MONGODB_URI") };
    }
}
