//! Configuration loading, validation-free parsing, and env substitution.
//!
//! Config files: `clawmem.toml`, `clawmem.yaml`, or `clawmem.json`.
//! Searched in `./` then `~/.config/clawmem/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        config_dir, data_dir, discover_and_load, find_or_default_config_path, save_config,
        set_config_dir, set_data_dir,
    },
    schema::{
        Backend, ChunkingConfig, CitationMode, DeploymentProfile, EmbeddingMode, FusionMethod, KbConfig,
        MemoryConfig,
    },
};
