use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::MemoryConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["clawmem.toml", "clawmem.yaml", "clawmem.yml", "clawmem.json"];

static CONFIG_DIR_OVERRIDE: OnceLock<std::sync::Mutex<Option<PathBuf>>> = OnceLock::new();
static DATA_DIR_OVERRIDE: OnceLock<std::sync::Mutex<Option<PathBuf>>> = OnceLock::new();

fn override_slot(cell: &'static OnceLock<std::sync::Mutex<Option<PathBuf>>>) -> &'static std::sync::Mutex<Option<PathBuf>> {
    cell.get_or_init(|| std::sync::Mutex::new(None))
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<MemoryConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./clawmem.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/clawmem/clawmem.{toml,yaml,yml,json}` (user-global)
///
/// Returns `MemoryConfig::default()` (with env overrides applied) if no
/// config file is found.
pub fn discover_and_load() -> MemoryConfig {
    let mut cfg = if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                MemoryConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        MemoryConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/clawmem/`), honoring
/// a test/CLI override set via [`set_config_dir`].
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = override_slot(&CONFIG_DIR_OVERRIDE).lock().ok().and_then(|g| g.clone()) {
        return Some(dir);
    }
    directories::ProjectDirs::from("", "", "clawmem").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory (`~/.local/share/clawmem/` or platform
/// equivalent), honoring a test/CLI override set via [`set_data_dir`].
pub fn data_dir() -> PathBuf {
    if let Some(dir) = override_slot(&DATA_DIR_OVERRIDE).lock().ok().and_then(|g| g.clone()) {
        return dir;
    }
    directories::ProjectDirs::from("", "", "clawmem")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Override the resolved config directory (used by tests and `--config-dir`).
pub fn set_config_dir(dir: PathBuf) {
    *override_slot(&CONFIG_DIR_OVERRIDE).lock().unwrap_or_else(|e| e.into_inner()) = Some(dir);
}

/// Override the resolved data directory (used by tests and `--data-dir`).
pub fn set_data_dir(dir: PathBuf) {
    *override_slot(&DATA_DIR_OVERRIDE).lock().unwrap_or_else(|e| e.into_inner()) = Some(dir);
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clawmem.toml")
}

/// Serialize `config` to TOML and write it to the user-global config path.
///
/// Creates parent directories if needed. Returns the path written to.
pub fn save_config(config: &MemoryConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, toml_str)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<MemoryConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn parse_toml_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("clawmem.toml");
        std::fs::write(&path, "database = \"custom\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.database, "custom");
    }

    #[test]
    fn parse_yaml() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("clawmem.yaml");
        std::fs::write(&path, "database: custom-yaml\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.database, "custom-yaml");
    }

    #[test]
    fn unsupported_extension_errors() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("clawmem.ini");
        std::fs::write(&path, "database=x").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn discover_and_load_defaults_when_absent() {
        let temp = TempDir::new().expect("tempdir");
        set_config_dir(temp.path().to_path_buf());
        let cfg = discover_and_load();
        assert_eq!(cfg.database, "openclaw");
    }

    #[test]
    fn save_and_reload_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        set_config_dir(temp.path().to_path_buf());
        let mut cfg = MemoryConfig::default();
        cfg.database = "roundtrip".into();
        let path = save_config(&cfg).expect("save");
        let reloaded = load_config(&path).expect("reload");
        assert_eq!(reloaded.database, "roundtrip");
    }
}
