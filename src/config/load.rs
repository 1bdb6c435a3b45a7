//! Retrieval config loading.
//!
//! A profile such as `config/ollama.toml` names its parent with
//! `[meta] base = "default.toml"`; layers are read parent-first and each child
//! table overrides its parent key by key. `RAGCAG_LOG_LEVEL`,
//! `RAGCAG_LOG_FILE` and `EMBEDDING_API_KEY` are applied last.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

use super::raw::RawConfig;
use super::types::*;

/// Overlay `child` onto `parent`. Nested tables (e.g. `[rag]`) merge key by
/// key; scalars and arrays in the child replace the parent's.
fn merge_layers(parent: toml::Value, child: toml::Value) -> toml::Value {
    match (parent, child) {
        (toml::Value::Table(mut merged), toml::Value::Table(overrides)) => {
            for (key, value) in overrides {
                let value = match merged.remove(&key) {
                    Some(inherited) => merge_layers(inherited, value),
                    None => value,
                };
                merged.insert(key, value);
            }
            toml::Value::Table(merged)
        }
        (_, child) => child,
    }
}

/// Where a `[meta] base` entry in `profile` points. Relative bases resolve
/// against the profile's own directory.
fn base_of(profile: &Path, base: &str) -> PathBuf {
    if Path::new(base).is_absolute() {
        PathBuf::from(base)
    } else {
        profile.parent().unwrap_or(Path::new(".")).join(base)
    }
}

/// Read `profile` and every ancestor it names, returning the merged document.
/// A profile reached twice in one chain is a config error.
fn read_profile_chain(profile: &Path, seen: &mut HashSet<PathBuf>) -> Result<toml::Value, AppError> {
    let canonical = profile.canonicalize().unwrap_or_else(|_| profile.to_path_buf());
    if !seen.insert(canonical) {
        return Err(AppError::Config(format!("profile inherits from itself: {}", profile.display())));
    }

    let text = fs::read_to_string(profile)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", profile.display())))?;
    let layer: toml::Value = toml::from_str(&text)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", profile.display())))?;

    let base = layer.get("meta").and_then(|m| m.get("base")).and_then(toml::Value::as_str);
    match base {
        Some(base) => {
            let parent = read_profile_chain(&base_of(profile, base), seen)?;
            Ok(merge_layers(parent, layer))
        }
        None => Ok(layer),
    }
}

/// Load the profile at `config_path`, else `config/default.toml`, else the
/// built-in defaults, then apply the `RAGCAG_*` overrides.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let log_level_override = env::var("RAGCAG_LOG_LEVEL").ok();
    let log_file_override = env::var("RAGCAG_LOG_FILE").ok();

    if let Some(path) = config_path {
        return load_from(
            Path::new(path),
            log_level_override.as_deref(),
            log_file_override.as_deref(),
        );
    }

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        return load_from(
            default_path,
            log_level_override.as_deref(),
            log_file_override.as_deref(),
        );
    }

    let mut config = Config::default();
    if let Some(level) = log_level_override {
        config.log_level = level;
    }
    config.log_file = log_file_override.map(|p| expand_home(&p));
    config.embedding.api_key = env::var("EMBEDDING_API_KEY").ok();
    Ok(config)
}

/// Load one profile with explicit log overrides instead of the
/// `RAGCAG_LOG_*` variables.
pub fn load_from(
    path: &Path,
    log_level_override: Option<&str>,
    log_file_override: Option<&str>,
) -> Result<Config, AppError> {
    let merged_val = read_profile_chain(path, &mut HashSet::new())?;

    let parsed: RawConfig = Deserialize::deserialize(merged_val).map_err(|e: toml::de::Error| {
        AppError::Config(format!("config error in {}: {e}", path.display()))
    })?;

    let log_level = log_level_override.unwrap_or(&parsed.general.log_level).to_string();
    let log_file = log_file_override
        .map(str::to_string)
        .or(parsed.general.log_file)
        .map(|p| expand_home(&p));

    let r = parsed.retrieval;
    let usable = |w: f32| w.is_finite() && w >= 0.0;
    if !usable(r.rag_weight) || !usable(r.cag_weight) {
        return Err(AppError::Config(format!(
            "retrieval weights must be finite and non-negative (rag_weight={}, cag_weight={})",
            r.rag_weight, r.cag_weight
        )));
    }

    let rag = parsed.rag;
    if !rag.similarity_threshold.is_finite() {
        return Err(AppError::Config(format!(
            "rag.similarity_threshold must be a number, got {}",
            rag.similarity_threshold
        )));
    }
    if rag.chunk_size == 0 {
        return Err(AppError::Config("rag.chunk_size must be > 0".to_string()));
    }
    if rag.chunk_overlap >= rag.chunk_size {
        return Err(AppError::Config(format!(
            "rag.chunk_overlap ({}) must be smaller than rag.chunk_size ({})",
            rag.chunk_overlap, rag.chunk_size
        )));
    }

    Ok(Config {
        log_level,
        log_file,
        retrieval: RetrievalConfig {
            enable_rag: r.enable_rag,
            enable_cag: r.enable_cag,
            rag_weight: r.rag_weight,
            cag_weight: r.cag_weight,
            max_context_length: r.max_context_length,
            enable_caching: r.enable_caching,
            cache_ttl: Duration::from_secs(r.cache_ttl),
        },
        rag: RagConfig {
            vector_db: rag.vector_db,
            embedding_service: rag.embedding_service,
            collection_name: rag.collection_name,
            max_results: rag.max_results.max(1),
            similarity_threshold: rag.similarity_threshold,
            chunk_size: rag.chunk_size,
            chunk_overlap: rag.chunk_overlap,
            enable_caching: rag.enable_caching,
            cache_ttl: Duration::from_secs(rag.cache_ttl),
            allow_placeholder_embeddings: rag.allow_placeholder_embeddings,
        },
        embedding: EmbeddingConfig {
            dimension: parsed.embedding.dimension,
            api_base_url: parsed.embedding.api_base_url,
            model: parsed.embedding.model,
            timeout_seconds: parsed.embedding.timeout_seconds,
            api_key: env::var("EMBEDDING_API_KEY").ok(),
        },
        cag: CagConfig {
            knowledge_graph: parsed.cag.knowledge_graph,
            max_context_depth: parsed.cag.max_context_depth,
            max_related: parsed.cag.max_related,
            max_context_length: parsed.cag.max_context_length,
            enable_caching: parsed.cag.enable_caching,
            cache_ttl: Duration::from_secs(parsed.cag.cache_ttl),
            enable_knowledge_sources: parsed.cag.enable_knowledge_sources,
            preload_mitre: parsed.cag.preload_mitre,
        },
        fusion: FusionConfig {
            default_combine_mode: parsed.fusion.default_combine_mode,
            explicit_max_length: parsed.fusion.explicit_max_length,
        },
    })
}

/// Resolve a leading `~` in a configured path (e.g. `log_file`) against the
/// home directory; other paths pass through.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Read a `.env` file into the process environment. A missing file is not an
/// error; a file that exists but fails to parse is.
pub fn load_env_file(path: Option<&Path>) -> Result<bool, AppError> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    match loaded {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(AppError::Config(format!("failed to read .env: {e}"))),
    }
}
