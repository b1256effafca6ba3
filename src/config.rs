//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$NEWSPOOL_CONFIG` (environment variable)
//! 2. `~/.config/newspool/config.toml` (Linux/macOS)
//!    `%APPDATA%\newspool\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File and directory locations.
    pub paths: PathsConfig,
    /// Subscription defaults.
    pub subscribe: SubscribeConfig,
    /// Traversal behavior.
    pub traversal: TraversalConfig,
    /// Feedback logging.
    pub feedback: FeedbackConfig,
    /// Performance tuning.
    pub performance: PerformanceConfig,
    /// General behavior settings.
    pub general: GeneralConfig,
}

/// File and directory locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the article spool.
    pub spool_dir: PathBuf,
    /// The active file.
    pub active: PathBuf,
    /// The history database.
    pub history: PathBuf,
    /// Administrative flags overlay (optional; missing is fine).
    pub admin: Option<PathBuf>,
    /// Per-user subscription file. Defaults to `~/.newsrc`.
    pub newsrc: Option<PathBuf>,
}

/// Subscription defaults for first-time users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeConfig {
    /// Pattern for the generated default newsrc, e.g. `"general,all.announce"`.
    pub default_groups: String,
    /// Create ancestor groups when creating dotted names.
    pub make_parents: bool,
}

/// Traversal behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Follow reply chains before sequential order.
    pub thread: bool,
    /// Visit already-read articles.
    pub reread: bool,
    /// Walk high-to-low.
    pub reverse: bool,
}

/// Feedback logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Where session ratings are appended. None disables the sweep.
    pub log: Option<PathBuf>,
    /// Groups whose ratings are never logged.
    pub quiet: String,
}

/// Performance tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Number of decoded articles in the LRU cache.
    pub article_cache_size: usize,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

// ── Default implementations ─────────────────────────────────────

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/var/spool/news"),
            active: PathBuf::from("/var/lib/news/active"),
            history: PathBuf::from("/var/lib/news/history"),
            admin: None,
            newsrc: None,
        }
    }
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            default_groups: "general".to_string(),
            make_parents: true,
        }
    }
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            thread: true,
            reread: false,
            reverse: false,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            log: None,
            quiet: String::new(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            article_cache_size: 50,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// The newsrc path, honoring the override.
    pub fn newsrc_path(&self) -> PathBuf {
        if let Some(path) = &self.paths.newsrc {
            return path.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".newsrc")
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    // 1. Environment variable override
    if let Ok(env_path) = std::env::var("NEWSPOOL_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    // 2. Standard config directory
    dirs::config_dir().map(|d| d.join("newspool").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("newspool")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("newspool.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.paths.spool_dir, PathBuf::from("/var/spool/news"));
        assert!(cfg.traversal.thread);
        assert!(!cfg.traversal.reread);
        assert_eq!(cfg.performance.article_cache_size, 50);
        assert_eq!(cfg.general.log_level, "warn");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [paths]
            spool_dir = "/tmp/spool"

            [traversal]
            reverse = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.paths.spool_dir, PathBuf::from("/tmp/spool"));
        assert!(cfg.traversal.reverse);
        assert!(cfg.traversal.thread, "unset fields keep their defaults");
        assert_eq!(cfg.subscribe.default_groups, "general");
    }

    #[test]
    fn test_roundtrip_serialization() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.general.log_level, cfg.general.log_level);
    }
}
