//! Engine configuration.
//!
//! Loaded from TOML (typically `vista.toml` next to the site) or built in
//! code and finalized against a root directory. Unknown keys are collected
//! with `serde_ignored` and reported as warnings instead of failing the
//! load.

use crate::error::ConfigError;
use crate::log;
use crate::utils::path::normalize_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// EngineConfig
// ============================================================================

/// Top-level configuration for [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory containing page components.
    pub dir: PathBuf,

    /// Source file extension of page components (without dot).
    #[serde(rename = "type")]
    pub page_ext: String,

    /// Path to the page template.
    pub template: PathBuf,

    /// Directory holding build manifests.
    pub build_dir: PathBuf,

    /// Watch dependencies and rebuild pages on change.
    pub watch: bool,

    /// Enable `debug!` output.
    pub verbose: bool,

    /// Maximum builds in flight; 0 means one per available core.
    pub build_concurrency: usize,

    /// How long after the last heartbeat a page still counts as active.
    pub idle_timeout_ms: u64,

    /// Delay before an inactive page is rebuilt after a dependency change.
    pub rebuild_grace_ms: u64,

    /// Locals keys stripped from props before server rendering.
    pub exclude_locals: Vec<String>,

    pub live_reload: LiveReloadConfig,
    pub compiler: CompilerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("pages"),
            page_ext: "html".to_string(),
            template: PathBuf::from("template.html"),
            build_dir: PathBuf::from("build"),
            watch: false,
            verbose: false,
            build_concurrency: 0,
            idle_timeout_ms: 30_000,
            rebuild_grace_ms: 300,
            exclude_locals: vec![
                "_locals".to_string(),
                "settings".to_string(),
                "cache".to_string(),
            ],
            live_reload: LiveReloadConfig::default(),
            compiler: CompilerConfig::default(),
        }
    }
}

/// Live-reload WebSocket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveReloadConfig {
    pub enabled: bool,
    /// Preferred port; the server walks forward when it is taken.
    pub port: u16,
}

impl Default for LiveReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 35729,
        }
    }
}

/// Out-of-process compiler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Argv invoked for compile requests, e.g. `["node", "compile.js"]`.
    pub compile: Vec<String>,

    /// Argv invoked for server-render requests.
    pub render: Vec<String>,

    /// Wall-clock limit per compiler invocation; 0 disables the limit.
    pub timeout_ms: u64,

    /// Dependency extensions whose changes invalidate the compiler cache
    /// token. Preprocessor outputs are not incrementally safe.
    pub cache_bust_exts: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            compile: Vec::new(),
            render: Vec::new(),
            timeout_ms: 0,
            cache_bust_exts: vec!["scss".to_string(), "sass".to_string()],
        }
    }
}

impl CompilerConfig {
    /// Whether a change to `path` must clear the page's cache token.
    pub fn busts_cache(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.cache_bust_exts.iter().any(|e| e == ext))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

// ============================================================================
// Loading
// ============================================================================

impl EngineConfig {
    /// Load configuration from a TOML file and finalize paths against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (mut config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            Self::print_unknown_fields_warning(&ignored, path);
        }

        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.finalize(&root);
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (paths stay as written).
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Print warning about unknown fields.
    fn print_unknown_fields_warning(fields: &[String], path: &Path) {
        let display_path = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        log!("warning"; "unknown fields in {}, ignoring:", display_path);
        for field in fields {
            eprintln!("- {field}");
        }
    }

    /// Resolve configured paths against `root` (with tilde expansion) and
    /// normalize them. Call once before handing the config to the engine.
    pub fn finalize(&mut self, root: &Path) {
        self.dir = expand_path(&self.dir, root);
        self.template = expand_path(&self.template, root);
        self.build_dir = expand_path(&self.build_dir, root);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation("`dir` must not be empty".into()));
        }
        if self.template.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "`template` must not be empty".into(),
            ));
        }
        if self.page_ext.is_empty() || self.page_ext.starts_with('.') {
            return Err(ConfigError::Validation(format!(
                "`type` must be a bare extension, got `{}`",
                self.page_ext
            )));
        }
        Ok(())
    }

    /// Effective build concurrency (configured value, or one per core).
    pub fn concurrency(&self) -> usize {
        if self.build_concurrency > 0 {
            self.build_concurrency
        } else {
            std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn rebuild_grace(&self) -> Duration {
        Duration::from_millis(self.rebuild_grace_ms)
    }
}

/// Normalize a configured path with tilde expansion.
fn expand_path(path: &Path, root: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(path.to_str().unwrap_or_default()).into_owned();
    let path = PathBuf::from(expanded);
    let full_path = if path.is_relative() {
        root.join(&path)
    } else {
        path
    };
    normalize_path(&full_path)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.page_ext, "html");
        assert_eq!(config.live_reload.port, 35729);
        assert!(!config.live_reload.enabled);
        assert!(config.concurrency() >= 1);
        assert_eq!(config.rebuild_grace(), Duration::from_millis(300));
        assert!(config.compiler.timeout().is_none());
    }

    #[test]
    fn test_from_str() {
        let config = EngineConfig::from_str(
            r#"
dir = "views"
type = "svelte"
build_concurrency = 2

[live_reload]
enabled = true
port = 8081

[compiler]
compile = ["node", "compile.js"]
timeout_ms = 30000
"#,
        )
        .unwrap();
        assert_eq!(config.dir, PathBuf::from("views"));
        assert_eq!(config.page_ext, "svelte");
        assert_eq!(config.concurrency(), 2);
        assert!(config.live_reload.enabled);
        assert_eq!(config.live_reload.port, 8081);
        assert_eq!(config.compiler.compile[0], "node");
        assert_eq!(config.compiler.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_unknown_fields_are_collected() {
        let (_, ignored) = EngineConfig::parse_with_ignored(
            r#"
dir = "views"
no_such_key = true

[compiler]
also_unknown = 1
"#,
        )
        .unwrap();
        assert_eq!(ignored, vec!["no_such_key", "compiler.also_unknown"]);
    }

    #[test]
    fn test_validation_rejects_dotted_ext() {
        let err = EngineConfig::from_str("type = \".svelte\"").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_finalize_resolves_relative_paths() {
        let mut config = EngineConfig::default();
        config.finalize(Path::new("/srv/site"));
        assert_eq!(config.dir, PathBuf::from("/srv/site/pages"));
        assert_eq!(config.build_dir, PathBuf::from("/srv/site/build"));
        assert!(config.template.is_absolute());
    }

    #[test]
    fn test_busts_cache() {
        let config = CompilerConfig::default();
        assert!(config.busts_cache(Path::new("/site/style/main.scss")));
        assert!(!config.busts_cache(Path::new("/site/pages/index.html")));
        assert!(!config.busts_cache(Path::new("/site/Makefile")));
    }
}
