//! Error types for the public API surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ConfigError
// ============================================================================

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("Config validation error: {0}")]
    Validation(String),
}

// ============================================================================
// CompileError
// ============================================================================

/// Errors reported by a [`CompilerService`](crate::compiler::CompilerService).
#[derive(Debug, Error)]
pub enum CompileError {
    /// The toolchain ran and rejected the component (diagnostics included).
    #[error("{0}")]
    Toolchain(String),

    #[error("compiler IO error")]
    Io(#[from] std::io::Error),

    #[error("compiler timed out after {0:?}")]
    Timeout(Duration),

    /// The subprocess produced output the engine could not interpret.
    #[error("invalid compiler response: {0}")]
    Protocol(String),
}

// ============================================================================
// BuildError
// ============================================================================

/// Terminal result of a scheduled build.
///
/// Clone: one build can have many waiters, and each receives its own copy of
/// the single terminal result. IO errors are wrapped in `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("compile failed for `{path}`: {message}")]
    Compile { path: String, message: String },

    #[error("IO error while building `{path}`")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("build of `{path}` timed out after {limit:?}")]
    Timeout { path: String, limit: Duration },

    /// The build ended without producing a result, either because the
    /// scheduler went away or because its runner died mid-build.
    #[error("build was abandoned before completion")]
    Canceled,
}

impl BuildError {
    /// Map a compiler-side failure for `path` into a terminal build result.
    pub fn from_compile(path: &std::path::Path, err: CompileError) -> Self {
        let path = path.display().to_string();
        match err {
            CompileError::Io(source) => Self::Io {
                path,
                source: Arc::new(source),
            },
            CompileError::Timeout(limit) => Self::Timeout { path, limit },
            other => Self::Compile {
                path,
                message: other.to_string(),
            },
        }
    }

    pub fn from_io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source: Arc::new(source),
        }
    }
}

// ============================================================================
// TemplateError
// ============================================================================

/// Template loading and substitution errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("IO error when reading template `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("unknown template placeholder `${{{0}}}`")]
    UnknownPlaceholder(String),

    #[error("template exceeded {0} include expansions (include cycle?)")]
    IncludeLimit(usize),
}

// ============================================================================
// RenderError
// ============================================================================

/// Errors surfaced by [`Engine::render`](crate::engine::Engine::render).
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The compiled component was built but failed during server rendering.
    #[error("server render failed for `{path}`: {message}")]
    Ssr { path: String, message: String },
}
