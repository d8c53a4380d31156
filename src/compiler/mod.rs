//! The compiler seam.
//!
//! The engine never compiles components itself; it talks to a
//! [`CompilerService`] that owns the actual toolchain. The bundled
//! implementation ([`subprocess::SubprocessCompiler`]) shells out to a
//! configured command with JSON over stdio. Tests plug in an in-process
//! fake.

pub mod subprocess;

use crate::error::CompileError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Requests and artifacts
// ============================================================================

/// Opaque incremental-compile state, round-tripped to the compiler on the
/// next build of the same page. The engine never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheToken(pub serde_json::Value);

impl From<serde_json::Value> for CacheToken {
    fn from(value: serde_json::Value) -> Self {
        CacheToken(value)
    }
}

/// One compile request for one page.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Canonical source path of the page component.
    pub path: PathBuf,
    /// Component constructor name derived from the file stem.
    pub name: String,
    /// Token returned by the previous compile of this page, if any.
    pub cache_token: Option<CacheToken>,
    /// Ignore any compiler-side caches for this build.
    pub no_cache: bool,
}

/// Result of compiling the server side of a component.
#[derive(Debug, Clone)]
pub struct ServerCompile {
    /// Opaque module reference, later passed to
    /// [`CompilerService::instantiate`].
    pub module: String,
    /// Extracted stylesheet.
    pub css: String,
    pub cache_token: Option<CacheToken>,
}

/// Result of compiling the client side of a component.
#[derive(Debug, Clone)]
pub struct ClientCompile {
    /// Browser bundle.
    pub bundle: String,
    /// Every file the build consumed; this is the page's watch set.
    pub dependencies: Vec<PathBuf>,
    pub cache_token: Option<CacheToken>,
}

/// Markup produced by server-rendering a component.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SsrOutput {
    #[serde(default)]
    pub head: String,
    pub html: String,
}

// ============================================================================
// Traits
// ============================================================================

/// The toolchain boundary.
///
/// Implementations must be cheap to call concurrently; the build scheduler
/// dispatches up to its concurrency limit of compiles at once.
#[async_trait]
pub trait CompilerService: Send + Sync {
    async fn compile_server(&self, req: &CompileRequest) -> Result<ServerCompile, CompileError>;

    async fn compile_client(&self, req: &CompileRequest) -> Result<ClientCompile, CompileError>;

    /// Turn a persisted module reference back into a renderable component.
    async fn instantiate(
        &self,
        module: &str,
        path: &Path,
    ) -> Result<Arc<dyn ServerComponent>, CompileError>;
}

/// A compiled component that can server-render itself.
#[async_trait]
pub trait ServerComponent: Send + Sync {
    async fn render(&self, props: &serde_json::Value) -> Result<SsrOutput, CompileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_token_is_transparent_json() {
        let token = CacheToken(serde_json::json!({"rollup": [1, 2]}));
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"{"rollup":[1,2]}"#);

        let back: CacheToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn test_ssr_output_head_defaults_empty() {
        let out: SsrOutput = serde_json::from_str(r#"{"html":"<p>x</p>"}"#).unwrap();
        assert_eq!(out.head, "");
        assert_eq!(out.html, "<p>x</p>");
    }
}
