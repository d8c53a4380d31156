//! JSON-over-stdio compiler subprocess.
//!
//! One request per invocation: the request document goes to the child's
//! stdin, the response is its stdout, diagnostics are its stderr. The child
//! owns every toolchain concern (bundler, preprocessors, caching); the
//! engine only round-trips the opaque cache token it returns.

use super::{
    CacheToken, ClientCompile, CompileRequest, CompilerService, ServerCompile, ServerComponent,
    SsrOutput,
};
use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::log;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum WireRequest<'a> {
    CompileServer {
        path: &'a Path,
        name: &'a str,
        cache_token: Option<&'a CacheToken>,
        no_cache: bool,
    },
    CompileClient {
        path: &'a Path,
        name: &'a str,
        cache_token: Option<&'a CacheToken>,
        no_cache: bool,
    },
    Render {
        module: &'a str,
        path: &'a Path,
        props: &'a serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerWire {
    module: String,
    #[serde(default)]
    css: Option<String>,
    #[serde(default)]
    cache_token: Option<CacheToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientWire {
    bundle: String,
    #[serde(default)]
    dependencies: Vec<PathBuf>,
    #[serde(default)]
    cache_token: Option<CacheToken>,
}

// ============================================================================
// SubprocessCompiler
// ============================================================================

struct Inner {
    compile: Vec<String>,
    render: Vec<String>,
    timeout: Option<Duration>,
}

pub struct SubprocessCompiler {
    inner: Arc<Inner>,
}

impl SubprocessCompiler {
    pub fn new(config: &CompilerConfig) -> Self {
        warn_if_missing(&config.compile, "compile");
        warn_if_missing(&config.render, "render");

        Self {
            inner: Arc::new(Inner {
                compile: config.compile.clone(),
                render: config.render.clone(),
                timeout: config.timeout(),
            }),
        }
    }
}

/// Warn when a configured command is not on PATH. Package runners resolve
/// their tool at run time, so they only get the benefit of the doubt.
fn warn_if_missing(argv: &[String], role: &str) {
    let Some(cmd) = argv.first() else { return };
    let is_package_runner = ["npx", "bunx", "pnpx", "yarn", "dlx"].contains(&cmd.as_str());
    if !is_package_runner && which::which(cmd).is_err() {
        log!("warning"; "{role} command `{cmd}` not found in PATH");
    }
}

async fn run_compiler(
    argv: &[String],
    timeout: Option<Duration>,
    request: &WireRequest<'_>,
) -> Result<Vec<u8>, CompileError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CompileError::Protocol("compiler command not configured".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let payload =
        serde_json::to_vec(request).map_err(|err| CompileError::Protocol(err.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await?;
        stdin.shutdown().await?;
    }

    // kill_on_drop reaps the child when the timeout abandons the wait.
    let wait = child.wait_with_output();
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| CompileError::Timeout(limit))??,
        None => wait.await?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("compiler exited with {}", output.status)
        } else {
            stderr
        };
        return Err(CompileError::Toolchain(message));
    }
    Ok(output.stdout)
}

fn parse_response<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CompileError> {
    serde_json::from_slice(bytes).map_err(|err| CompileError::Protocol(err.to_string()))
}

#[async_trait]
impl CompilerService for SubprocessCompiler {
    async fn compile_server(&self, req: &CompileRequest) -> Result<ServerCompile, CompileError> {
        let request = WireRequest::CompileServer {
            path: &req.path,
            name: &req.name,
            cache_token: req.cache_token.as_ref(),
            no_cache: req.no_cache,
        };
        let out = run_compiler(&self.inner.compile, self.inner.timeout, &request).await?;
        let wire: ServerWire = parse_response(&out)?;
        Ok(ServerCompile {
            module: wire.module,
            css: wire.css.unwrap_or_default(),
            cache_token: wire.cache_token,
        })
    }

    async fn compile_client(&self, req: &CompileRequest) -> Result<ClientCompile, CompileError> {
        let request = WireRequest::CompileClient {
            path: &req.path,
            name: &req.name,
            cache_token: req.cache_token.as_ref(),
            no_cache: req.no_cache,
        };
        let out = run_compiler(&self.inner.compile, self.inner.timeout, &request).await?;
        let wire: ClientWire = parse_response(&out)?;
        Ok(ClientCompile {
            bundle: wire.bundle,
            dependencies: wire.dependencies,
            cache_token: wire.cache_token,
        })
    }

    async fn instantiate(
        &self,
        module: &str,
        path: &Path,
    ) -> Result<Arc<dyn ServerComponent>, CompileError> {
        Ok(Arc::new(SubprocessComponent {
            inner: Arc::clone(&self.inner),
            module: module.to_string(),
            path: path.to_path_buf(),
        }))
    }
}

/// A component whose renders go through the configured render command.
struct SubprocessComponent {
    inner: Arc<Inner>,
    module: String,
    path: PathBuf,
}

#[async_trait]
impl ServerComponent for SubprocessComponent {
    async fn render(&self, props: &serde_json::Value) -> Result<SsrOutput, CompileError> {
        let request = WireRequest::Render {
            module: &self.module,
            path: &self.path,
            props,
        };
        let out = run_compiler(&self.inner.render, self.inner.timeout, &request).await?;
        parse_response(&out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompileRequest {
        CompileRequest {
            path: PathBuf::from("/site/pages/a.html"),
            name: "A".to_string(),
            cache_token: Some(CacheToken(serde_json::json!(7))),
            no_cache: false,
        }
    }

    #[test]
    fn test_wire_request_shape() {
        let req = request();
        let wire = WireRequest::CompileServer {
            path: &req.path,
            name: &req.name,
            cache_token: req.cache_token.as_ref(),
            no_cache: req.no_cache,
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains(r#""action":"compileServer""#));
        assert!(json.contains(r#""cacheToken":7"#));
        assert!(json.contains(r#""noCache":false"#));
    }

    #[tokio::test]
    async fn test_unconfigured_command_is_protocol_error() {
        let compiler = SubprocessCompiler::new(&CompilerConfig::default());
        let err = compiler.compile_server(&request()).await.unwrap_err();
        assert!(matches!(err, CompileError::Protocol(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compile_server_via_shell() {
        let config = CompilerConfig {
            compile: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; printf '{"module":"mod-a","css":"p{}","cacheToken":7}'"#
                    .to_string(),
            ],
            ..CompilerConfig::default()
        };
        let compiler = SubprocessCompiler::new(&config);

        let out = compiler.compile_server(&request()).await.unwrap();
        assert_eq!(out.module, "mod-a");
        assert_eq!(out.css, "p{}");
        assert_eq!(out.cache_token, Some(CacheToken(serde_json::json!(7))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_toolchain_failure_carries_stderr() {
        let config = CompilerConfig {
            compile: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; echo 'unexpected token' >&2; exit 1".to_string(),
            ],
            ..CompilerConfig::default()
        };
        let compiler = SubprocessCompiler::new(&config);

        let err = compiler.compile_server(&request()).await.unwrap_err();
        match err {
            CompileError::Toolchain(message) => assert!(message.contains("unexpected token")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_compiler() {
        let config = CompilerConfig {
            compile: vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            timeout_ms: 200,
            ..CompilerConfig::default()
        };
        let compiler = SubprocessCompiler::new(&config);

        let err = compiler.compile_server(&request()).await.unwrap_err();
        assert!(matches!(err, CompileError::Timeout(_)));
    }
}
