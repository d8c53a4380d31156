//! Test doubles shared across module tests.
//!
//! Instrumented stand-ins for the three external seams: the build
//! runner, the compiler toolchain, and the filesystem watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::compiler::{
    CacheToken, ClientCompile, CompileRequest, CompilerService, ServerCompile, ServerComponent,
    SsrOutput,
};
use crate::error::{BuildError, CompileError};
use crate::page::Page;
use crate::scheduler::{BuildOptions, BuildRunner};
use crate::watch::{ChangeFn, DependencyWatcher, WatchHandle};

/// Poll `cond` until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

// =============================================================================
// GatedRunner
// =============================================================================

/// Build runner whose builds block on a semaphore until released, so
/// tests control exactly when each build finishes.
pub struct GatedRunner {
    gate: Semaphore,
    started: Mutex<Vec<PathBuf>>,
    seen: Mutex<Vec<(PathBuf, BuildOptions)>>,
    finished: AtomicUsize,
    fail: DashMap<PathBuf, String>,
}

impl GatedRunner {
    /// Runner whose builds wait for [`release`](Self::release).
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
            fail: DashMap::new(),
        })
    }

    /// Runner whose builds complete immediately.
    pub fn open() -> Arc<Self> {
        let runner = Self::gated();
        runner.gate.add_permits(Semaphore::MAX_PERMITS);
        runner
    }

    /// Let `n` blocked builds run to completion, oldest first.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Make builds of `path` fail with a compile error.
    pub fn fail_with(&self, path: &Path, message: &str) {
        self.fail.insert(path.to_path_buf(), message.to_string());
    }

    /// Paths in dispatch order.
    pub fn started(&self) -> Vec<PathBuf> {
        self.started.lock().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, path: &Path) -> usize {
        self.seen.lock().iter().filter(|(p, _)| p == path).count()
    }

    pub fn options_for(&self, path: &Path) -> Vec<BuildOptions> {
        self.seen
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, options)| *options)
            .collect()
    }
}

#[async_trait]
impl BuildRunner for GatedRunner {
    async fn run_build(&self, page: &Arc<Page>, options: BuildOptions) -> Result<(), BuildError> {
        self.started.lock().push(page.path().to_path_buf());
        self.seen.lock().push((page.path().to_path_buf(), options));

        self.gate.acquire().await.expect("gate closed").forget();
        self.finished.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.fail.get(page.path()) {
            return Err(BuildError::Compile {
                path: page.path().display().to_string(),
                message: message.clone(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// MockCompiler
// =============================================================================

/// In-process compiler with canned output and failure injection.
///
/// Server compiles return `module:<Name>` as the module reference;
/// instantiating that reference yields a component whose markup is the
/// JSON of its props, which lets render tests assert on prop filtering.
pub struct MockCompiler {
    server_calls: AtomicUsize,
    client_calls: AtomicUsize,
    instantiate_calls: AtomicUsize,
    render_calls: Arc<AtomicUsize>,
    server_requests: Mutex<Vec<CompileRequest>>,
    client_requests: Mutex<Vec<CompileRequest>>,
    fail_server: DashMap<PathBuf, String>,
    fail_client: DashMap<PathBuf, String>,
    fail_instantiate: AtomicBool,
    fail_render: Arc<AtomicBool>,
    dependencies: DashMap<PathBuf, Vec<PathBuf>>,
    server_token: Mutex<Option<CacheToken>>,
    client_token: Mutex<Option<CacheToken>>,
}

impl MockCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            server_calls: AtomicUsize::new(0),
            client_calls: AtomicUsize::new(0),
            instantiate_calls: AtomicUsize::new(0),
            render_calls: Arc::new(AtomicUsize::new(0)),
            server_requests: Mutex::new(Vec::new()),
            client_requests: Mutex::new(Vec::new()),
            fail_server: DashMap::new(),
            fail_client: DashMap::new(),
            fail_instantiate: AtomicBool::new(false),
            fail_render: Arc::new(AtomicBool::new(false)),
            dependencies: DashMap::new(),
            server_token: Mutex::new(Some(CacheToken(serde_json::json!({"from": "server"})))),
            client_token: Mutex::new(Some(CacheToken(serde_json::json!({"from": "client"})))),
        })
    }

    pub fn fail_server_with(&self, path: &Path, message: &str) {
        self.fail_server.insert(path.to_path_buf(), message.to_string());
    }

    pub fn fail_client_with(&self, path: &Path, message: &str) {
        self.fail_client.insert(path.to_path_buf(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_server.clear();
        self.fail_client.clear();
    }

    pub fn fail_instantiate(&self, fail: bool) {
        self.fail_instantiate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_render(&self, fail: bool) {
        self.fail_render.store(fail, Ordering::SeqCst);
    }

    /// Dependency list reported for client compiles of `path`. Without
    /// one, the page's own source is the only dependency.
    pub fn set_dependencies(&self, path: &Path, deps: Vec<PathBuf>) {
        self.dependencies.insert(path.to_path_buf(), deps);
    }

    pub fn set_server_token(&self, token: Option<CacheToken>) {
        *self.server_token.lock() = token;
    }

    pub fn set_client_token(&self, token: Option<CacheToken>) {
        *self.client_token.lock() = token;
    }

    pub fn server_compiles(&self) -> usize {
        self.server_calls.load(Ordering::SeqCst)
    }

    pub fn client_compiles(&self) -> usize {
        self.client_calls.load(Ordering::SeqCst)
    }

    pub fn instantiations(&self) -> usize {
        self.instantiate_calls.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }

    pub fn server_requests(&self) -> Vec<CompileRequest> {
        self.server_requests.lock().clone()
    }

    pub fn client_requests(&self) -> Vec<CompileRequest> {
        self.client_requests.lock().clone()
    }
}

#[async_trait]
impl CompilerService for MockCompiler {
    async fn compile_server(&self, req: &CompileRequest) -> Result<ServerCompile, CompileError> {
        self.server_calls.fetch_add(1, Ordering::SeqCst);
        self.server_requests.lock().push(req.clone());

        if let Some(message) = self.fail_server.get(&req.path) {
            return Err(CompileError::Toolchain(message.clone()));
        }

        Ok(ServerCompile {
            module: format!("module:{}", req.name),
            css: format!(".{} {{ color: red }}", req.name),
            cache_token: self.server_token.lock().clone(),
        })
    }

    async fn compile_client(&self, req: &CompileRequest) -> Result<ClientCompile, CompileError> {
        self.client_calls.fetch_add(1, Ordering::SeqCst);
        self.client_requests.lock().push(req.clone());

        if let Some(message) = self.fail_client.get(&req.path) {
            return Err(CompileError::Toolchain(message.clone()));
        }

        let dependencies = self
            .dependencies
            .get(&req.path)
            .map(|deps| deps.clone())
            .unwrap_or_else(|| vec![req.path.clone()]);

        Ok(ClientCompile {
            bundle: format!("// bundle {}", req.name),
            dependencies,
            cache_token: self.client_token.lock().clone(),
        })
    }

    async fn instantiate(
        &self,
        module: &str,
        _path: &Path,
    ) -> Result<Arc<dyn ServerComponent>, CompileError> {
        self.instantiate_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_instantiate.load(Ordering::SeqCst) {
            return Err(CompileError::Protocol(format!(
                "cannot instantiate `{module}`"
            )));
        }

        Ok(Arc::new(EchoComponent {
            module: module.to_string(),
            renders: Arc::clone(&self.render_calls),
            fail: Arc::clone(&self.fail_render),
        }))
    }
}

/// Component returned by [`MockCompiler::instantiate`].
pub struct EchoComponent {
    module: String,
    renders: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl ServerComponent for EchoComponent {
    async fn render(&self, props: &serde_json::Value) -> Result<SsrOutput, CompileError> {
        self.renders.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(CompileError::Toolchain("render exploded".to_string()));
        }

        Ok(SsrOutput {
            head: format!("<meta name=\"module\" content=\"{}\">", self.module),
            html: serde_json::to_string(props).map_err(|e| CompileError::Protocol(e.to_string()))?,
        })
    }
}

// =============================================================================
// MockWatcher
// =============================================================================

/// Watcher that records watch sets and lets tests fire changes by hand.
pub struct MockWatcher {
    watches: Mutex<Vec<MockWatch>>,
}

pub struct MockWatch {
    pub paths: Vec<PathBuf>,
    on_change: ChangeFn,
    closed: Arc<AtomicBool>,
}

struct MockHandle {
    closed: Arc<AtomicBool>,
}

impl WatchHandle for MockHandle {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MockWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            watches: Mutex::new(Vec::new()),
        })
    }

    /// Deliver a change for `path` to every open watch covering it.
    pub fn fire(&self, path: &Path) {
        let callbacks: Vec<ChangeFn> = self
            .watches
            .lock()
            .iter()
            .filter(|watch| {
                !watch.closed.load(Ordering::SeqCst) && watch.paths.iter().any(|p| p == path)
            })
            .map(|watch| Arc::clone(&watch.on_change))
            .collect();

        for callback in callbacks {
            callback(path);
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn open_watch_count(&self) -> usize {
        self.watches
            .lock()
            .iter()
            .filter(|watch| !watch.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Paths of the most recent watch.
    pub fn last_watch_paths(&self) -> Vec<PathBuf> {
        self.watches
            .lock()
            .last()
            .map(|watch| watch.paths.clone())
            .unwrap_or_default()
    }
}

impl DependencyWatcher for MockWatcher {
    fn watch(&self, paths: &[PathBuf], on_change: ChangeFn) -> anyhow::Result<Box<dyn WatchHandle>> {
        let closed = Arc::new(AtomicBool::new(false));
        self.watches.lock().push(MockWatch {
            paths: paths.to_vec(),
            on_change,
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(MockHandle { closed }))
    }
}
