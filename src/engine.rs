//! Engine facade.
//!
//! [`Engine`] ties the subsystems together: page identity and lookup,
//! the render pipeline (build on demand, server render, template
//! substitution), whole-site build and restore sweeps, and the
//! live-reload surface. One engine instance serves one pages directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use jwalk::WalkDir;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::artifact::ArtifactStore;
use crate::builder::PageBuilder;
use crate::compiler::CompilerService;
use crate::compiler::subprocess::SubprocessCompiler;
use crate::config::EngineConfig;
use crate::error::{BuildError, RenderError};
use crate::log;
use crate::logger::{self, ProgressLine};
use crate::page::Page;
use crate::reload::server::ReloadServer;
use crate::reload::{ActivityTracker, LiveReloadHub, ReloadNotice};
use crate::scheduler::{BuildOptions, BuildScheduler, Priority};
use crate::template::{Template, TemplateVars};
use crate::utils::path::normalize_path;
use crate::watch::{ChangeFn, DependencyWatcher, NotifyWatcher, WatchHandle};

// ============================================================================
// Engine
// ============================================================================

/// Component view-rendering engine.
///
/// Resolves names to pages, builds them through the scheduler when they
/// are not ready, and assembles rendered documents from the stored
/// artifacts and the page template.
pub struct Engine {
    config: EngineConfig,
    pages: DashMap<PathBuf, Arc<Page>>,
    scheduler: Arc<BuildScheduler>,
    builder: Arc<PageBuilder>,
    store: Arc<ArtifactStore>,
    template: Arc<Template>,
    tracker: Arc<ActivityTracker>,
    hub: Arc<LiveReloadHub>,
    reload_server: Option<ReloadServer>,
    _template_watch: Option<Box<dyn WatchHandle>>,
}

impl Engine {
    /// Create an engine that compiles through the configured subprocess
    /// toolchain. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let compiler = Arc::new(SubprocessCompiler::new(&config.compiler));
        Self::with_compiler(config, compiler)
    }

    /// Create an engine with a caller-provided compiler service.
    pub fn with_compiler(
        mut config: EngineConfig,
        compiler: Arc<dyn CompilerService>,
    ) -> Result<Self> {
        if config.verbose {
            logger::set_verbose(true);
        }

        let runtime =
            Handle::try_current().context("engine must be created inside a tokio runtime")?;

        // Canonical directories keep page identity stable no matter how
        // callers spell the paths.
        config.dir = normalize_path(&config.dir);
        config.build_dir = normalize_path(&config.build_dir);
        config.template = normalize_path(&config.template);

        let template = Arc::new(
            Template::new(&config.template)
                .with_context(|| format!("loading template {}", config.template.display()))?,
        );

        let tracker = Arc::new(ActivityTracker::new(config.idle_timeout()));
        let hub = Arc::new(LiveReloadHub::new());
        let store = Arc::new(ArtifactStore::new(
            config.build_dir.clone(),
            config.dir.clone(),
        ));
        let watcher: Arc<dyn DependencyWatcher> = Arc::new(NotifyWatcher);

        let builder = PageBuilder::new(
            &config,
            compiler,
            Arc::clone(&store),
            Arc::clone(&watcher),
            Arc::clone(&tracker),
            Arc::clone(&hub),
            runtime.clone(),
        );
        let scheduler = BuildScheduler::new(builder.clone(), config.concurrency(), runtime);
        builder.bind_scheduler(&scheduler);

        let reload_server = if config.live_reload.enabled {
            Some(ReloadServer::spawn(
                &config.live_reload,
                &hub,
                Arc::clone(&tracker),
            )?)
        } else {
            None
        };

        let template_watch = if config.watch {
            watch_template(&watcher, &template)
        } else {
            None
        };

        Ok(Self {
            config,
            pages: DashMap::new(),
            scheduler,
            builder,
            store,
            template,
            tracker,
            hub,
            reload_server,
            _template_watch: template_watch,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ====== Page identity ======

    /// Resolve a page name or path to its canonical source path.
    ///
    /// Absolute paths are used as given. Anything else is taken relative
    /// to the pages directory, with the configured extension appended
    /// when the name has none.
    pub fn resolve(&self, name: impl AsRef<Path>) -> PathBuf {
        let name = name.as_ref();
        if name.is_absolute() {
            return normalize_path(name);
        }

        let mut path = self.config.dir.join(name);
        if path.extension().is_none() {
            path.set_extension(&self.config.page_ext);
        }
        normalize_path(&path)
    }

    /// Get or create the page for a resolved source path.
    pub fn page(&self, path: &Path) -> Arc<Page> {
        self.pages
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                let rel = path
                    .strip_prefix(&self.config.dir)
                    .unwrap_or(path)
                    .to_path_buf();
                Page::new(path.to_path_buf(), rel)
            })
            .clone()
    }

    // ====== Rendering ======

    /// Render a page to a complete document.
    ///
    /// Builds the page first when it is not ready, so the first request
    /// for a page (and any request after a dependency change) waits for
    /// the compile. `locals` become the component's props after the
    /// configured `exclude_locals` keys are stripped.
    pub async fn render(
        &self,
        name: impl AsRef<Path>,
        locals: &Value,
    ) -> Result<String, RenderError> {
        let path = self.resolve(name);
        let page = self.page(&path);

        self.tracker.heartbeat(&path);

        if !page.is_ready() {
            self.scheduler
                .build(&page, Priority::Active, BuildOptions::default())
                .await?;
        }

        let artifacts = match self.store.get(&path) {
            Some(artifacts) => artifacts,
            None => {
                // Ready page whose artifacts were evicted, e.g. by a
                // concurrent build_all() sweep. Rebuild before giving up.
                self.scheduler
                    .build(
                        &page,
                        Priority::Active,
                        BuildOptions {
                            force: true,
                            ..BuildOptions::default()
                        },
                    )
                    .await?;
                self.store.get(&path).ok_or(BuildError::Canceled)?
            }
        };

        let props = filter_locals(locals, &self.config.exclude_locals);
        let ssr = artifacts
            .component
            .render(&props)
            .await
            .map_err(|err| RenderError::Ssr {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;

        let locals_json = serde_json::to_string(&props).unwrap_or_else(|_| "null".to_string());
        let path_str = path.display().to_string();

        let document = self.template.render(&TemplateVars {
            head: &ssr.head,
            html: &ssr.html,
            css: &artifacts.css,
            js: &artifacts.bundle,
            name: page.name(),
            path: &path_str,
            locals: &locals_json,
        })?;

        Ok(document)
    }

    /// Force a fresh build of a page, bypassing any in-flight one.
    ///
    /// `no_cache` additionally drops the compiler's incremental cache
    /// token, for callers that suspect the cache itself.
    pub async fn rebuild(&self, name: impl AsRef<Path>, no_cache: bool) -> Result<(), BuildError> {
        let path = self.resolve(name);
        let page = self.page(&path);
        self.scheduler
            .build(&page, Priority::Active, BuildOptions { force: true, no_cache })
            .await
    }

    /// Queue a build without waiting for it.
    pub fn schedule_build(&self, name: impl AsRef<Path>, priority: Priority) {
        let path = self.resolve(name);
        let page = self.page(&path);
        self.scheduler
            .schedule_build(&page, priority, BuildOptions::default());
    }

    // ====== Site sweeps ======

    /// Rebuild every page under the pages directory from scratch.
    ///
    /// Clears the artifact store first, so manifests from deleted pages
    /// do not linger. Returns the number of pages that failed to build;
    /// per-page errors are reported as they happen.
    pub async fn build_all(&self) -> Result<usize> {
        self.store.clear().context("clearing build directory")?;
        for entry in self.pages.iter() {
            let page = entry.value();
            page.mark_unbuilt();
            page.clear_cache_token();
            page.clear_watch();
        }

        let paths = self.discover_pages();
        let total = paths.len();
        log!("render"; "building {} pages", total);

        let progress = Arc::new(ProgressLine::new(&[("pages", total), ("errors", total)]));
        let mut joins = JoinSet::new();

        for path in paths {
            let page = self.page(&path);
            let scheduler = Arc::clone(&self.scheduler);
            let progress = Arc::clone(&progress);
            joins.spawn(async move {
                let result = scheduler
                    .build(&page, Priority::Background, BuildOptions::default())
                    .await;
                progress.inc("pages");
                if result.is_err() {
                    progress.inc("errors");
                }
                result.is_err()
            });
        }

        let errors = drain_joins(&mut joins).await;
        self.scheduler.await_pending_builds().await;

        if let Some(progress) = Arc::into_inner(progress) {
            progress.finish();
        }
        if errors > 0 {
            log!("render"; "{} of {} pages failed", errors, total);
        }
        Ok(errors)
    }

    /// Bring every page up without rebuilding the ones that persisted.
    ///
    /// Pages with a valid on-disk manifest are restored into memory;
    /// the rest are built. Returns the number of failed builds.
    pub async fn init_all(&self) -> Result<usize> {
        let paths = self.discover_pages();
        let total = paths.len();
        log!("render"; "initializing {} pages", total);

        let progress = Arc::new(ProgressLine::new(&[("pages", total), ("errors", total)]));
        let restored = Arc::new(AtomicUsize::new(0));
        let mut joins = JoinSet::new();

        for path in paths {
            let page = self.page(&path);
            let builder = Arc::clone(&self.builder);
            let scheduler = Arc::clone(&self.scheduler);
            let progress = Arc::clone(&progress);
            let restored = Arc::clone(&restored);
            joins.spawn(async move {
                let failed = if builder.restore(&page).await {
                    restored.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    scheduler
                        .build(&page, Priority::Background, BuildOptions::default())
                        .await
                        .is_err()
                };
                progress.inc("pages");
                if failed {
                    progress.inc("errors");
                }
                failed
            });
        }

        let errors = drain_joins(&mut joins).await;
        self.scheduler.await_pending_builds().await;

        if let Some(progress) = Arc::into_inner(progress) {
            progress.finish();
        }
        log!(
            "render";
            "{} of {} pages restored from manifests",
            restored.load(Ordering::Relaxed),
            total
        );
        if errors > 0 {
            log!("render"; "{} of {} pages failed", errors, total);
        }
        Ok(errors)
    }

    /// Every page source under the pages directory, sorted.
    fn discover_pages(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = WalkDir::new(&self.config.dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == self.config.page_ext)
            })
            .filter(|path| !path.starts_with(&self.config.build_dir))
            .map(|path| normalize_path(&path))
            .collect();
        paths.sort();
        paths
    }

    // ====== Activity and reload surface ======

    /// Record external activity for a page, keeping its rebuilds at
    /// active priority.
    pub fn heartbeat(&self, name: impl AsRef<Path>) {
        let path = self.resolve(name);
        self.tracker.heartbeat(&path);
    }

    /// Subscribe to successful-build notices.
    pub fn subscribe_reloads(&self) -> broadcast::Receiver<ReloadNotice> {
        self.hub.subscribe()
    }

    /// Port of the live-reload WebSocket server, when enabled.
    pub fn reload_port(&self) -> Option<u16> {
        self.reload_server.as_ref().map(ReloadServer::port)
    }

    pub fn has_pending_builds(&self) -> bool {
        self.scheduler.has_pending_builds()
    }

    /// Wait until no build is queued or in flight.
    pub async fn await_pending_builds(&self) {
        self.scheduler.await_pending_builds().await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Watch the template and its includes, marking the parsed form dirty on
/// change. Compiled pages stay valid; only document assembly re-reads.
fn watch_template(
    watcher: &Arc<dyn DependencyWatcher>,
    template: &Arc<Template>,
) -> Option<Box<dyn WatchHandle>> {
    let files = template.files();
    let on_change: ChangeFn = {
        let template = Arc::clone(template);
        Arc::new(move |changed: &Path| {
            log!("watch"; "template changed: {}", changed.display());
            template.mark_dirty();
        })
    };

    match watcher.watch(&files, on_change) {
        Ok(handle) => Some(handle),
        Err(err) => {
            log!("error"; "template watch failed: {err:#}");
            None
        }
    }
}

/// Strip engine-internal keys from the props object before they reach
/// the component or the serialized `${locals}` block.
fn filter_locals(locals: &Value, exclude: &[String]) -> Value {
    match locals {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !exclude.iter().any(|e| e == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

async fn drain_joins(joins: &mut JoinSet<bool>) -> usize {
    let mut errors = 0usize;
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok(failed) => errors += usize::from(failed),
            Err(_) => errors += 1,
        }
    }
    errors
}

// ============================================================================
// Tests
// ============================================================================
