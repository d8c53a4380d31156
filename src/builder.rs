//! Page building.
//!
//! [`PageBuilder`] is the scheduler's build runner. One build takes a
//! page through server compile, client compile, manifest persistence,
//! and module instantiation, then arms a watch over the dependency set
//! the compile reported. The builder also owns the follow-up policy
//! when a watched dependency changes: viewed pages rebuild immediately
//! at active priority, idle pages after a grace window in the
//! background.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::artifact::ArtifactStore;
use crate::artifact::manifest::{BuildManifest, ClientArtifact, ServerArtifact};
use crate::compiler::{CompileRequest, CompilerService};
use crate::config::{CompilerConfig, EngineConfig};
use crate::error::BuildError;
use crate::logger::{status_error, status_success};
use crate::page::Page;
use crate::reload::{ActivityTracker, LiveReloadHub};
use crate::scheduler::{BuildOptions, BuildRunner, BuildScheduler, Priority};
use crate::watch::{ChangeFn, DependencyWatcher};
use crate::{debug, log};

/// Builds pages and reacts to their dependency changes.
pub struct PageBuilder {
    me: Weak<PageBuilder>,
    compiler: Arc<dyn CompilerService>,
    store: Arc<ArtifactStore>,
    watcher: Arc<dyn DependencyWatcher>,
    tracker: Arc<ActivityTracker>,
    hub: Arc<LiveReloadHub>,
    /// Bound after the scheduler exists; the scheduler owns the builder,
    /// so the back edge stays weak.
    scheduler: Mutex<Weak<BuildScheduler>>,
    runtime: Handle,
    watch_enabled: bool,
    rebuild_grace: Duration,
    compiler_config: CompilerConfig,
}

impl PageBuilder {
    pub fn new(
        config: &EngineConfig,
        compiler: Arc<dyn CompilerService>,
        store: Arc<ArtifactStore>,
        watcher: Arc<dyn DependencyWatcher>,
        tracker: Arc<ActivityTracker>,
        hub: Arc<LiveReloadHub>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            compiler,
            store,
            watcher,
            tracker,
            hub,
            scheduler: Mutex::new(Weak::new()),
            runtime,
            watch_enabled: config.watch,
            rebuild_grace: config.rebuild_grace(),
            compiler_config: config.compiler.clone(),
        })
    }

    /// Hook up the scheduler that dispatches to this builder. Must run
    /// before any build; follow-up rebuilds go through it.
    pub fn bind_scheduler(&self, scheduler: &Arc<BuildScheduler>) {
        *self.scheduler.lock() = Arc::downgrade(scheduler);
    }

    // ====== Build pipeline ======

    async fn build_page(&self, page: &Arc<Page>, options: BuildOptions) -> Result<(), BuildError> {
        if options.no_cache {
            page.clear_cache_token();
        }

        let request = CompileRequest {
            path: page.path().to_path_buf(),
            name: page.name().to_string(),
            cache_token: page.cache_token(),
            no_cache: options.no_cache,
        };

        let server = self
            .compiler
            .compile_server(&request)
            .await
            .map_err(|e| BuildError::from_compile(page.path(), e))?;
        let client = self
            .compiler
            .compile_client(&request)
            .await
            .map_err(|e| BuildError::from_compile(page.path(), e))?;

        // One token slot per page; the client compile's token wins.
        let token = client
            .cache_token
            .clone()
            .or_else(|| server.cache_token.clone());

        let component = self
            .compiler
            .instantiate(&server.module, page.path())
            .await
            .map_err(|e| BuildError::from_compile(page.path(), e))?;

        let manifest = BuildManifest::new(
            page.path().to_path_buf(),
            ServerArtifact {
                module: server.module,
                css: server.css,
            },
            ClientArtifact {
                bundle: client.bundle,
                dependencies: client.dependencies,
            },
            token.clone(),
        );
        let dependencies = manifest.client.dependencies.clone();

        self.store
            .put(manifest, component)
            .map_err(|e| BuildError::from_io(page.path(), e))?;

        page.set_cache_token(token);
        self.arm_watch(page, &dependencies);
        page.mark_ready();
        self.hub.notify(page.path());
        Ok(())
    }

    /// Re-adopt persisted artifacts from a previous run.
    ///
    /// Returns whether the page came back ready. Any failure leaves the
    /// page unbuilt for the normal build path; nothing here compiles.
    pub async fn restore(&self, page: &Arc<Page>) -> bool {
        let Some(manifest) = self.store.load(page.path()) else {
            return false;
        };

        let component = match self
            .compiler
            .instantiate(&manifest.server.module, page.path())
            .await
        {
            Ok(component) => component,
            Err(e) => {
                debug!("render"; "stored module for {} unusable: {}", page.rel().display(), e);
                return false;
            }
        };

        page.set_cache_token(manifest.cache_token.clone());
        let dependencies = manifest.client.dependencies.clone();
        self.store.adopt(manifest, component);
        self.arm_watch(page, &dependencies);
        page.mark_ready();
        debug!("render"; "restored {}", page.rel().display());
        true
    }

    // ====== Dependency watching ======

    /// Watch the dependency set reported by the latest build. The page's
    /// own source is always part of the set.
    fn arm_watch(&self, page: &Arc<Page>, dependencies: &[PathBuf]) {
        if !self.watch_enabled {
            return;
        }

        let mut paths = dependencies.to_vec();
        if !paths.iter().any(|p| p == page.path()) {
            paths.push(page.path().to_path_buf());
        }

        let on_change: ChangeFn = {
            let me = self.me.clone();
            let page = Arc::clone(page);
            Arc::new(move |changed: &Path| {
                if let Some(builder) = me.upgrade() {
                    builder.on_dependency_change(&page, changed);
                }
            })
        };

        match self.watcher.watch(&paths, on_change) {
            Ok(handle) => page.install_watch(handle),
            Err(e) => {
                log!("error"; "cannot watch dependencies of {}: {}", page.rel().display(), e)
            }
        }
    }

    /// Runs on the watcher's thread once per settled change.
    fn on_dependency_change(&self, page: &Arc<Page>, changed: &Path) {
        log!("watch"; "{} changed", changed.display());

        page.mark_stale();

        // Preprocessor sources are not incrementally safe; their changes
        // invalidate the compiler's cached state for the page.
        let busts = self.compiler_config.busts_cache(changed);
        if busts {
            debug!("watch"; "{} invalidates the compile cache of {}", changed.display(), page.rel().display());
            page.clear_cache_token();
        }
        let options = BuildOptions {
            force: false,
            no_cache: busts,
        };

        let Some(scheduler) = self.scheduler.lock().upgrade() else {
            return;
        };

        if self.tracker.is_active(page.path()) {
            scheduler.schedule_build(page, Priority::Active, options);
        } else {
            let page = Arc::clone(page);
            let grace = self.rebuild_grace;
            self.runtime.spawn(async move {
                tokio::time::sleep(grace).await;
                scheduler.schedule_build(&page, Priority::Background, options);
            });
        }
    }
}

#[async_trait]
impl BuildRunner for PageBuilder {
    async fn run_build(&self, page: &Arc<Page>, options: BuildOptions) -> Result<(), BuildError> {
        let started = Instant::now();
        page.mark_building();
        debug!("render"; "building {}", page.rel().display());

        match self.build_page(page, options).await {
            Ok(()) => {
                status_success(&format!(
                    "{} built in {}ms",
                    page.rel().display(),
                    started.elapsed().as_millis()
                ));
                Ok(())
            }
            Err(err) => {
                // A failed build leaves nothing servable behind.
                page.mark_unbuilt();
                if let Err(io_err) = self.store.invalidate(page.path()) {
                    log!("error"; "cannot drop artifacts of {}: {}", page.rel().display(), io_err);
                }
                status_error(
                    &format!("build failed: {}", page.rel().display()),
                    &err.to_string(),
                );
                Err(err)
            }
        }
    }
}
