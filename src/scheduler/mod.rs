//! Build scheduling.
//!
//! Single entry point for all build requests:
//! - On-demand render of a page without fresh artifacts → Active
//! - Dependency change of a page somebody is viewing → Active
//! - Everything else (startup sweeps, idle rebuilds) → Background
//!
//! The scheduler runs at most `concurrency` builds at once and at most
//! one build per page. A request for a page that is already queued
//! merges into the existing entry; a request for a page that is already
//! building queues behind it and dispatches once the running build
//! settles.

pub mod queue;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};

use crate::debug;
use crate::error::BuildError;
use crate::page::Page;
use queue::{BuildQueue, QueuedBuild};

// =============================================================================
// Public types
// =============================================================================

/// Build urgency. `Active` requests go to the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Background,
    Active,
}

/// Per-request build switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run a fresh build even when one is already in flight.
    pub force: bool,
    /// Skip the compiler's incremental cache.
    pub no_cache: bool,
}

impl BuildOptions {
    /// Combine two requests for the same page. A switch set on either
    /// side stays set.
    pub fn merge(self, other: BuildOptions) -> BuildOptions {
        BuildOptions {
            force: self.force || other.force,
            no_cache: self.no_cache || other.no_cache,
        }
    }
}

/// Channel half handed to the scheduler by a caller that wants the
/// build's result.
pub type BuildWaiter = oneshot::Sender<Result<(), BuildError>>;

/// What the scheduler dispatches to. The engine's page builder is the
/// real implementation; tests plug in instrumented fakes.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run_build(&self, page: &Arc<Page>, options: BuildOptions) -> Result<(), BuildError>;
}

// =============================================================================
// Scheduler
// =============================================================================

/// Concurrency-bounded build dispatcher with per-page deduplication.
pub struct BuildScheduler {
    state: Mutex<SchedState>,
    concurrency: usize,
    runner: Arc<dyn BuildRunner>,
    runtime: Handle,
    /// Level-triggered count of queued plus in-flight builds.
    pending_tx: watch::Sender<usize>,
    pending_rx: watch::Receiver<usize>,
}

struct SchedState {
    queue: BuildQueue,
    in_flight: FxHashMap<PathBuf, InFlight>,
}

struct InFlight {
    waiters: Vec<BuildWaiter>,
}

impl BuildScheduler {
    pub fn new(runner: Arc<dyn BuildRunner>, concurrency: usize, runtime: Handle) -> Arc<Self> {
        let (pending_tx, pending_rx) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(SchedState {
                queue: BuildQueue::new(),
                in_flight: FxHashMap::default(),
            }),
            // Zero would never dispatch anything.
            concurrency: concurrency.max(1),
            runner,
            runtime,
            pending_tx,
            pending_rx,
        })
    }

    /// Request a build without waiting for it. Failures surface through
    /// the runner's own reporting.
    ///
    /// Safe to call from any thread; dispatch happens on the runtime
    /// handle given at construction.
    pub fn schedule_build(
        self: &Arc<Self>,
        page: &Arc<Page>,
        priority: Priority,
        options: BuildOptions,
    ) {
        {
            let mut state = self.state.lock();
            state.queue.upsert(page, priority, options);
            self.publish_pending(&state);
        }
        debug!("build"; "queued {} ({:?})", page.rel().display(), priority);
        self.check_queue();
    }

    /// Request a build and wait for its result.
    ///
    /// Without `force` this joins a build already running for the page.
    /// With `force` it always queues a fresh build, which starts after
    /// the running one settles.
    pub async fn build(
        self: &Arc<Self>,
        page: &Arc<Page>,
        priority: Priority,
        options: BuildOptions,
    ) -> Result<(), BuildError> {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            match state.in_flight.get_mut(page.path()) {
                Some(running) if !options.force => {
                    running.waiters.push(tx);
                }
                _ => {
                    let entry = state.queue.upsert(page, priority, options);
                    entry.waiters.push(tx);
                    self.publish_pending(&state);
                }
            }
        }

        self.check_queue();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BuildError::Canceled),
        }
    }

    pub fn has_pending_builds(&self) -> bool {
        let state = self.state.lock();
        !state.queue.is_empty() || !state.in_flight.is_empty()
    }

    /// Wait until no build is queued or running.
    ///
    /// Builds scheduled while waiting extend the wait; the count being
    /// watched is level-triggered, so a moment with zero pending builds
    /// resolves the call even if it has already passed.
    pub async fn await_pending_builds(&self) {
        let mut rx = self.pending_rx.clone();
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    /// (queued, in flight), for progress reporting.
    pub fn pending_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.queue.len(), state.in_flight.len())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

impl BuildScheduler {
    /// Fill free build slots from the queue. The only place builds
    /// start.
    ///
    /// A queued page whose previous build is still running is skipped,
    /// not dropped; the settling build re-checks the queue and picks it
    /// up.
    fn check_queue(self: &Arc<Self>) {
        let mut state = self.state.lock();

        while state.in_flight.len() < self.concurrency {
            let SchedState { queue, in_flight } = &mut *state;
            let Some(next) = queue.pop_first(|path| !in_flight.contains_key(path)) else {
                break;
            };

            let QueuedBuild {
                page,
                priority,
                options,
                waiters,
            } = next;

            debug!("build"; "dispatch {} ({:?})", page.rel().display(), priority);
            in_flight.insert(page.path().to_path_buf(), InFlight { waiters });
            self.spawn_build(page, options);
        }
    }

    /// Run one build on the runtime and settle it afterwards.
    ///
    /// The runner executes in its own task so that a panic inside it
    /// still settles the page instead of wedging its in-flight slot.
    fn spawn_build(self: &Arc<Self>, page: Arc<Page>, options: BuildOptions) {
        let scheduler = Arc::clone(self);
        self.runtime.spawn(async move {
            let task = {
                let runner = Arc::clone(&scheduler.runner);
                let page = Arc::clone(&page);
                tokio::spawn(async move { runner.run_build(&page, options).await })
            };

            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    debug!("build"; "runner died for {}: {}", page.rel().display(), e);
                    Err(BuildError::Canceled)
                }
            };

            scheduler.settle(page.path(), result);
        });
    }

    /// Record a finished build, notify its waiters, and re-check the
    /// queue.
    fn settle(self: &Arc<Self>, path: &Path, result: Result<(), BuildError>) {
        let waiters = {
            let mut state = self.state.lock();
            let waiters = state
                .in_flight
                .remove(path)
                .map(|running| running.waiters)
                .unwrap_or_default();
            self.publish_pending(&state);
            waiters
        };

        if waiters.is_empty() {
            if let Err(e) = &result {
                debug!("build"; "unobserved failure: {}: {}", path.display(), e);
            }
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        self.check_queue();
    }

    /// Publish the pending count. Must run under the state lock so that
    /// observers never see a stale zero.
    fn publish_pending(&self, state: &SchedState) {
        self.pending_tx
            .send_replace(state.queue.len() + state.in_flight.len());
    }
}
