//! Dependency watching.
//!
//! Every built page watches the exact file set its compile consumed. The
//! watcher observes the parent directories of that set (file-level watches
//! break when editors replace files by rename) and filters events back down
//! to member paths, debounced per path.

use crate::log;
use crate::utils::path::normalize_path;
use anyhow::Result;
use crossbeam::channel::{Receiver, RecvTimeoutError, unbounded};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Events for the same path within this window collapse into one change.
const DEBOUNCE_MS: u64 = 300;

/// How often the debounce thread wakes to check for shutdown while idle.
const IDLE_POLL_MS: u64 = 500;

/// Callback invoked once per settled change to a watched file.
pub type ChangeFn = Arc<dyn Fn(&Path) + Send + Sync + 'static>;

/// An active watch. Closing (or dropping) stops event delivery.
pub trait WatchHandle: Send + Sync {
    fn close(&self);
}

/// The watching seam: pages ask for a watch over their dependency set.
pub trait DependencyWatcher: Send + Sync {
    fn watch(&self, paths: &[PathBuf], on_change: ChangeFn) -> Result<Box<dyn WatchHandle>>;
}

// ============================================================================
// NotifyWatcher
// ============================================================================

/// `notify`-backed watcher. Each call owns its own `RecommendedWatcher` and
/// debounce thread, matching the one-watch-per-page lifecycle.
pub struct NotifyWatcher;

impl DependencyWatcher for NotifyWatcher {
    fn watch(&self, paths: &[PathBuf], on_change: ChangeFn) -> Result<Box<dyn WatchHandle>> {
        let members: FxHashSet<PathBuf> = paths.iter().map(|p| normalize_path(p)).collect();
        let dirs: FxHashSet<PathBuf> = members
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();

        let (tx, rx) = unbounded();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        // Skip directories that do not exist yet; the page rebuild re-arms
        // the watch with a fresh set anyway.
        for dir in &dirs {
            if dir.exists() {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let thread_closed = Arc::clone(&closed);
        std::thread::spawn(move || debounce_loop(&rx, &members, &on_change, &thread_closed));

        Ok(Box::new(NotifyHandle {
            closed,
            watcher: Mutex::new(Some(watcher)),
        }))
    }
}

struct NotifyHandle {
    closed: Arc<AtomicBool>,
    /// Dropping the watcher disconnects the event channel and ends the
    /// debounce thread.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl WatchHandle for NotifyHandle {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.watcher.lock().take();
    }
}

impl Drop for NotifyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Debouncing
// ============================================================================

fn debounce_loop(
    rx: &Receiver<notify::Result<notify::Event>>,
    members: &FxHashSet<PathBuf>,
    on_change: &ChangeFn,
    closed: &AtomicBool,
) {
    let mut debounce = Debounce::new(Duration::from_millis(DEBOUNCE_MS));

    loop {
        let timeout = debounce
            .next_deadline()
            .unwrap_or(Duration::from_millis(IDLE_POLL_MS));

        match rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                if !is_change(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    if is_temp_file(path) {
                        continue;
                    }
                    let path = normalize_path(path);
                    if members.contains(&path) {
                        debounce.note(path);
                    }
                }
            }
            Ok(Err(err)) => log!("watch"; "notify error: {}", err),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if closed.load(Ordering::SeqCst) {
            break;
        }

        for path in debounce.take_ready() {
            on_change(&path);
        }
    }
}

/// Event kinds that count as a content change. Metadata-only modifications
/// (mtime/chmod noise) would trigger endless rebuild loops.
fn is_change(kind: &notify::EventKind) -> bool {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(modify) => !matches!(modify, notify::event::ModifyKind::Metadata(_)),
        _ => false,
    }
}

/// Check if path is a temp/backup file (editor artifacts).
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}

/// Per-path debounce timing, no notify types involved.
struct Debounce {
    pending: FxHashMap<PathBuf, Instant>,
    window: Duration,
}

impl Debounce {
    fn new(window: Duration) -> Self {
        Self {
            pending: FxHashMap::default(),
            window,
        }
    }

    /// Record a change; repeated changes restart the path's window.
    fn note(&mut self, path: PathBuf) {
        self.pending.insert(path, Instant::now());
    }

    /// Paths whose window has elapsed, removed from the pending set.
    fn take_ready(&mut self) -> Vec<PathBuf> {
        let now = Instant::now();
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready
    }

    /// Time until the earliest pending path becomes ready.
    fn next_deadline(&self) -> Option<Duration> {
        let earliest = self.pending.values().min()?;
        let remaining = self.window.saturating_sub(earliest.elapsed());
        Some(remaining.max(Duration::from_millis(1)))
    }
}

// ============================================================================
// Tests
// ============================================================================
