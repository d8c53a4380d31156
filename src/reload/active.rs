//! Activity tracking.
//!
//! Remembers which pages browsers reported recently. A page counts as
//! active while its last heartbeat is younger than the idle window;
//! activity only influences rebuild priority, never correctness.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;

// =============================================================================
// Activity Tracker
// =============================================================================

/// Per-page heartbeat timestamps with a fixed idle window.
///
/// Thread-safe. Supports multiple browser tabs viewing different pages.
pub struct ActivityTracker {
    heartbeats: DashMap<PathBuf, Instant>,
    idle: Duration,
}

impl ActivityTracker {
    pub fn new(idle: Duration) -> Self {
        Self {
            heartbeats: DashMap::new(),
            idle,
        }
    }

    /// Record that a client is currently viewing `path`.
    pub fn heartbeat(&self, path: &Path) {
        self.heartbeats.insert(path.to_path_buf(), Instant::now());
    }

    /// Whether `path` received a heartbeat within the idle window.
    ///
    /// An expired entry is dropped on the way out, so the map only holds
    /// pages somebody looked at recently.
    pub fn is_active(&self, path: &Path) -> bool {
        let expired = match self.heartbeats.get(path) {
            Some(seen) => {
                if seen.elapsed() <= self.idle {
                    return true;
                }
                true
            }
            None => false,
        };

        if expired {
            self.heartbeats.remove(path);
        }
        false
    }

    /// All pages that are active right now. Expired entries are pruned.
    pub fn active_pages(&self) -> Vec<PathBuf> {
        self.heartbeats.retain(|_, seen| seen.elapsed() <= self.idle);
        self.heartbeats
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of tracked pages, including ones that may have expired.
    pub fn len(&self) -> usize {
        self.heartbeats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty()
    }

    pub fn clear(&self) {
        self.heartbeats.clear();
    }
}
