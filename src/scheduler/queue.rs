//! Pending build queue.
//!
//! Holds at most one entry per page. An active-priority request jumps
//! to the head; background requests keep arrival order. Merging a
//! request into an existing entry combines the options and keeps every
//! waiter.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use crate::page::Page;
use crate::scheduler::{BuildOptions, BuildWaiter, Priority};

/// One pending build with everyone waiting on it.
pub struct QueuedBuild {
    pub page: Arc<Page>,
    pub priority: Priority,
    pub options: BuildOptions,
    pub waiters: Vec<BuildWaiter>,
}

/// FIFO queue with priority-to-head and per-page dedup.
#[derive(Default)]
pub struct BuildQueue {
    entries: VecDeque<QueuedBuild>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request, merging into the page's existing entry when there
    /// is one. Returns the entry so the caller can attach a waiter.
    ///
    /// Merging combines options and takes the higher priority. An
    /// active request puts the entry at the head whether it is new or
    /// merged; a merged background request leaves it where it sat.
    pub fn upsert(
        &mut self,
        page: &Arc<Page>,
        priority: Priority,
        options: BuildOptions,
    ) -> &mut QueuedBuild {
        let existing = self
            .entries
            .iter()
            .position(|entry| entry.page.path() == page.path());

        let index = match existing {
            Some(i) => {
                let mut entry = self.entries.remove(i).unwrap();
                entry.options = entry.options.merge(options);
                entry.priority = entry.priority.max(priority);
                if priority == Priority::Active {
                    self.entries.push_front(entry);
                    0
                } else {
                    self.entries.insert(i, entry);
                    i
                }
            }
            None => {
                let entry = QueuedBuild {
                    page: Arc::clone(page),
                    priority,
                    options,
                    waiters: Vec::new(),
                };
                match priority {
                    Priority::Active => {
                        self.entries.push_front(entry);
                        0
                    }
                    Priority::Background => {
                        self.entries.push_back(entry);
                        self.entries.len() - 1
                    }
                }
            }
        };

        &mut self.entries[index]
    }

    /// Remove and return the first entry whose page passes `ready`.
    ///
    /// Entries that fail the check stay queued in place; the scheduler
    /// uses this to hold back pages that already have a build running.
    pub fn pop_first(&mut self, ready: impl Fn(&Path) -> bool) -> Option<QueuedBuild> {
        let index = self
            .entries
            .iter()
            .position(|entry| ready(entry.page.path()))?;
        self.entries.remove(index)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| entry.page.path() == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
