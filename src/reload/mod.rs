//! Live reload.
//!
//! Builds publish the rebuilt page's identity on a broadcast hub; the
//! WebSocket server relays those notices to browsers and feeds the page
//! heartbeats browsers send back into the [`ActivityTracker`].
//!
//! Everything here is best effort: no subscribers is fine, slow
//! subscribers drop old notices, and a dead client is pruned on the next
//! send.

pub mod active;
pub mod server;

pub use active::ActivityTracker;

use crate::debug;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Notices a lagging subscriber can miss before it starts dropping.
const HUB_CAPACITY: usize = 64;

/// Identity of a page that just finished building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadNotice {
    pub path: PathBuf,
}

/// Fan-out point for build notices.
pub struct LiveReloadHub {
    tx: broadcast::Sender<ReloadNotice>,
}

impl LiveReloadHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Announce a successful build of `path`. Never fails; with no
    /// subscribers the notice evaporates.
    pub fn notify(&self, path: &Path) {
        let delivered = self
            .tx
            .send(ReloadNotice {
                path: path.to_path_buf(),
            })
            .unwrap_or(0);
        debug!("reload"; "notified {} subscribers: {}", delivered, path.display());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadNotice> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveReloadHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notice_reaches_subscribers() {
        let hub = LiveReloadHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.notify(Path::new("/pages/index.html"));

        let expected = PathBuf::from("/pages/index.html");
        assert_eq!(a.recv().await.unwrap().path, expected);
        assert_eq!(b.recv().await.unwrap().path, expected);
    }

    #[test]
    fn test_notify_without_subscribers_is_fine() {
        let hub = LiveReloadHub::new();
        assert_eq!(hub.subscriber_count(), 0);
        hub.notify(Path::new("/pages/index.html"));
    }
}
