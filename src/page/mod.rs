//! Page identity and lifecycle.
//!
//! A [`Page`] is one component source file that can be built into
//! servable artifacts. The page itself only tracks identity and state;
//! building lives in the scheduler and the artifact store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::compiler::CacheToken;
use crate::utils::ident::component_ident;
use crate::watch::WatchHandle;

// =============================================================================
// State
// =============================================================================

/// Lifecycle of a page's artifacts.
///
/// `Stale` still has servable artifacts on disk, but a dependency
/// changed since they were produced. `Unbuilt` has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Unbuilt,
    Building,
    Ready,
    Stale,
}

impl PageState {
    pub fn as_str(self) -> &'static str {
        match self {
            PageState::Unbuilt => "unbuilt",
            PageState::Building => "building",
            PageState::Ready => "ready",
            PageState::Stale => "stale",
        }
    }
}

impl std::fmt::Display for PageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Page
// =============================================================================

/// One renderable component source file.
pub struct Page {
    /// Absolute path of the component source.
    path: PathBuf,
    /// Path relative to the pages directory, used for display.
    rel: PathBuf,
    /// Component identifier derived from the file stem.
    name: String,
    state: Mutex<PageState>,
    /// Compiler cache token from the most recent successful build.
    cache_token: Mutex<Option<CacheToken>>,
    /// Dependency watch armed after a successful build.
    watch: Mutex<Option<Box<dyn WatchHandle>>>,
}

impl Page {
    pub fn new(path: PathBuf, rel: PathBuf) -> Arc<Page> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Arc::new(Page {
            path,
            rel,
            name: component_ident(&stem),
            state: Mutex::new(PageState::Unbuilt),
            cache_token: Mutex::new(None),
            watch: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rel(&self) -> &Path {
        &self.rel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PageState {
        *self.state.lock()
    }

    /// Whether current artifacts can be served without rebuilding.
    pub fn is_ready(&self) -> bool {
        self.state() == PageState::Ready
    }

    pub fn mark_building(&self) {
        *self.state.lock() = PageState::Building;
    }

    pub fn mark_ready(&self) {
        *self.state.lock() = PageState::Ready;
    }

    pub fn mark_unbuilt(&self) {
        *self.state.lock() = PageState::Unbuilt;
    }

    /// Flag served artifacts as outdated after a dependency change.
    ///
    /// Only a `Ready` page goes stale. A `Building` page stays as it is;
    /// the change is repaired by the rebuild the caller queues behind
    /// the running one. Returns whether the state changed.
    pub fn mark_stale(&self) -> bool {
        let mut state = self.state.lock();
        if *state == PageState::Ready {
            *state = PageState::Stale;
            true
        } else {
            false
        }
    }

    // ====== Cache token ======

    pub fn cache_token(&self) -> Option<CacheToken> {
        self.cache_token.lock().clone()
    }

    pub fn set_cache_token(&self, token: Option<CacheToken>) {
        *self.cache_token.lock() = token;
    }

    pub fn clear_cache_token(&self) {
        *self.cache_token.lock() = None;
    }

    // ====== Dependency watch ======

    /// Replace the dependency watch, closing the previous one.
    ///
    /// Each successful build knows the full dependency set, so the old
    /// watch has nothing left to say.
    pub fn install_watch(&self, handle: Box<dyn WatchHandle>) {
        let mut watch = self.watch.lock();
        if let Some(old) = watch.take() {
            old.close();
        }
        *watch = Some(handle);
    }

    pub fn clear_watch(&self) {
        if let Some(old) = self.watch.lock().take() {
            old.close();
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagHandle(Arc<AtomicBool>);

    impl WatchHandle for FlagHandle {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_page_is_unbuilt() {
        let page = Page::new(
            PathBuf::from("/site/pages/my-page.html"),
            PathBuf::from("my-page.html"),
        );
        assert_eq!(page.state(), PageState::Unbuilt);
        assert_eq!(page.name(), "MyPage");
        assert!(!page.is_ready());
    }

    #[test]
    fn test_stale_only_from_ready() {
        let page = Page::new(PathBuf::from("/p/a.html"), PathBuf::from("a.html"));

        assert!(!page.mark_stale());
        assert_eq!(page.state(), PageState::Unbuilt);

        page.mark_building();
        assert!(!page.mark_stale());
        assert_eq!(page.state(), PageState::Building);

        page.mark_ready();
        assert!(page.mark_stale());
        assert_eq!(page.state(), PageState::Stale);

        // Already stale, nothing to do.
        assert!(!page.mark_stale());
    }

    #[test]
    fn test_failed_build_goes_back_to_unbuilt() {
        let page = Page::new(PathBuf::from("/p/a.html"), PathBuf::from("a.html"));
        page.mark_building();
        page.mark_unbuilt();
        assert_eq!(page.state(), PageState::Unbuilt);
    }

    #[test]
    fn test_cache_token_roundtrip() {
        let page = Page::new(PathBuf::from("/p/a.html"), PathBuf::from("a.html"));
        assert!(page.cache_token().is_none());

        let token = CacheToken::from(serde_json::json!({"deps": ["x.scss"]}));
        page.set_cache_token(Some(token.clone()));
        assert_eq!(page.cache_token(), Some(token));

        page.clear_cache_token();
        assert!(page.cache_token().is_none());
    }

    #[test]
    fn test_install_watch_closes_previous() {
        let page = Page::new(PathBuf::from("/p/a.html"), PathBuf::from("a.html"));

        let first_closed = Arc::new(AtomicBool::new(false));
        page.install_watch(Box::new(FlagHandle(Arc::clone(&first_closed))));
        assert!(!first_closed.load(Ordering::SeqCst));

        let second_closed = Arc::new(AtomicBool::new(false));
        page.install_watch(Box::new(FlagHandle(Arc::clone(&second_closed))));
        assert!(first_closed.load(Ordering::SeqCst));
        assert!(!second_closed.load(Ordering::SeqCst));

        page.clear_watch();
        assert!(second_closed.load(Ordering::SeqCst));
    }
}
