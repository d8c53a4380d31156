//! Build artifact storage.
//!
//! Two layers behind one API: a `DashMap` of instantiated, render-ready
//! artifacts, and JSON manifests on disk for reuse across restarts.
//! Manifest writes go through a temp file plus rename, so a crashed or
//! failed build can never leave a partial manifest behind.

pub mod manifest;

pub use manifest::{BuildManifest, ClientArtifact, MANIFEST_VERSION, ManifestHashes, ServerArtifact};

use crate::compiler::{CacheToken, ServerComponent};
use crate::debug;
use crate::utils::hash::fingerprint;
use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything needed to serve one built page.
pub struct PageArtifacts {
    pub component: Arc<dyn ServerComponent>,
    pub css: String,
    pub bundle: String,
    pub dependencies: Vec<PathBuf>,
    pub cache_token: Option<CacheToken>,
}

impl PageArtifacts {
    fn from_manifest(manifest: BuildManifest, component: Arc<dyn ServerComponent>) -> Self {
        Self {
            component,
            css: manifest.server.css,
            bundle: manifest.client.bundle,
            dependencies: manifest.client.dependencies,
            cache_token: manifest.cache_token,
        }
    }
}

pub struct ArtifactStore {
    build_dir: PathBuf,
    pages_dir: PathBuf,
    memory: DashMap<PathBuf, Arc<PageArtifacts>>,
}

impl ArtifactStore {
    pub fn new(build_dir: PathBuf, pages_dir: PathBuf) -> Self {
        Self {
            build_dir,
            pages_dir,
            memory: DashMap::new(),
        }
    }

    /// Where the manifest for `page_path` lives.
    ///
    /// Pages under the source dir mirror their relative path (with `.json`
    /// appended, so differing source extensions cannot collide). Pages
    /// outside it get a fingerprint filename.
    pub fn manifest_path(&self, page_path: &Path) -> PathBuf {
        match page_path.strip_prefix(&self.pages_dir) {
            Ok(rel) => {
                let mut path = self.build_dir.join(rel);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                path.set_file_name(format!("{name}.json"));
                path
            }
            Err(_) => self
                .build_dir
                .join(format!("{}.json", fingerprint(page_path.to_string_lossy().as_bytes()))),
        }
    }

    /// Persist a manifest and publish its artifacts to memory.
    ///
    /// The memory entry appears only after the disk write succeeds.
    pub fn put(
        &self,
        manifest: BuildManifest,
        component: Arc<dyn ServerComponent>,
    ) -> io::Result<Arc<PageArtifacts>> {
        let path = self.manifest_path(&manifest.path);
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&path, &json)?;

        let page_path = manifest.path.clone();
        let artifacts = Arc::new(PageArtifacts::from_manifest(manifest, component));
        self.memory.insert(page_path, Arc::clone(&artifacts));
        Ok(artifacts)
    }

    /// Publish restored artifacts to memory without touching disk.
    pub fn adopt(
        &self,
        manifest: BuildManifest,
        component: Arc<dyn ServerComponent>,
    ) -> Arc<PageArtifacts> {
        let page_path = manifest.path.clone();
        let artifacts = Arc::new(PageArtifacts::from_manifest(manifest, component));
        self.memory.insert(page_path, Arc::clone(&artifacts));
        artifacts
    }

    pub fn get(&self, page_path: &Path) -> Option<Arc<PageArtifacts>> {
        self.memory.get(page_path).map(|entry| Arc::clone(entry.value()))
    }

    /// Read and validate the persisted manifest for `page_path`.
    ///
    /// Stale versions, corrupt payloads, and manifests written for a
    /// different source path all come back as `None`; the page simply
    /// rebuilds.
    pub fn load(&self, page_path: &Path) -> Option<BuildManifest> {
        let path = self.manifest_path(page_path);
        let bytes = fs::read(&path).ok()?;
        let manifest: BuildManifest = serde_json::from_slice(&bytes).ok()?;

        if !manifest.is_valid() {
            debug!("pages"; "ignoring stale manifest {}", path.display());
            return None;
        }
        if manifest.path != page_path {
            debug!("pages"; "manifest {} belongs to another source, ignoring", path.display());
            return None;
        }
        Some(manifest)
    }

    /// Drop the memory entry and delete the manifest file.
    pub fn invalidate(&self, page_path: &Path) -> io::Result<()> {
        self.memory.remove(page_path);
        match fs::remove_file(self.manifest_path(page_path)) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Wipe memory and the whole build dir.
    pub fn clear(&self) -> io::Result<()> {
        self.memory.clear();
        if self.build_dir.exists() {
            fs::remove_dir_all(&self.build_dir)?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::SsrOutput;
    use crate::error::CompileError;
    use async_trait::async_trait;

    struct NullComponent;

    #[async_trait]
    impl ServerComponent for NullComponent {
        async fn render(&self, _props: &serde_json::Value) -> Result<SsrOutput, CompileError> {
            Ok(SsrOutput::default())
        }
    }

    fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::new(dir.join("build"), dir.join("pages"))
    }

    fn manifest(dir: &Path, rel: &str) -> BuildManifest {
        BuildManifest::new(
            dir.join("pages").join(rel),
            ServerArtifact {
                module: "mod".to_string(),
                css: "p{}".to_string(),
            },
            ClientArtifact {
                bundle: "boot();".to_string(),
                dependencies: vec![],
            },
            None,
        )
    }

    #[test]
    fn test_manifest_path_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let in_tree = store.manifest_path(&dir.path().join("pages/sub/a.html"));
        assert_eq!(in_tree, dir.path().join("build/sub/a.html.json"));

        // Differing source extensions must not collide.
        let sibling = store.manifest_path(&dir.path().join("pages/sub/a.svelte"));
        assert_ne!(in_tree, sibling);

        let out_of_tree = store.manifest_path(Path::new("/elsewhere/a.html"));
        assert!(out_of_tree.starts_with(dir.path().join("build")));
        assert!(out_of_tree.extension().is_some_and(|e| e == "json"));
    }

    #[test]
    fn test_put_then_get_and_no_tmp_residue() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manifest = manifest(dir.path(), "a.html");
        let page = manifest.path.clone();

        store.put(manifest, Arc::new(NullComponent)).unwrap();

        let artifacts = store.get(&page).expect("artifacts in memory");
        assert_eq!(artifacts.bundle, "boot();");

        let manifest_file = store.manifest_path(&page);
        assert!(manifest_file.exists());
        assert!(!manifest_file.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manifest = manifest(dir.path(), "a.html");
        let page = manifest.path.clone();

        store.put(manifest, Arc::new(NullComponent)).unwrap();
        let loaded = store.load(&page).expect("valid manifest on disk");
        assert_eq!(loaded.server.module, "mod");
    }

    #[test]
    fn test_load_rejects_tampering_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manifest = manifest(dir.path(), "a.html");
        let page = manifest.path.clone();

        assert!(store.load(&page).is_none());

        store.put(manifest, Arc::new(NullComponent)).unwrap();

        // Corrupt the persisted bundle without updating the hash.
        let file = store.manifest_path(&page);
        let mut on_disk: BuildManifest =
            serde_json::from_slice(&fs::read(&file).unwrap()).unwrap();
        on_disk.client.bundle = "tampered".to_string();
        fs::write(&file, serde_json::to_vec(&on_disk).unwrap()).unwrap();

        assert!(store.load(&page).is_none());
    }

    #[test]
    fn test_invalidate_removes_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manifest = manifest(dir.path(), "a.html");
        let page = manifest.path.clone();

        store.put(manifest, Arc::new(NullComponent)).unwrap();
        store.invalidate(&page).unwrap();

        assert!(store.get(&page).is_none());
        assert!(!store.manifest_path(&page).exists());

        // Invalidating an unbuilt page is not an error.
        store.invalidate(&page).unwrap();
    }

    #[test]
    fn test_clear_deletes_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manifest = manifest(dir.path(), "a.html");
        let page = manifest.path.clone();

        store.put(manifest, Arc::new(NullComponent)).unwrap();
        store.clear().unwrap();

        assert!(store.get(&page).is_none());
        assert!(!dir.path().join("build").exists());
    }
}
