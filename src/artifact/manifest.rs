//! Persisted build manifest format.
//!
//! One JSON document per page, containing everything needed to serve the
//! page without recompiling: the server module reference, the extracted
//! stylesheet, the client bundle and its dependency list, plus the
//! compiler's cache token. Content hashes detect corruption on load.

use crate::compiler::CacheToken;
use crate::utils::hash::content_hash;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bump when the manifest layout changes; older manifests are ignored and
/// their pages rebuilt.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub version: u32,
    /// Canonical source path of the page.
    pub path: PathBuf,
    pub server: ServerArtifact,
    pub client: ClientArtifact,
    #[serde(default)]
    pub cache_token: Option<CacheToken>,
    pub hashes: ManifestHashes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerArtifact {
    /// Opaque module reference understood by the compiler service.
    pub module: String,
    #[serde(default)]
    pub css: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientArtifact {
    pub bundle: String,
    /// Files the build consumed; becomes the page's watch set.
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
}

/// Blake3 hex hashes of the payloads, recomputed on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestHashes {
    pub bundle: String,
    pub css: String,
}

impl BuildManifest {
    pub fn new(
        path: PathBuf,
        server: ServerArtifact,
        client: ClientArtifact,
        cache_token: Option<CacheToken>,
    ) -> Self {
        let hashes = ManifestHashes {
            bundle: content_hash(&client.bundle),
            css: content_hash(&server.css),
        };
        Self {
            version: MANIFEST_VERSION,
            path,
            server,
            client,
            cache_token,
            hashes,
        }
    }

    /// Usable for serving: current layout version, payloads match hashes.
    pub fn is_valid(&self) -> bool {
        self.version == MANIFEST_VERSION
            && self.hashes.bundle == content_hash(&self.client.bundle)
            && self.hashes.css == content_hash(&self.server.css)
    }
}
