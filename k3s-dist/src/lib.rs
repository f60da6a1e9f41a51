pub mod cache;
pub mod download;
pub mod error;
pub mod releases;
pub mod version;

pub use cache::{Arch, ArtifactNames};
pub use download::ProgressFn;
pub use error::{DistError, Result};
pub use version::{select_closest, K3sVersion, VersionEntry};

use std::path::PathBuf;

use tracing::{info, warn};

use cache::{ArtifactCache, VersionCache};
use releases::ReleaseClient;

pub const DEFAULT_CHANNELS_URL: &str = "https://update.k3s.io/v1-release/channels";
pub const DEFAULT_RELEASES_URL: &str = "https://api.github.com/repos/k3s-io/k3s/releases?per_page=100";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://github.com/k3s-io/k3s/releases/download";

/// Where the catalog comes from and where artifacts are kept.
#[derive(Debug, Clone)]
pub struct DistConfig {
    /// Application cache directory; artifacts go to `<cache_dir>/k3s/`.
    pub cache_dir: PathBuf,
    pub arch: Arch,
    pub channels_url: String,
    pub releases_url: String,
    pub download_url: String,
}

impl DistConfig {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            arch: Arch::host(),
            channels_url: DEFAULT_CHANNELS_URL.to_string(),
            releases_url: DEFAULT_RELEASES_URL.to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
        }
    }
}

/// k3s release client -- maintains the version catalog and the verified
/// artifact cache.
pub struct K3sDist {
    config: DistConfig,
    releases: ReleaseClient,
    artifacts: ArtifactCache,
}

impl K3sDist {
    pub fn new(config: DistConfig) -> Result<Self> {
        let releases = ReleaseClient::new(config.channels_url.clone(), config.releases_url.clone())?;
        let artifacts = ArtifactCache::new(config.cache_dir.clone(), config.arch);
        Ok(Self {
            config,
            releases,
            artifacts,
        })
    }

    /// Path of the on-disk version catalog.
    pub fn catalog_path(&self) -> PathBuf {
        self.config.cache_dir.join("k3s-versions.json")
    }

    pub fn arch(&self) -> Arch {
        self.config.arch
    }

    pub fn names(&self) -> &ArtifactNames {
        self.artifacts.names()
    }

    /// Directory holding the artifacts for `version`.
    pub fn version_dir(&self, version: &K3sVersion) -> PathBuf {
        self.artifacts.version_dir(version)
    }

    /// Refresh the catalog from upstream and persist it.  Channel labels are
    /// rebuilt from scratch; releases are merged into what is already cached.
    pub async fn update_catalog(&self) -> Result<Vec<VersionEntry>> {
        let path = self.catalog_path();
        let mut catalog = VersionCache::load(&path).await;

        self.releases
            .fetch_releases(&mut catalog, self.artifacts.names())
            .await?;

        match self.releases.fetch_channels().await {
            Ok(channels) => {
                catalog.clear_channels();
                for (name, version) in &channels {
                    catalog.add_channel(name, version);
                }
            }
            Err(e) => warn!(error = %e, "could not refresh k3s channels"),
        }

        catalog.save(&path).await?;
        Ok(catalog.entries_newest_first())
    }

    /// Versions from the stored catalog, newest first.  When `online` is false
    /// only versions whose artifacts are already cached are returned.
    pub async fn available_versions(&self, online: bool) -> Result<Vec<VersionEntry>> {
        let catalog = VersionCache::load(&self.catalog_path()).await;
        let mut entries = catalog.entries_newest_first();
        if !online {
            let cached = self.artifacts.cached_versions().await?;
            entries.retain(|e| cached.contains(&e.version));
            if entries.is_empty() {
                entries = cached.into_iter().map(VersionEntry::new).collect();
                entries.sort_by(|a, b| b.version.cmp(&a.version));
            }
        }
        Ok(entries)
    }

    /// Versions with an artifact directory in the cache.
    pub async fn cached_versions(&self) -> Result<Vec<K3sVersion>> {
        self.artifacts.cached_versions().await
    }

    /// Download and verify the artifacts for `version` unless they are
    /// already cached.  Returns the directory holding them.
    pub async fn ensure_images(
        &self,
        version: &K3sVersion,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf> {
        download::ensure_artifacts(
            self.releases.http(),
            &self.config.download_url,
            &self.artifacts,
            version,
            progress,
        )
        .await?;
        let dir = self.artifacts.version_dir(version);
        info!(version = %version, path = %dir.display(), "k3s artifacts ready");
        Ok(dir)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
