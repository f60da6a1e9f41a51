use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{DistError, Result};
use crate::version::{compare_channels, K3sVersion, VersionEntry};

/// Format version of `k3s-versions.json`; files with any other value are ignored.
pub const CURRENT_CACHE_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// Architecture-specific artifact names
// ---------------------------------------------------------------------------

/// CPU architecture of the VM guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    Aarch64,
}

impl Arch {
    /// The architecture this process was built for.
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

/// Release asset names needed to install k3s on one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub exe: &'static str,
    /// Image archives in order of preference.
    pub images: &'static [&'static str],
    pub checksum: &'static str,
}

impl ArtifactNames {
    pub fn for_arch(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => Self {
                exe: "k3s",
                images: &["k3s-airgap-images-amd64.tar.zst", "k3s-airgap-images-amd64.tar"],
                checksum: "sha256sum-amd64.txt",
            },
            Arch::Aarch64 => Self {
                exe: "k3s-arm64",
                images: &["k3s-airgap-images-arm64.tar.zst", "k3s-airgap-images-arm64.tar"],
                checksum: "sha256sum-arm64.txt",
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Version cache file
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheData {
    #[serde(default)]
    cache_version: Option<u32>,
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default)]
    channels: BTreeMap<String, String>,
}

/// Known versions keyed by short version (`1.27.3`); only the newest build of
/// each release is kept.
#[derive(Debug, Default, Clone)]
pub struct VersionCache {
    entries: BTreeMap<String, VersionEntry>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`.  A missing file, unreadable JSON, or a different
    /// `cacheVersion` all yield an empty cache.
    pub async fn load(path: &Path) -> Self {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not read version cache");
                }
                return Self::new();
            }
        };
        let data: CacheData = match serde_json::from_slice(&raw) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unparsable version cache");
                return Self::new();
            }
        };
        if data.cache_version != Some(CURRENT_CACHE_VERSION) {
            debug!(version = ?data.cache_version, "ignoring cache with invalid version");
            return Self::new();
        }

        let mut cache = Self::new();
        for raw in &data.versions {
            if let Ok(version) = K3sVersion::parse(raw) {
                cache.entries.insert(version.short(), VersionEntry::new(version));
            }
        }
        for (channel, short) in &data.channels {
            match cache.entries.get_mut(short) {
                Some(entry) => entry.channels.push(channel.clone()),
                None => debug!(%channel, %short, "ignoring channel with unknown version"),
            }
        }
        for entry in cache.entries.values_mut() {
            entry.channels.sort_by(|a, b| compare_channels(a, b));
        }
        cache
    }

    /// Write the cache as pretty JSON, creating the parent directory.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut sorted: Vec<&VersionEntry> = self.entries.values().collect();
        sorted.sort_by(|a, b| a.version.cmp(&b.version));

        let mut data = CacheData {
            cache_version: Some(CURRENT_CACHE_VERSION),
            ..Default::default()
        };
        for entry in sorted {
            data.versions.push(entry.version.raw().to_string());
            for channel in &entry.channels {
                data.channels.insert(channel.clone(), entry.version.short());
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_vec_pretty(&data)?).await?;
        debug!(path = %path.display(), count = data.versions.len(), "wrote versions cache");
        Ok(())
    }

    pub fn get(&self, short: &str) -> Option<&VersionEntry> {
        self.entries.get(short)
    }

    pub fn insert(&mut self, version: K3sVersion) {
        self.entries.insert(version.short(), VersionEntry::new(version));
    }

    /// Attach `channel` to the entry for `version` (if known), keeping labels sorted.
    pub fn add_channel(&mut self, channel: &str, version: &K3sVersion) {
        if let Some(entry) = self.entries.get_mut(&version.short()) {
            if !entry.channels.iter().any(|c| c == channel) {
                entry.channels.push(channel.to_string());
                entry.channels.sort_by(|a, b| compare_channels(a, b));
            }
        }
    }

    pub fn clear_channels(&mut self) {
        for entry in self.entries.values_mut() {
            entry.channels.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, newest first.
    pub fn entries_newest_first(&self) -> Vec<VersionEntry> {
        let mut entries: Vec<VersionEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        entries
    }
}

// ---------------------------------------------------------------------------
// Artifact cache
// ---------------------------------------------------------------------------

/// Downloaded release artifacts stored under `<cache_dir>/k3s/<raw version>/`.
pub struct ArtifactCache {
    cache_dir: PathBuf,
    names: ArtifactNames,
}

impl ArtifactCache {
    pub fn new(cache_dir: PathBuf, arch: Arch) -> Self {
        Self {
            cache_dir,
            names: ArtifactNames::for_arch(arch),
        }
    }

    /// Directory that holds all versions: `<cache_dir>/k3s/`.
    pub fn root(&self) -> PathBuf {
        self.cache_dir.join("k3s")
    }

    /// Directory for one version.
    pub fn version_dir(&self, version: &K3sVersion) -> PathBuf {
        self.root().join(version.raw())
    }

    pub fn names(&self) -> &ArtifactNames {
        &self.names
    }

    /// Versions with a directory in the cache, in directory order.
    pub async fn cached_versions(&self) -> Result<Vec<K3sVersion>> {
        let mut dir = match fs::read_dir(self.root()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('v') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(version) = K3sVersion::parse(&name) {
                if version.build.is_some() && !version.is_prerelease() {
                    versions.push(version);
                }
            }
        }
        Ok(versions)
    }

    /// Check the exe and the first present image archive in `dir` against the
    /// checksum file in the same directory.
    pub async fn verify_dir(&self, dir: &Path) -> Result<()> {
        let sums_raw = fs::read_to_string(dir.join(self.names.checksum)).await?;
        let sums = parse_checksums(&sums_raw);

        let mut image = self.names.images[0];
        for candidate in self.names.images {
            if fs::metadata(dir.join(candidate)).await.is_ok() {
                image = candidate;
                break;
            }
        }

        for file in [self.names.exe, image] {
            let actual = sha256_file(&dir.join(file)).await?;
            let expected = sums.get(file).cloned().unwrap_or_default();
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(DistError::DigestMismatch {
                    file: file.to_string(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// `true` if the cached artifacts for `version` are present and valid.
    pub async fn is_valid(&self, version: &K3sVersion) -> bool {
        match self.verify_dir(&self.version_dir(version)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(version = %version, error = %e, "cached artifacts not usable");
                false
            }
        }
    }
}

/// Parse `sha256sum`-style output into `file -> hex digest`.
pub fn parse_checksums(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let sum = parts.next()?;
            let file = parts.next()?;
            if !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            Some((file.trim_start_matches('*').to_string(), sum.to_string()))
        })
        .collect()
}

/// Stream-hash a file with SHA-256.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> K3sVersion {
        K3sVersion::parse(s).unwrap()
    }

    fn digest(data: &[u8]) -> String {
        hex_encode(&Sha256::digest(data))
    }

    #[test]
    fn artifact_names_per_arch() {
        assert_eq!(ArtifactNames::for_arch(Arch::X86_64).exe, "k3s");
        assert_eq!(ArtifactNames::for_arch(Arch::Aarch64).exe, "k3s-arm64");
        assert_eq!(
            ArtifactNames::for_arch(Arch::Aarch64).checksum,
            "sha256sum-arm64.txt"
        );
    }

    #[test]
    fn version_dir_uses_raw_name() {
        let cache = ArtifactCache::new(PathBuf::from("/tmp/rd-cache"), Arch::X86_64);
        assert_eq!(
            cache.version_dir(&v("v1.27.3+k3s1")),
            PathBuf::from("/tmp/rd-cache/k3s/v1.27.3+k3s1")
        );
    }

    #[test]
    fn checksum_lines_parse() {
        let sums = parse_checksums("abc123  k3s\n\nDEF456 *k3s-airgap-images-amd64.tar\nnot a line\n");
        assert_eq!(sums.get("k3s").map(String::as_str), Some("abc123"));
        assert_eq!(
            sums.get("k3s-airgap-images-amd64.tar").map(String::as_str),
            Some("DEF456")
        );
        assert_eq!(sums.len(), 2);
    }

    #[tokio::test]
    async fn cache_round_trips_channels() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("k3s-versions.json");

        let mut cache = VersionCache::new();
        cache.insert(v("v1.26.2+k3s1"));
        cache.insert(v("v1.27.3+k3s1"));
        cache.add_channel("v1.27", &v("v1.27.3+k3s1"));
        cache.add_channel("stable", &v("v1.27.3+k3s1"));
        cache.save(&path).await.unwrap();

        let loaded = VersionCache::load(&path).await;
        assert_eq!(loaded.len(), 2);
        let entry = loaded.get("1.27.3").unwrap();
        assert_eq!(entry.channels, vec!["stable", "v1.27"]);
        assert_eq!(loaded.entries_newest_first()[0].version.raw(), "v1.27.3+k3s1");
    }

    #[tokio::test]
    async fn cache_with_other_format_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("k3s-versions.json");
        std::fs::write(&path, r#"{"cacheVersion":1,"versions":["v1.27.3+k3s1"],"channels":{}}"#).unwrap();
        assert!(VersionCache::load(&path).await.is_empty());
    }

    #[tokio::test]
    async fn verify_accepts_matching_digests() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(tmp.path().to_path_buf(), Arch::X86_64);
        let dir = cache.version_dir(&v("v1.27.3+k3s1"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("k3s"), b"binary").unwrap();
        std::fs::write(dir.join("k3s-airgap-images-amd64.tar"), b"images").unwrap();
        std::fs::write(
            dir.join("sha256sum-amd64.txt"),
            format!(
                "{}  k3s\n{}  k3s-airgap-images-amd64.tar\n",
                digest(b"binary"),
                digest(b"images")
            ),
        )
        .unwrap();

        assert!(cache.is_valid(&v("v1.27.3+k3s1")).await);
        let versions = cache.cached_versions().await.unwrap();
        assert_eq!(versions, vec![v("v1.27.3+k3s1")]);
    }

    #[tokio::test]
    async fn verify_rejects_tampered_exe() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(tmp.path().to_path_buf(), Arch::X86_64);
        let dir = tmp.path().join("check");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("k3s"), b"tampered").unwrap();
        std::fs::write(dir.join("k3s-airgap-images-amd64.tar.zst"), b"images").unwrap();
        std::fs::write(
            dir.join("sha256sum-amd64.txt"),
            format!(
                "{}  k3s\n{}  k3s-airgap-images-amd64.tar.zst\n",
                digest(b"binary"),
                digest(b"images")
            ),
        )
        .unwrap();

        let err = cache.verify_dir(&dir).await.unwrap_err();
        assert!(matches!(err, DistError::DigestMismatch { ref file, .. } if file == "k3s"));
    }

    #[tokio::test]
    async fn cached_versions_on_missing_root_is_empty() {
        let cache = ArtifactCache::new(PathBuf::from("/tmp/nonexistent-rd-cache-test"), Arch::X86_64);
        assert!(cache.cached_versions().await.unwrap().is_empty());
    }
}
