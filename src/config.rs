//! Engine configuration file (`<config>/engine.yaml`).
//!
//! Everything here has a default; the file only exists to point the engine at
//! mirrors, test servers, or a non-bundled `limactl`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::Paths;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Explicit `limactl`; defaults to the bundled one under resources.
    #[serde(default)]
    pub limactl: Option<PathBuf>,
    /// Version of the bundled Alpine-Lima base image.
    #[serde(default = "default_image_version")]
    pub image_version: String,
    #[serde(default = "default_alpine_version")]
    pub alpine_version: String,
    #[serde(default = "default_channels_url")]
    pub k3s_channels_url: String,
    #[serde(default = "default_releases_url")]
    pub k3s_releases_url: String,
    #[serde(default = "default_download_url")]
    pub k3s_download_url: String,
    /// Override the guest architecture (`x86_64` / `aarch64`).
    #[serde(default)]
    pub arch: Option<k3s_dist::Arch>,
    /// `host:port` resolved to decide whether we are online.
    #[serde(default = "default_connectivity_host")]
    pub connectivity_host: String,
    /// Attempts made to discover the host IP as seen from the VM.
    #[serde(default = "default_host_ip_attempts")]
    pub host_ip_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limactl: None,
            image_version: default_image_version(),
            alpine_version: default_alpine_version(),
            k3s_channels_url: default_channels_url(),
            k3s_releases_url: default_releases_url(),
            k3s_download_url: default_download_url(),
            arch: None,
            connectivity_host: default_connectivity_host(),
            host_ip_attempts: default_host_ip_attempts(),
        }
    }
}

fn default_image_version() -> String {
    "0.2.31".to_string()
}

fn default_alpine_version() -> String {
    "3.18.0".to_string()
}

fn default_channels_url() -> String {
    k3s_dist::DEFAULT_CHANNELS_URL.to_string()
}

fn default_releases_url() -> String {
    k3s_dist::DEFAULT_RELEASES_URL.to_string()
}

fn default_download_url() -> String {
    k3s_dist::DEFAULT_DOWNLOAD_URL.to_string()
}

fn default_connectivity_host() -> String {
    "github.com:443".to_string()
}

fn default_host_ip_attempts() -> u32 {
    13
}

impl EngineConfig {
    /// Guest architecture: the override, else the host's.
    pub fn arch(&self) -> k3s_dist::Arch {
        self.arch.unwrap_or_else(k3s_dist::Arch::host)
    }

    /// `limactl` to run.
    pub fn limactl(&self, paths: &Paths) -> PathBuf {
        match &self.limactl {
            Some(path) => path.clone(),
            None => paths.resources.join(host_os()).join("lima/bin/limactl"),
        }
    }

    /// File name of the bundled base image.
    pub fn base_image_name(&self) -> String {
        format!(
            "alpine-lima-v{}-rd-{}.iso",
            self.image_version, self.alpine_version
        )
    }

    /// Full path of the bundled base image.
    pub fn base_image(&self, paths: &Paths) -> PathBuf {
        paths.resources.join(host_os()).join(self.base_image_name())
    }

    /// Settings for the k3s release client.
    pub fn dist_config(&self, paths: &Paths) -> k3s_dist::DistConfig {
        k3s_dist::DistConfig {
            cache_dir: paths.cache.clone(),
            arch: self.arch(),
            channels_url: self.k3s_channels_url.clone(),
            releases_url: self.k3s_releases_url.clone(),
            download_url: self.k3s_download_url.clone(),
        }
    }
}

/// Platform directory name used under resources.
pub fn host_os() -> &'static str {
    if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(windows) {
        "win32"
    } else {
        "linux"
    }
}

/// Load `path` if it exists; otherwise return the defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EngineConfig::default()),
        Err(e) => {
            return Err(Error::Config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if content.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid engine config {}: {}", path.display(), e)))
}
