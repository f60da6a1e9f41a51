//! Application directories.
//!
//! Every directory can be redirected with an environment variable, which is
//! how tests and side-by-side installs keep their state apart.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

const APP_NAME: &str = "rancher-desktop";

/// Resolved locations of everything the backend reads or writes on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// User home directory.
    pub home: PathBuf,
    /// Per-user application data; Lima state lives under it.
    pub app_home: PathBuf,
    /// Short alternate home (`~/.rd`) holding the host docker socket.
    pub alt_app_home: PathBuf,
    pub config: PathBuf,
    pub logs: PathBuf,
    pub cache: PathBuf,
    /// Bundled resources (base disk image, install scripts).
    pub resources: PathBuf,
    /// Host kubeconfig the cluster context is merged into.
    pub kubeconfig: PathBuf,
}

impl Paths {
    /// Platform defaults, overridden by `RD_APP_HOME`, `RD_CONFIG_DIR`,
    /// `RD_LOGS_DIR`, `RD_CACHE_DIR` and `RD_RESOURCES_DIR`.
    pub fn from_env() -> Result<Self> {
        let home = home_dir()?;
        let defaults = Self::platform_defaults(&home);
        let pick = |var: &str, default: PathBuf| {
            std::env::var_os(var)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(default)
        };

        Ok(Self {
            app_home: pick("RD_APP_HOME", defaults.app_home),
            config: pick("RD_CONFIG_DIR", defaults.config),
            logs: pick("RD_LOGS_DIR", defaults.logs),
            cache: pick("RD_CACHE_DIR", defaults.cache),
            resources: pick("RD_RESOURCES_DIR", defaults.resources),
            alt_app_home: defaults.alt_app_home,
            kubeconfig: kubeconfig_from_env().unwrap_or(defaults.kubeconfig),
            home,
        })
    }

    /// All directories rooted under `root`; used by tests and portable setups.
    pub fn under(root: &Path) -> Self {
        Self {
            home: root.join("home"),
            app_home: root.join("app"),
            alt_app_home: root.join("home/.rd"),
            config: root.join("config"),
            logs: root.join("logs"),
            cache: root.join("cache"),
            resources: root.join("resources"),
            kubeconfig: root.join("home/.kube/config"),
        }
    }

    fn platform_defaults(home: &Path) -> Self {
        let (app_home, config, logs, cache) = if cfg!(target_os = "macos") {
            let lib = home.join("Library");
            (
                lib.join("Application Support").join(APP_NAME),
                lib.join("Preferences").join(APP_NAME),
                lib.join("Logs").join(APP_NAME),
                lib.join("Caches").join(APP_NAME),
            )
        } else if cfg!(windows) {
            let local = std::env::var_os("LOCALAPPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("AppData/Local"));
            let roaming = std::env::var_os("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("AppData/Roaming"));
            (
                roaming.join(APP_NAME),
                roaming.join(APP_NAME),
                local.join(APP_NAME).join("logs"),
                local.join(APP_NAME).join("cache"),
            )
        } else {
            let data = xdg(home, "XDG_DATA_HOME", ".local/share");
            (
                data.join(APP_NAME),
                xdg(home, "XDG_CONFIG_HOME", ".config").join(APP_NAME),
                data.join(APP_NAME).join("logs"),
                xdg(home, "XDG_CACHE_HOME", ".cache").join(APP_NAME),
            )
        };

        let resources = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|p| p.join("../resources")))
            .unwrap_or_else(|| PathBuf::from("resources"));

        Self {
            home: home.to_path_buf(),
            app_home,
            alt_app_home: home.join(".rd"),
            config,
            logs,
            cache,
            resources,
            kubeconfig: home.join(".kube").join("config"),
        }
    }

    /// `LIMA_HOME` for `limactl`.
    pub fn lima(&self) -> PathBuf {
        self.app_home.join("lima")
    }

    /// Host end of the forwarded docker socket.
    pub fn docker_socket(&self) -> PathBuf {
        self.alt_app_home.join("docker.sock")
    }

    /// Engine log written by the binary; tailed for failure reports.
    pub fn engine_log(&self) -> PathBuf {
        self.logs.join("rd-engine.log")
    }

    /// User settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("settings.json")
    }
}

/// First entry of `KUBECONFIG`.
fn kubeconfig_from_env() -> Option<PathBuf> {
    std::env::var_os("KUBECONFIG")
        .and_then(|v| std::env::split_paths(&v).next())
        .filter(|p| !p.as_os_str().is_empty())
}

fn xdg(home: &Path, var: &str, fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(fallback))
}

fn home_dir() -> Result<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config(format!("{var} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_root_keeps_everything_inside() {
        let root = Path::new("/tmp/rd-test");
        let paths = Paths::under(root);
        for dir in [
            &paths.app_home,
            &paths.config,
            &paths.logs,
            &paths.cache,
            &paths.resources,
            &paths.alt_app_home,
            &paths.kubeconfig,
        ] {
            assert!(dir.starts_with(root), "{}", dir.display());
        }
        assert_eq!(paths.lima(), root.join("app/lima"));
        assert_eq!(paths.docker_socket(), root.join("home/.rd/docker.sock"));
    }
}
