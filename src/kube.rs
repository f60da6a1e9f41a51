//! Kubernetes (k3s) inside the VM.
//!
//! [`KubeManager`] resolves which k3s build to run, makes sure its artifacts
//! are in the host cache, installs it into the guest and drives the OpenRC
//! service.  It also merges the cluster's credentials into the user's
//! kubeconfig.
//!
//! A downgrade is always judged against the version recorded as installed:
//! the guest binary when the VM is up, otherwise the host-side record
//! written on the last successful install.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use k3s_dist::{select_closest, DistError, K3sDist, K3sVersion};
use regex_lite::Regex;
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::BackendState;
use crate::context::{AppContext, BlockingChoice};
use crate::events::BackendEvent;
use crate::restart::{default_overrides, FieldOverrides};
use crate::settings::BackendSettings;
use crate::vm::VmSupervisor;
use crate::watch::Watchers;
use crate::{Error, Result};

pub const GUEST_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
pub const CONTEXT_NAME: &str = "rancher-desktop";

const K3S_BIN: &str = "/usr/local/bin/k3s";
const INSTALL_SCRIPT_PATH: &str = "/usr/local/bin/install-k3s";
const INIT_SCRIPT_PATH: &str = "/etc/init.d/k3s";
const CONF_PATH: &str = "/etc/conf.d/k3s";
const LOGROTATE_PATH: &str = "/etc/logrotate.d/k3s";
pub const FLANNEL_CONFLIST: &str = "/etc/cni/net.d/10-flannel.conflist";

/// Cluster state removed on reset and downgrade.  Images under
/// `/var/lib/rancher/k3s/agent` are kept.
const KUBE_STATE_DIRS: [&str; 6] = [
    "/etc/rancher/k3s",
    "/run/k3s",
    "/var/lib/kubelet",
    "/var/lib/rancher/k3s/data",
    "/var/lib/rancher/k3s/server",
    "/var/lib/rancher/k3s/storage",
];

const INSTALL_K3S_SCRIPT: &str = r#"#!/bin/sh
# usage: install-k3s <version> <cache dir>
set -o errexit -o nounset

VERSION="$1"
CACHE_DIR="$2"

case "$(uname -m)" in
  aarch64|arm64) ARCH=arm64; EXE=k3s-arm64 ;;
  *) ARCH=amd64; EXE=k3s ;;
esac

SRC="${CACHE_DIR}/${VERSION}"
install -m 0755 "${SRC}/${EXE}" /usr/local/bin/k3s

IMAGES=/var/lib/rancher/k3s/agent/images
mkdir -p "${IMAGES}"
rm -f "${IMAGES}"/k3s-airgap-images-*
for ext in tar.zst tar; do
  if [ -f "${SRC}/k3s-airgap-images-${ARCH}.${ext}" ]; then
    cp "${SRC}/k3s-airgap-images-${ARCH}.${ext}" "${IMAGES}/"
    break
  fi
done
"#;

const SERVICE_K3S_SCRIPT: &str = r#"#!/sbin/openrc-run
# k3s server; settings come from /etc/conf.d/k3s

depend() {
  after network-online
  want cgroups
}

supervisor=supervise-daemon
name=k3s
command=/usr/local/bin/k3s
command_args="server --https-listen-port ${PORT:-6443} ${ADDITIONAL_ARGS:-}"
if [ "${ENGINE:-}" = "moby" ]; then
  command_args="${command_args} --docker"
fi
output_log="${LOG_DIR:-/var/log}/k3s.log"
error_log="${LOG_DIR:-/var/log}/k3s.log"
pidfile=/var/run/k3s.pid
respawn_delay=5
respawn_max=0
"#;

const LOGROTATE_K3S_SCRIPT: &str = "/var/log/k3s.log {
  missingok
  notifempty
  copytruncate
  size 20M
  rotate 3
}
";

static K3S_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^k3s version v?((?:\d+\.?)+\+k3s\d+)").expect("valid k3s version regex")
});

/// The version reported by `k3s --version`, if the output names one.
pub fn parse_installed_version(output: &str) -> Option<K3sVersion> {
    output
        .lines()
        .find(|line| line.starts_with("k3s version "))
        .and_then(|line| K3S_VERSION_RE.captures(line))
        .and_then(|caps| caps.get(1))
        .and_then(|m| K3sVersion::parse(m.as_str()).ok())
}

/// `KEY="value"` lines for an OpenRC `conf.d` file.
pub fn format_conf(values: &BTreeMap<&str, String>) -> String {
    values
        .iter()
        .map(|(key, value)| format!("{key}=\"{}\"\n", value.replace('"', "\\\"")))
        .collect()
}

/// Result of making sure the artifacts for a start attempt are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Ready {
        version: K3sVersion,
        /// The recorded installed version is newer than `version`.
        is_downgrade: bool,
    },
    /// The user refused to lose workloads to a downgrade.
    Declined,
}

#[derive(Default)]
struct Session {
    /// Downgrade target the user already agreed to.
    accepted_downgrade: Option<K3sVersion>,
    active: Option<K3sVersion>,
    port: Option<u16>,
    watchers: Option<Watchers>,
}

/// Installs and runs k3s in the VM.
pub struct KubeManager {
    ctx: AppContext,
    vm: Arc<dyn VmSupervisor>,
    dist: K3sDist,
    state: watch::Receiver<BackendState>,
    abort: Arc<AtomicBool>,
    session: Mutex<Session>,
}

impl KubeManager {
    pub fn new(
        ctx: AppContext,
        vm: Arc<dyn VmSupervisor>,
        state: watch::Receiver<BackendState>,
        abort: Arc<AtomicBool>,
    ) -> Result<Self> {
        let dist = K3sDist::new(ctx.config.dist_config(&ctx.paths))?;
        Ok(Self {
            ctx,
            vm,
            dist,
            state,
            abort,
            session: Mutex::new(Session::default()),
        })
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn aborted(&self) -> bool {
        self.abort.load(AtomicOrdering::SeqCst)
    }

    pub fn dist(&self) -> &K3sDist {
        &self.dist
    }

    /// Version k3s is running, once started.
    pub fn active_version(&self) -> Option<K3sVersion> {
        self.session().active.clone()
    }

    /// Port the API server listens on, once started.
    pub fn current_port(&self) -> Option<u16> {
        self.session().port
    }

    fn record_path(&self) -> PathBuf {
        self.ctx.paths.app_home.join("k3s-version")
    }

    async fn recorded_version(&self) -> Option<K3sVersion> {
        let raw = tokio::fs::read_to_string(self.record_path()).await.ok()?;
        K3sVersion::parse(raw.trim()).ok()
    }

    /// Forget the installed version; the VM it described is gone.
    pub async fn forget_installed(&self) -> Result<()> {
        match tokio::fs::remove_file(self.record_path()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// The k3s version installed in the VM.
    pub async fn installed_version(&self) -> Result<Option<K3sVersion>> {
        if self.vm.is_running().await? {
            match self.vm.exec(&[K3S_BIN, "--version"]).await {
                Ok(out) => {
                    if let Some(version) = parse_installed_version(&out) {
                        return Ok(Some(version));
                    }
                    debug!(output = %out.trim(), "k3s version not in --version output");
                }
                Err(e) => debug!(error = %e, "could not query k3s version; assuming not installed"),
            }
        }
        Ok(self.recorded_version().await)
    }

    /// The version to run: the configured one when the catalog has it,
    /// otherwise the newest available, which is written back to settings.
    pub async fn desired_version(&self, settings: &BackendSettings) -> Result<K3sVersion> {
        let online = self.ctx.connectivity.is_online().await;
        if online {
            if let Err(e) = self.dist.update_catalog().await {
                warn!(error = %e, "could not refresh the k3s version catalog");
            }
        }
        let available = self.dist.available_versions(online).await?;
        if available.is_empty() {
            warn!(requested = %settings.kubernetes.version, "no kubernetes versions available");
            return Err(Error::NoVersionAvailable);
        }

        let stored = settings.kubernetes.version.trim();
        if !stored.is_empty() {
            if let Ok(wanted) = K3sVersion::parse(stored) {
                let matched = available
                    .iter()
                    .map(|e| &e.version)
                    .find(|v| v.precedence(&wanted) == Ordering::Equal);
                if let Some(matched) = matched {
                    if stored != matched.short() {
                        self.persist_version(matched).await?;
                    }
                    return Ok(matched.clone());
                }
            }
        }

        let fallback = available
            .iter()
            .find(|e| e.channels.iter().any(|c| c == "stable"))
            .unwrap_or(&available[0])
            .version
            .clone();
        if !stored.is_empty() {
            let message = format!("Requested kubernetes version '{stored}' is not a valid version.");
            let detail = format!(
                "Falling back to the most recent stable version of {}",
                fallback.short()
            );
            if self.ctx.no_modal_dialogs {
                info!("{message} {detail}");
            } else {
                self.ctx
                    .prompter
                    .blocking_choice(&BlockingChoice {
                        title: "Invalid Kubernetes Version".to_string(),
                        message,
                        detail: Some(detail),
                        buttons: vec!["OK".to_string()],
                        default_id: 0,
                        cancel_id: 0,
                    })
                    .await;
            }
        }
        self.persist_version(&fallback).await?;
        Ok(fallback)
    }

    async fn persist_version(&self, version: &K3sVersion) -> Result<()> {
        info!(version = %version.short(), "persisting kubernetes version");
        self.ctx
            .settings
            .write_settings(json!({ "kubernetes": { "version": version.short() } }))
            .await
    }

    async fn ensure_images(&self, version: &K3sVersion) -> Result<PathBuf> {
        let progress = self.ctx.progress.clone();
        let report = move |current: u64, max: u64| {
            progress.numeric(
                "Downloading Kubernetes components",
                i64::try_from(current).unwrap_or(i64::MAX),
                i64::try_from(max).unwrap_or(i64::MAX),
            );
        };
        Ok(self.dist.ensure_images(version, &report).await?)
    }

    /// Make sure the artifacts for the desired version (or the closest
    /// cached one) are present, confirming a downgrade with the user.
    pub async fn download(&self, settings: &BackendSettings) -> Result<DownloadOutcome> {
        let desired = self.desired_version(settings).await?;
        let installed = self.installed_version().await?;
        debug!(desired = %desired, installed = ?installed.as_ref().map(K3sVersion::raw), "download");

        let checked = self
            .ctx
            .progress
            .action("Checking k3s images", 100, self.ensure_images(&desired))
            .await;
        let chosen = match checked {
            Ok(_) => desired,
            Err(e) => {
                if !self.ctx.connectivity.is_online().await {
                    return Err(e);
                }
                warn!(version = %desired, error = %e, "could not fetch k3s; looking for a cached version");
                let cached = self.dist.cached_versions().await?;
                match select_closest(&desired, &cached) {
                    Ok(closest) => {
                        info!(version = %closest, "going with alternative version");
                        closest
                    }
                    Err(DistError::NoCachedVersions) => {
                        return Err(Error::Kubernetes {
                            title: "No version available".to_string(),
                            message: "The k3s cache is empty and there is no network connection."
                                .to_string(),
                        })
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        };

        let is_downgrade = installed.as_ref().is_some_and(|i| i.newer_than(&chosen));
        if let (true, Some(installed)) = (is_downgrade, &installed) {
            let accepted = self
                .session()
                .accepted_downgrade
                .as_ref()
                .is_some_and(|v| v.precedence(&chosen) == Ordering::Equal);
            if !accepted {
                if !self.confirm_downgrade(installed, &chosen).await {
                    info!(from = %installed, to = %chosen, "downgrade declined");
                    return Ok(DownloadOutcome::Declined);
                }
                self.session().accepted_downgrade = Some(chosen.clone());
            }
        }
        Ok(DownloadOutcome::Ready {
            version: chosen,
            is_downgrade,
        })
    }

    async fn confirm_downgrade(&self, installed: &K3sVersion, target: &K3sVersion) -> bool {
        let choice = BlockingChoice {
            title: "Confirming migration".to_string(),
            message: format!(
                "Downgrading from {} to {} will lose existing Kubernetes workloads. Delete the data?",
                installed.raw(),
                target.raw()
            ),
            detail: None,
            buttons: vec!["Delete Workloads".to_string(), "Cancel".to_string()],
            default_id: 1,
            cancel_id: 1,
        };
        self.ctx.prompter.blocking_choice(&choice).await == 0
    }

    /// Remove cluster state.  Container images survive.
    pub async fn delete_kube_state(&self) -> Result<()> {
        info!(dirs = ?KUBE_STATE_DIRS, "removing k3s state");
        let mut args = vec!["rm", "-rf"];
        args.extend(KUBE_STATE_DIRS);
        self.vm.exec(&args).await?;
        Ok(())
    }

    /// Remove cluster state when the installed version is newer than `target`.
    pub async fn delete_incompatible_data(&self, target: &K3sVersion) -> Result<()> {
        let Some(existing) = self.installed_version().await? else {
            return Ok(());
        };
        if existing.newer_than(target) {
            self.ctx
                .progress
                .action("Deleting incompatible Kubernetes state", 100, self.delete_kube_state())
                .await?;
        }
        Ok(())
    }

    /// Install `version` into the running VM and record it as installed.
    pub async fn install(
        &self,
        settings: &BackendSettings,
        version: &K3sVersion,
        allow_privileged: bool,
    ) -> Result<()> {
        self.delete_incompatible_data(version).await?;
        self.ctx
            .progress
            .action("Installing k3s", 50, async {
                self.install_k3s(version).await?;
                self.write_service_config(settings, allow_privileged).await
            })
            .await?;
        tokio::fs::create_dir_all(&self.ctx.paths.app_home).await?;
        tokio::fs::write(self.record_path(), version.raw()).await?;
        info!(version = %version, "k3s installed");
        Ok(())
    }

    async fn install_k3s(&self, version: &K3sVersion) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let exe = self.dist.version_dir(version).join(self.dist.names().exe);
            tokio::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).await?;
        }
        let cache = self.vm.guest_path(&self.ctx.paths.cache.join("k3s"));
        self.vm
            .write_file(INSTALL_SCRIPT_PATH, INSTALL_K3S_SCRIPT, 0o755)
            .await?;
        self.vm
            .exec(&[INSTALL_SCRIPT_PATH, version.raw(), &cache])
            .await?;
        Ok(())
    }

    async fn write_service_config(
        &self,
        settings: &BackendSettings,
        allow_privileged: bool,
    ) -> Result<()> {
        let k8s = &settings.kubernetes;
        let mut args = format!("--node-ip {}", self.vm.guest_ip().await?);
        if self.vm.bridged_networking() {
            if k8s.options.flannel {
                let listen = self
                    .vm
                    .listening_interface(settings, allow_privileged)
                    .await?;
                args += &format!(" --flannel-iface {}", listen.iface);
                if !listen.addr.is_empty() {
                    args += &format!(" --node-external-ip {}", listen.addr);
                }
            } else {
                info!("disabling flannel and network policy");
                args += " --flannel-backend=none --disable-network-policy";
            }
        }
        if !k8s.options.traefik {
            args += " --disable traefik";
        }

        let conf = BTreeMap::from([
            ("PORT", k8s.port.to_string()),
            ("ENGINE", settings.container_engine.name.as_str().to_string()),
            ("ADDITIONAL_ARGS", args),
            ("LOG_DIR", "/var/log".to_string()),
        ]);
        self.vm
            .write_file(INIT_SCRIPT_PATH, SERVICE_K3S_SCRIPT, 0o755)
            .await?;
        self.vm.write_file(CONF_PATH, &format_conf(&conf), 0o644).await?;
        self.vm
            .write_file(LOGROTATE_PATH, LOGROTATE_K3S_SCRIPT, 0o644)
            .await?;
        Ok(())
    }

    /// Start k3s and wait until its API answers.  Returns early, without
    /// error, when the start attempt is aborted.
    pub async fn start(&self, settings: &BackendSettings, version: &K3sVersion) -> Result<()> {
        let port = settings.kubernetes.port;
        if !settings.kubernetes.options.flannel {
            self.vm.exec(&["rm", "-f", FLANNEL_CONFLIST]).await?;
        }

        self.ctx
            .progress
            .action("Starting k3s", 100, async {
                self.vm.exec(&["/sbin/rc-update", "--update"]).await?;
                self.vm
                    .exec(&["/sbin/rc-service", "--ifnotstarted", "k3s", "start"])
                    .await?;
                Ok(())
            })
            .await?;

        let ready = self
            .ctx
            .progress
            .action("Waiting for Kubernetes API", 100, self.wait_for_api(port))
            .await?;
        if !ready {
            info!("k3s start aborted");
            return Ok(());
        }

        self.ctx
            .progress
            .action("Updating kubeconfig", 50, async {
                let contents = self.vm.exec(&["cat", GUEST_KUBECONFIG]).await?;
                update_kubeconfig(&self.ctx.paths.kubeconfig, &contents, port).await
            })
            .await?;

        {
            let mut session = self.session();
            session.active = Some(version.clone());
            session.port = Some(port);
            session.watchers = Some(Watchers::start(
                self.vm.clone(),
                self.ctx.paths.logs.clone(),
                self.ctx.events.clone(),
                self.state.clone(),
            ));
        }
        self.ctx
            .events
            .emit(BackendEvent::CurrentPortChanged { port });
        info!(version = %version, port, "kubernetes is ready");
        Ok(())
    }

    /// Wait for the API port and then for k3s to write its kubeconfig.
    /// `false` when aborted first.
    async fn wait_for_api(&self, port: u16) -> Result<bool> {
        info!(port, "waiting for the k3s server");
        loop {
            if self.aborted() {
                return Ok(false);
            }
            let connect = TcpStream::connect(("127.0.0.1", port));
            match tokio::time::timeout(Duration::from_secs(1), connect).await {
                Ok(Ok(_)) => break,
                Ok(Err(e)) => debug!(port, error = %e, "API port not ready"),
                Err(_) => debug!(port, "API port connect timed out"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        loop {
            if self.aborted() {
                return Ok(false);
            }
            if self.vm.exec(&["ls", GUEST_KUBECONFIG]).await.is_ok() {
                debug!("{GUEST_KUBECONFIG} is ready");
                return Ok(true);
            }
            debug!("{GUEST_KUBECONFIG} not present yet; will check again");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Stop watchers; the guest is left alone.
    pub fn cleanup(&self) {
        let mut session = self.session();
        if let Some(mut watchers) = session.watchers.take() {
            watchers.shutdown();
        }
        session.port = None;
    }

    /// Stop the k3s service if it is installed.  Failures are logged.
    pub async fn stop(&self) {
        self.cleanup();
        if self.vm.exec(&["test", "-e", INIT_SCRIPT_PATH]).await.is_ok() {
            if let Err(e) = self
                .vm
                .exec(&["/sbin/rc-service", "--ifstarted", "k3s", "stop"])
                .await
            {
                warn!(error = %e, "failed to stop k3s");
            }
        }
    }

    /// Checkers for settings this layer cares about.
    pub fn restart_overrides(&self) -> FieldOverrides {
        default_overrides()
    }
}

fn named_entries(doc: &Yaml, key: &str) -> Vec<Yaml> {
    doc.get(key)
        .and_then(Yaml::as_sequence)
        .cloned()
        .unwrap_or_default()
}

fn entry_name(entry: &Yaml) -> Option<&str> {
    entry.get("name").and_then(Yaml::as_str)
}

fn rename(entry: &mut Yaml, name: &str) {
    if let Some(map) = entry.as_mapping_mut() {
        map.insert("name".into(), name.into());
    }
}

/// Rename the current context of `k3s_config` (and its cluster and user) to
/// `rancher-desktop`, point it at `port`, and merge it into `user_config`.
/// Entries with the same name are replaced; the current context is only
/// set when the user has none.
pub fn merge_kubeconfig(user_config: Option<Yaml>, k3s_config: &Yaml, port: u16) -> Yaml {
    let current = k3s_config.get("current-context").and_then(Yaml::as_str);
    let contexts = named_entries(k3s_config, "contexts");
    let context = contexts
        .iter()
        .find(|c| current.is_some() && entry_name(c) == current)
        .or_else(|| contexts.first());
    let (cluster_name, user_name) = context
        .map(|c| {
            let field = |k: &str| {
                c.get("context")
                    .and_then(|inner| inner.get(k))
                    .and_then(Yaml::as_str)
                    .map(str::to_string)
            };
            (field("cluster"), field("user"))
        })
        .unwrap_or_default();

    let mut new_context = context.cloned().unwrap_or_else(|| Yaml::Mapping(Mapping::new()));
    rename(&mut new_context, CONTEXT_NAME);
    if let Some(inner) = new_context.get_mut("context").and_then(Yaml::as_mapping_mut) {
        inner.insert("cluster".into(), CONTEXT_NAME.into());
        inner.insert("user".into(), CONTEXT_NAME.into());
    }

    let mut clusters: Vec<Yaml> = named_entries(k3s_config, "clusters")
        .into_iter()
        .filter(|c| entry_name(c) == cluster_name.as_deref())
        .collect();
    for cluster in &mut clusters {
        rename(cluster, CONTEXT_NAME);
        if let Some(inner) = cluster.get_mut("cluster").and_then(Yaml::as_mapping_mut) {
            inner.insert(
                "server".into(),
                format!("https://127.0.0.1:{port}").into(),
            );
        }
    }
    let mut users: Vec<Yaml> = named_entries(k3s_config, "users")
        .into_iter()
        .filter(|u| entry_name(u) == user_name.as_deref())
        .collect();
    for user in &mut users {
        rename(user, CONTEXT_NAME);
    }

    let mut merged = match user_config {
        Some(Yaml::Mapping(map)) => Yaml::Mapping(map),
        _ => {
            let mut map = Mapping::new();
            map.insert("apiVersion".into(), "v1".into());
            map.insert("kind".into(), "Config".into());
            Yaml::Mapping(map)
        }
    };
    let Some(map) = merged.as_mapping_mut() else {
        return merged;
    };
    for (key, additions) in [
        ("contexts", vec![new_context]),
        ("clusters", clusters),
        ("users", users),
    ] {
        let mut list = map
            .get(key)
            .and_then(Yaml::as_sequence)
            .cloned()
            .unwrap_or_default();
        for addition in additions {
            let name = entry_name(&addition).map(str::to_string);
            match list.iter().position(|e| entry_name(e).map(str::to_string) == name) {
                Some(i) => list[i] = addition,
                None => list.push(addition),
            }
        }
        map.insert(key.into(), Yaml::Sequence(list));
    }
    let has_current = map
        .get("current-context")
        .and_then(Yaml::as_str)
        .is_some_and(|c| !c.is_empty());
    if !has_current {
        map.insert("current-context".into(), CONTEXT_NAME.into());
    }
    merged
}

/// Merge the cluster credentials from `k3s_yaml` into the kubeconfig at
/// `path`, replacing it atomically with owner-only permissions.
pub async fn update_kubeconfig(path: &Path, k3s_yaml: &str, port: u16) -> Result<()> {
    let k3s_config: Yaml = serde_yaml::from_str(k3s_yaml)?;
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(raw) => match serde_yaml::from_str::<Yaml>(&raw) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "existing kubeconfig is not valid YAML; replacing");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let merged = merge_kubeconfig(existing, &k3s_config, port);

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&dir).await?;
    let staged = tempfile::Builder::new()
        .prefix(".kubeconfig-")
        .tempfile_in(&dir)?;
    tokio::fs::write(staged.path(), serde_yaml::to_string(&merged)?).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(0o600)).await?;
    }
    staged.persist(path).map_err(|e| Error::Io(e.error))?;
    info!(path = %path.display(), "kubeconfig updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const K3S_YAML: &str = "apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    certificate-authority-data: Q0E=
    server: https://127.0.0.1:6443
users:
- name: default
  user:
    client-key-data: S0VZ
contexts:
- name: default
  context:
    cluster: default
    user: default
current-context: default
";

    #[test]
    fn version_from_k3s_output() {
        let out = "k3s version v1.27.3+k3s1 (0123abcd)\ngo version go1.20.5\n";
        assert_eq!(parse_installed_version(out).unwrap().raw(), "1.27.3+k3s1");
        assert!(parse_installed_version("k3s version dev\n").is_none());
        assert!(parse_installed_version("").is_none());
    }

    #[test]
    fn conf_lines_are_quoted() {
        let conf = BTreeMap::from([
            ("PORT", "6443".to_string()),
            ("ADDITIONAL_ARGS", "--node-ip 192.168.5.15 --disable traefik".to_string()),
        ]);
        assert_eq!(
            format_conf(&conf),
            "ADDITIONAL_ARGS=\"--node-ip 192.168.5.15 --disable traefik\"\nPORT=\"6443\"\n"
        );
    }

    #[test]
    fn merge_into_empty_kubeconfig() {
        let k3s: Yaml = serde_yaml::from_str(K3S_YAML).unwrap();
        let merged = merge_kubeconfig(None, &k3s, 9443);
        assert_eq!(merged["current-context"].as_str(), Some(CONTEXT_NAME));
        assert_eq!(merged["contexts"][0]["name"].as_str(), Some(CONTEXT_NAME));
        assert_eq!(
            merged["contexts"][0]["context"]["cluster"].as_str(),
            Some(CONTEXT_NAME)
        );
        assert_eq!(
            merged["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://127.0.0.1:9443")
        );
        assert_eq!(merged["users"][0]["name"].as_str(), Some(CONTEXT_NAME));
    }

    #[test]
    fn merge_keeps_other_entries_and_current_context() {
        let user: Yaml = serde_yaml::from_str(
            "apiVersion: v1
kind: Config
clusters:
- name: prod
  cluster: {server: https://prod}
- name: rancher-desktop
  cluster: {server: https://stale}
contexts:
- name: prod
  context: {cluster: prod, user: prod}
users:
- name: prod
  user: {token: x}
current-context: prod
",
        )
        .unwrap();
        let k3s: Yaml = serde_yaml::from_str(K3S_YAML).unwrap();
        let merged = merge_kubeconfig(Some(user), &k3s, 6443);
        assert_eq!(merged["current-context"].as_str(), Some("prod"));
        let clusters = merged["clusters"].as_sequence().unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(
            clusters[1]["cluster"]["server"].as_str(),
            Some("https://127.0.0.1:6443")
        );
        assert_eq!(merged["contexts"].as_sequence().unwrap().len(), 2);
        assert_eq!(merged["users"].as_sequence().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn kubeconfig_file_is_written_privately() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".kube/config");
        update_kubeconfig(&path, K3S_YAML, 6443).await.unwrap();
        update_kubeconfig(&path, K3S_YAML, 6443).await.unwrap();

        let written: Yaml = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["contexts"].as_sequence().unwrap().len(), 1);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
