//! The task that runs lifecycle transitions one at a time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::future::try_join;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::events::BackendEvent;
use crate::kube::{format_conf, DownloadOutcome, KubeManager, FLANNEL_CONFLIST};
use crate::settings::{BackendSettings, ContainerEngine};
use crate::sudo::PrivilegeBroker;
use crate::vm::config::DOCKER_SOCKET;
use crate::{Error, Result};

use super::{failure_details, lock, Action, BackendState, Command, Shared, StartFailure};

/// Engine-side services stopped before the VM goes down, in order.
const GUEST_SERVICES: [&str; 4] = ["buildkitd", "docker", "containerd", "rd-openresty"];
const DOCKER_CONTEXT: &str = "rancher-desktop";
const DOCKER_CONF_PATH: &str = "/etc/conf.d/docker";
const CONTAINERD_SOCKET: &str = "/run/k3s/containerd/containerd.sock";
const CNI_CONF_DIR: &str = "/etc/cni/net.d";

const FLANNEL_CONFLIST_JSON: &str = r#"{
  "name": "cbr0",
  "cniVersion": "1.0.0",
  "plugins": [
    {
      "type": "flannel",
      "delegate": {
        "hairpinMode": true,
        "forceAddress": true,
        "isDefaultGateway": true
      }
    },
    {
      "type": "portmap",
      "capabilities": {
        "portMappings": true
      }
    },
    {
      "type": "bandwidth",
      "capabilities": {
        "bandwidth": true
      }
    }
  ]
}
"#;

/// How a start sequence ended, short of an error.
#[derive(Debug, PartialEq, Eq)]
enum StartOutcome {
    Running,
    /// The user refused a downgrade; nothing was changed.
    Declined,
    /// `abort` was called mid-way.
    Aborted,
}

pub(super) struct Orchestrator {
    shared: Arc<Shared>,
    kube: KubeManager,
    broker: PrivilegeBroker,
}

impl Orchestrator {
    pub(super) fn new(shared: Arc<Shared>, kube: KubeManager) -> Self {
        let ctx = &shared.ctx;
        let broker = PrivilegeBroker::new(
            ctx.prompter.clone(),
            ctx.elevator.clone(),
            ctx.settings.clone(),
            ctx.progress.clone(),
            ctx.no_modal_dialogs,
        );
        Self {
            shared,
            kube,
            broker,
        }
    }

    pub(super) async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.dispatch(command).await;
            while let Some(settings) = self.finish_action() {
                info!("running deferred restart");
                self.shared.abort.store(false, Ordering::SeqCst);
                if let Err(e) = self.restart(settings).await {
                    warn!(error = %e, "deferred restart failed");
                }
            }
        }
        debug!("all backend handles dropped; orchestrator exiting");
    }

    async fn dispatch(&self, command: Command) {
        match command {
            Command::Start(settings, reply) => answer(reply, self.start(settings).await),
            Command::Stop(reply) => answer(reply, self.stop().await),
            Command::Restart(settings, reply) => answer(reply, self.restart(settings).await),
            Command::Reset(settings, reply) => answer(reply, self.reset(settings).await),
            Command::Delete { force, reply } => answer(reply, self.del(force).await),
            Command::FactoryReset {
                keep_system_images,
                reply,
            } => answer(reply, self.factory_reset(keep_system_images).await),
        }
    }

    /// Release the action slot, or hand it straight to a queued restart.
    fn finish_action(&self) -> Option<BackendSettings> {
        let mut action = lock(&self.shared.action);
        let pending = lock(&self.shared.pending_restart).take();
        *action = if pending.is_some() {
            Action::Starting
        } else {
            Action::None
        };
        pending
    }

    fn set_state(&self, state: BackendState) {
        let previous = self.shared.state.send_replace(state);
        debug!(from = %previous, to = %state, "backend state");
        self.shared
            .ctx
            .events
            .emit(BackendEvent::StateChanged { state });
        if state.is_teardown() {
            self.kube.cleanup();
        }
    }

    async fn restart(&self, settings: BackendSettings) -> Result<()> {
        self.shared.set_action(Action::Stopping);
        self.stop().await?;
        self.shared.set_action(Action::Starting);
        self.start(settings).await
    }

    async fn start(&self, settings: BackendSettings) -> Result<()> {
        *lock(&self.shared.last_failure) = None;
        self.set_state(BackendState::Starting);

        match self.start_sequence(&settings).await {
            Ok(StartOutcome::Running) => {
                *lock(&self.shared.current) = Some(settings.clone());
                let state = if settings.kubernetes.enabled {
                    BackendState::Started
                } else {
                    BackendState::Disabled
                };
                self.set_state(state);
                info!(%state, "backend started");
                Ok(())
            }
            Ok(StartOutcome::Declined) => {
                info!("start abandoned; downgrade was not confirmed");
                self.set_state(BackendState::Error);
                Ok(())
            }
            Ok(StartOutcome::Aborted) => {
                info!("start aborted; stopping");
                self.shared.set_action(Action::Stopping);
                self.stop().await
            }
            Err(e) => {
                error!(error = %e, "error starting backend");
                self.set_state(BackendState::Error);
                if e.is_fatal() {
                    return Err(e);
                }
                let details = failure_details(&self.shared.ctx.paths.engine_log(), &e).await;
                self.shared.ctx.events.notify(e.title(), e.to_string());
                *lock(&self.shared.last_failure) = Some(StartFailure {
                    title: e.title(),
                    message: e.to_string(),
                    details,
                });
                Ok(())
            }
        }
    }

    async fn start_sequence(&self, settings: &BackendSettings) -> Result<StartOutcome> {
        let ctx = &self.shared.ctx;
        let vm = &self.shared.vm;
        let progress = &ctx.progress;
        let admin_access = settings.application.admin_access;

        vm.ensure_architecture_match()?;
        try_join(
            progress.action(
                "Ensuring virtualization is supported",
                50,
                vm.ensure_virtualization_supported(),
            ),
            progress.action(
                "Updating cluster configuration",
                50,
                vm.update_config(settings, admin_access),
            ),
        )
        .await?;
        if self.shared.aborted() {
            return Ok(StartOutcome::Aborted);
        }

        let mut k3s = None;
        if settings.kubernetes.enabled {
            match self.kube.download(settings).await? {
                DownloadOutcome::Declined => return Ok(StartOutcome::Declined),
                DownloadOutcome::Ready {
                    version,
                    is_downgrade,
                } => k3s = Some((version, is_downgrade)),
            }
        }
        if self.shared.aborted() {
            return Ok(StartOutcome::Aborted);
        }

        if vm.is_running().await? {
            let is_downgrade = k3s.as_ref().is_some_and(|(_, downgrade)| *downgrade);
            progress
                .action("Stopping existing instance", 100, async {
                    self.kube.stop().await;
                    if is_downgrade {
                        // No container may be running while k3s state is deleted.
                        vm.stop_vm().await?;
                        vm.start_vm().await?;
                    }
                    Ok(())
                })
                .await?;
        }
        if self.shared.aborted() {
            return Ok(StartOutcome::Aborted);
        }

        let commands = vm.privileged_commands(settings).await?;
        let allow_privileged = progress
            .action(
                "Asking for permission to run tasks as administrator",
                100,
                self.broker.install(&commands, settings),
            )
            .await?;
        if admin_access && !allow_privileged {
            progress
                .action(
                    "Regenerating configuration to account for lack of permissions",
                    100,
                    vm.update_config(settings, false),
                )
                .await?;
        }
        progress
            .action("Starting virtual machine", 100, vm.start_vm())
            .await?;
        if self.shared.aborted() {
            return Ok(StartOutcome::Aborted);
        }

        let engine = settings.container_engine.name;
        if let Err(e) = progress
            .action(
                "Configuring container engine",
                50,
                self.configure_container_engine(settings),
            )
            .await
        {
            warn!(%engine, error = %e, "could not configure the container engine");
        }
        progress
            .action(
                &format!("Starting {}", engine.service()),
                50,
                self.start_container_engine(engine),
            )
            .await?;

        if let Some((version, _)) = &k3s {
            self.kube.install(settings, version, allow_privileged).await?;
        }
        self.install_auxiliaries(engine).await;
        if self.shared.aborted() {
            return Ok(StartOutcome::Aborted);
        }

        if let Some((version, _)) = &k3s {
            self.kube.start(settings, version).await?;
            if self.shared.aborted() {
                return Ok(StartOutcome::Aborted);
            }
        }
        Ok(StartOutcome::Running)
    }

    /// CNI directory and, with flannel, its network config.
    async fn configure_container_engine(&self, settings: &BackendSettings) -> Result<()> {
        let vm = &self.shared.vm;
        vm.exec(&["mkdir", "-p", CNI_CONF_DIR]).await?;
        if settings.kubernetes.options.flannel {
            vm.write_file(FLANNEL_CONFLIST, FLANNEL_CONFLIST_JSON, 0o644)
                .await?;
        }
        Ok(())
    }

    async fn start_container_engine(&self, engine: ContainerEngine) -> Result<()> {
        let vm = &self.shared.vm;
        match engine {
            ContainerEngine::Moby => {
                let opts = format!(
                    "--host=unix://{DOCKER_SOCKET} --host=unix://{DOCKER_SOCKET}.raw ${{DOCKER_OPTS:-}}"
                );
                let conf = BTreeMap::from([("DOCKER_OPTS", opts)]);
                vm.write_file(DOCKER_CONF_PATH, &format_conf(&conf), 0o644)
                    .await?;
                vm.exec(&["/sbin/rc-service", "--ifnotstarted", "docker", "start"])
                    .await?;
            }
            ContainerEngine::Containerd => {
                vm.exec(&["/sbin/rc-service", "--ifnotstarted", "containerd", "start"])
                    .await?;
                // Fails when the namespace already exists.
                if let Err(e) = vm
                    .exec(&[
                        "ctr",
                        "--address",
                        CONTAINERD_SOCKET,
                        "namespaces",
                        "create",
                        "default",
                    ])
                    .await
                {
                    debug!(error = %e, "default containerd namespace not created");
                }
            }
        }
        Ok(())
    }

    /// Supporting tools in the guest.  Each is optional: a failure is
    /// logged and the feature stays unavailable.
    async fn install_auxiliaries(&self, engine: ContainerEngine) {
        let vm = &self.shared.vm;
        let progress = &self.shared.ctx.progress;
        let resources = vm.guest_path(&self.shared.ctx.paths.resources);
        let link = |name: &str, dest: &str| {
            (
                format!("{resources}/linux/internal/{name}"),
                dest.to_string(),
            )
        };
        let (trivy, trivy_dest) = link("trivy", "/usr/local/bin/trivy");
        let (helper, helper_dest) = link(
            "docker-credential-none",
            "/usr/local/bin/docker-credential-none",
        );
        let (agent, agent_dest) = link(
            "rancher-desktop-guestagent",
            "/usr/local/bin/rancher-desktop-guestagent",
        );

        let (ca, scanner, helper, agent, buildkit) = tokio::join!(
            progress.action("Installing CA certificates", 50, async {
                vm.exec(&["/usr/sbin/update-ca-certificates"]).await.map(drop)
            }),
            progress.action("Installing image scanner", 50, async {
                vm.exec(&["ln", "-sf", &trivy, &trivy_dest]).await.map(drop)
            }),
            progress.action("Installing credential helper", 50, async {
                vm.exec(&["ln", "-sf", &helper, &helper_dest]).await.map(drop)
            }),
            progress.action("Installing guest agent", 50, async {
                vm.exec(&["ln", "-sf", &agent, &agent_dest]).await?;
                vm.exec(&["/sbin/rc-service", "--ifnotstarted", "rancher-desktop-guestagent", "start"])
                    .await
                    .map(drop)
            }),
            progress.action("Installing Buildkit", 50, async {
                if engine == ContainerEngine::Containerd {
                    vm.exec(&["/sbin/rc-service", "--ifnotstarted", "buildkitd", "start"])
                        .await?;
                }
                Ok(())
            }),
        );
        let outcomes = [
            ("CA certificates", ca),
            ("image scanner", scanner),
            ("credential helper", helper),
            ("guest agent", agent),
            ("buildkit", buildkit),
        ];
        for (name, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(component = name, error = %e, "optional component unavailable");
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.set_state(BackendState::Stopping);
        match self.stop_sequence().await {
            Ok(()) => {
                self.set_state(BackendState::Stopped);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "error stopping backend");
                self.set_state(BackendState::Error);
                Err(e)
            }
        }
    }

    async fn stop_sequence(&self) -> Result<()> {
        let vm = &self.shared.vm;
        if !vm.is_running().await? {
            debug!("VM not running; nothing to stop");
            return Ok(());
        }
        self.kube.stop().await;
        for service in GUEST_SERVICES {
            vm.exec(&["/sbin/rc-service", "--ifstarted", service, "stop"])
                .await?;
        }
        if let Err(e) = vm.exec(&["/sbin/fstrim", "/mnt/data"]).await {
            debug!(error = %e, "fstrim failed");
        }
        self.shared
            .ctx
            .progress
            .action("Stopping virtual machine", 100, vm.stop_vm())
            .await
    }

    async fn del(&self, force: bool) -> Result<()> {
        self.set_state(BackendState::Stopping);
        let vm = &self.shared.vm;
        let deleted = self
            .shared
            .ctx
            .progress
            .action("Deleting virtual machine", 10, async {
                if vm.is_registered().await? {
                    if !force && vm.is_running().await? {
                        self.stop_sequence().await?;
                    }
                    vm.delete_vm().await?;
                }
                self.kube.forget_installed().await
            })
            .await;
        match deleted {
            Ok(()) => {
                info!(force, "virtual machine deleted");
                self.set_state(BackendState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.set_state(BackendState::Error);
                Err(e)
            }
        }
    }

    async fn reset(&self, settings: BackendSettings) -> Result<()> {
        let vm = &self.shared.vm;
        self.shared
            .ctx
            .progress
            .action("Resetting Kubernetes", 5, async {
                self.shared.set_action(Action::Stopping);
                self.stop().await?;
                self.shared.set_action(Action::Starting);
                if vm.is_registered().await? {
                    // The VM has to run for the state to be removed.
                    vm.start_vm().await?;
                    self.kube.delete_kube_state().await?;
                }
                Ok(())
            })
            .await?;
        self.start(settings).await
    }

    async fn factory_reset(&self, keep_system_images: bool) -> Result<()> {
        self.del(true).await?;
        let paths = &self.shared.ctx.paths;
        let keep = keep_system_images.then(|| paths.cache.clone());
        let mut doomed = vec![
            paths.config.clone(),
            paths.logs.clone(),
            paths.app_home.clone(),
            paths.alt_app_home.clone(),
        ];
        if !keep_system_images {
            doomed.push(paths.cache.clone());
        }
        let removed = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for dir in doomed {
                remove_tree_except(&dir, keep.as_deref())?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::fatal("Factory Reset", e.to_string()))?;
        removed?;
        clear_docker_context(&paths.home).await?;
        info!(keep_system_images, "factory reset complete");
        Ok(())
    }
}

fn answer(reply: oneshot::Sender<Result<()>>, result: Result<()>) {
    if let Err(Err(e)) = reply.send(result) {
        // The caller stopped waiting; the error would otherwise vanish.
        warn!(error = %e, "lifecycle call failed with no one waiting");
    }
}

/// Remove `dir` entirely, except for `keep` and its ancestors if `keep`
/// lies inside it.
fn remove_tree_except(dir: &Path, keep: Option<&Path>) -> std::io::Result<()> {
    if keep == Some(dir) {
        return Ok(());
    }
    let inside = keep.filter(|k| k.starts_with(dir));
    let result = match inside {
        None => std::fs::remove_dir_all(dir),
        Some(keep) => {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if keep.starts_with(&path) {
                    remove_tree_except(&path, Some(keep))?;
                } else if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
            Ok(())
        }
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Drop `currentContext` from the docker CLI config when it points at us.
async fn clear_docker_context(home: &Path) -> Result<()> {
    let path: PathBuf = home.join(".docker").join("config.json");
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut config: Value = serde_json::from_str(&raw)?;
    let ours = config.get("currentContext").and_then(Value::as_str) == Some(DOCKER_CONTEXT);
    if let (true, Some(map)) = (ours, config.as_object_mut()) {
        map.remove("currentContext");
        tokio::fs::write(&path, serde_json::to_string_pretty(&config)?).await?;
        info!(path = %path.display(), "cleared docker context");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_directory_survives_inside_removed_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let app = tmp.path().join("app");
        let cache = app.join("cache/k3s");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::create_dir_all(app.join("lima/0")).unwrap();
        std::fs::write(app.join("cache/other"), "x").unwrap();
        std::fs::write(app.join("k3s-version"), "v1.29.1+k3s1").unwrap();

        remove_tree_except(&app, Some(&cache)).unwrap();
        assert!(cache.is_dir());
        assert!(!app.join("lima").exists());
        assert!(!app.join("cache/other").exists());
        assert!(!app.join("k3s-version").exists());

        remove_tree_except(&app, None).unwrap();
        assert!(!app.exists());
        remove_tree_except(&app, None).unwrap();
    }

    #[tokio::test]
    async fn only_our_docker_context_is_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let docker = tmp.path().join(".docker");
        std::fs::create_dir_all(&docker).unwrap();
        let config = docker.join("config.json");

        std::fs::write(&config, r#"{"currentContext":"colima","auths":{}}"#).unwrap();
        clear_docker_context(tmp.path()).await.unwrap();
        assert!(std::fs::read_to_string(&config).unwrap().contains("colima"));

        std::fs::write(&config, r#"{"currentContext":"rancher-desktop","auths":{}}"#).unwrap();
        clear_docker_context(tmp.path()).await.unwrap();
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&config).unwrap()).unwrap();
        assert!(value.get("currentContext").is_none());
        assert!(value.get("auths").is_some());

        clear_docker_context(&tmp.path().join("missing")).await.unwrap();
    }
}
