//! In-memory supervisor for tests.
//!
//! The guest is simulated: commands are recorded, the few the backend reads
//! answers from (k3s version, kubeconfig, interface addresses) are answered
//! from state, and everything else succeeds with empty output.  The VM
//! descriptor goes through the real merge and is written under the Lima
//! directory like the real thing.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::process::Cmd;
use crate::settings::BackendSettings;
use crate::sudo::SudoCommand;
use crate::{Error, Result};

use super::config::{default_mounts, network_policy, ConfigInputs, HostNetwork, LimaConfiguration};
use super::network::{select_listening_interface, ListeningInterface, SLIRP_GUEST_IP};
use super::{
    apply_descriptor, instance_config_path, new_config_path, SupervisorContext, VmStatus,
    VmSupervisor,
};

/// Guest path of the k3s kubeconfig.
const GUEST_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/// Knobs for the simulated host and guest.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Behave like macOS: networks are managed and k3s is told about them.
    pub darwin: bool,
    pub host_networks: Vec<HostNetwork>,
    /// IPv4 address per guest interface.
    pub guest_addrs: BTreeMap<String, String>,
    pub sudo_commands: Vec<SudoCommand>,
    pub virtualization_supported: bool,
    pub arch_matches: bool,
    /// Delay before every guest command completes.
    pub exec_delay: Duration,
    /// Guest commands containing any of these fail.
    pub fail_on: Vec<String>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            darwin: false,
            host_networks: Vec::new(),
            guest_addrs: BTreeMap::new(),
            sudo_commands: Vec::new(),
            virtualization_supported: true,
            arch_matches: true,
            exec_delay: Duration::ZERO,
            fail_on: Vec::new(),
        }
    }
}

struct MockState {
    status: VmStatus,
    k3s_version: Option<String>,
    k3s_running: bool,
    commands: Vec<String>,
    files: BTreeMap<String, String>,
    base_image_upgrades: u32,
}

/// Simulated VM.
pub struct MockSupervisor {
    ctx: SupervisorContext,
    options: MockOptions,
    state: Mutex<MockState>,
}

impl MockSupervisor {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self::with_options(ctx, MockOptions::default())
    }

    pub fn with_options(ctx: SupervisorContext, options: MockOptions) -> Self {
        Self {
            ctx,
            options,
            state: Mutex::new(MockState {
                status: VmStatus::NotRegistered,
                k3s_version: None,
                k3s_running: false,
                commands: Vec::new(),
                files: BTreeMap::new(),
                base_image_upgrades: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, entry: String) {
        debug!(%entry, "mock vm");
        self.lock().commands.push(entry);
    }

    /// Every guest command and lifecycle call, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Position of the first recorded entry containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.lock().commands.iter().position(|c| c.contains(needle))
    }

    /// k3s version as reported by the simulated binary.
    pub fn installed_k3s(&self) -> Option<String> {
        self.lock().k3s_version.clone()
    }

    /// Pretend a k3s build is already installed.
    pub fn set_installed_k3s(&self, raw: &str) {
        self.lock().k3s_version = Some(raw.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn base_image_upgrades(&self) -> u32 {
        self.lock().base_image_upgrades
    }

    fn kubeconfig(&self) -> String {
        "apiVersion: v1\n\
         kind: Config\n\
         clusters:\n\
         - name: default\n  cluster:\n    certificate-authority-data: Q0E=\n    server: https://127.0.0.1:6443\n\
         users:\n\
         - name: default\n  user:\n    client-certificate-data: Q0VSVA==\n    client-key-data: S0VZ\n\
         contexts:\n\
         - name: default\n  context:\n    cluster: default\n    user: default\n\
         current-context: default\n"
            .to_string()
    }

    fn fail(command: &str) -> Error {
        Error::Command {
            command: command.to_string(),
            code: Some(1),
            stderr: "mock failure".to_string(),
        }
    }
}

#[async_trait]
impl VmSupervisor for MockSupervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn status(&self) -> Result<VmStatus> {
        Ok(self.lock().status)
    }

    fn ensure_architecture_match(&self) -> Result<()> {
        if self.options.arch_matches {
            Ok(())
        } else {
            Err(Error::fatal(
                "Fatal Error",
                "Rancher Desktop for x86_64 does not work on aarch64.",
            ))
        }
    }

    async fn ensure_virtualization_supported(&self) -> Result<()> {
        if self.options.virtualization_supported {
            Ok(())
        } else {
            Err(Error::fatal(
                "Virtualization not supported",
                "Virtualization does not appear to be supported on your machine.",
            ))
        }
    }

    async fn update_config(&self, settings: &BackendSettings, allow_privileged: bool) -> Result<()> {
        let paths = &self.ctx.paths;
        let vm = &settings.virtual_machine;
        let inputs = ConfigInputs {
            base_image: self.ctx.config.base_image(paths),
            arch: self.ctx.config.arch().as_str().to_string(),
            mounts: default_mounts(
                &paths.home,
                &[&paths.cache, &paths.logs, &paths.resources],
                self.options.darwin,
                vm.mount_type,
            ),
            ssh_port: 2222,
            docker_host_socket: paths.docker_socket(),
            network: network_policy(
                self.options.darwin,
                allow_privileged,
                vm.vm_type,
                &self.options.host_networks,
            ),
        };
        apply_descriptor(&self.ctx, settings, &inputs, || async {
            let mut state = self.lock();
            if state.status == VmStatus::Running {
                state.status = VmStatus::Stopped;
                state.commands.push("stop".to_string());
            }
            state.base_image_upgrades += 1;
            state.commands.push("replace basedisk".to_string());
            Ok(())
        })
        .await?;
        self.record(format!("update-config allow_privileged={allow_privileged}"));
        Ok(())
    }

    async fn privileged_commands(&self, _settings: &BackendSettings) -> Result<Vec<SudoCommand>> {
        Ok(self.options.sudo_commands.clone())
    }

    async fn start_vm(&self) -> Result<()> {
        let pending = new_config_path(&self.ctx.paths);
        if tokio::fs::metadata(&pending).await.is_ok() {
            let target = instance_config_path(&self.ctx.paths);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&pending, &target).await?;
        }
        let mut state = self.lock();
        if state.status != VmStatus::Running {
            state.status = VmStatus::Running;
            state.commands.push("start".to_string());
        }
        Ok(())
    }

    async fn stop_vm(&self) -> Result<()> {
        let mut state = self.lock();
        state.status = VmStatus::Stopped;
        state.k3s_running = false;
        state.commands.push("stop".to_string());
        Ok(())
    }

    async fn delete_vm(&self) -> Result<()> {
        let dir = instance_config_path(&self.ctx.paths);
        if let Some(dir) = dir.parent() {
            match tokio::fs::remove_dir_all(dir).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        let mut state = self.lock();
        state.status = VmStatus::NotRegistered;
        state.k3s_version = None;
        state.k3s_running = false;
        state.files.clear();
        state.commands.push("delete".to_string());
        Ok(())
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        if !self.options.exec_delay.is_zero() {
            tokio::time::sleep(self.options.exec_delay).await;
        }
        let line = args.join(" ");
        let mut state = self.lock();
        state.commands.push(line.clone());
        if state.status != VmStatus::Running {
            return Err(Error::Command {
                command: line,
                code: Some(255),
                stderr: "instance is not running".to_string(),
            });
        }
        if self.options.fail_on.iter().any(|f| line.contains(f.as_str())) {
            return Err(Self::fail(&line));
        }

        match args {
            ["/usr/local/bin/k3s", "--version"] => match &state.k3s_version {
                Some(raw) => Ok(format!("k3s version {raw} (0123abcd)\ngo version go1.20\n")),
                None => Err(Self::fail(&line)),
            },
            [script, raw, ..] if script.ends_with("install-k3s") => {
                state.k3s_version = Some(raw.to_string());
                Ok(String::new())
            }
            ["/sbin/rc-service", "--ifnotstarted", "k3s", "start"] => {
                state.k3s_running = true;
                Ok(String::new())
            }
            ["/sbin/rc-service", "--ifstarted", "k3s", "stop"] => {
                state.k3s_running = false;
                Ok(String::new())
            }
            ["ls", GUEST_KUBECONFIG] if state.k3s_running => Ok(format!("{GUEST_KUBECONFIG}\n")),
            ["ls", GUEST_KUBECONFIG] => Err(Self::fail(&line)),
            ["cat", GUEST_KUBECONFIG] => Ok(self.kubeconfig()),
            ["test", "-e", path] if state.files.contains_key(*path) => Ok(String::new()),
            ["test", "-e", _] => Err(Self::fail(&line)),
            ["ip", "--family", "inet", "addr", "show", iface] => {
                match self.options.guest_addrs.get(*iface) {
                    Some(addr) => Ok(format!("    inet {addr}/24 scope global {iface}\n")),
                    None => Ok(String::new()),
                }
            }
            _ => Ok(String::new()),
        }
    }

    async fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()> {
        let mut state = self.lock();
        state.commands.push(format!("write {path} {mode:o}"));
        state.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn guest_path(&self, host: &Path) -> String {
        host.display().to_string()
    }

    async fn guest_ip(&self) -> Result<String> {
        Ok(SLIRP_GUEST_IP.to_string())
    }

    async fn listening_interface(
        &self,
        settings: &BackendSettings,
        allow_privileged: bool,
    ) -> Result<ListeningInterface> {
        let addrs = &self.options.guest_addrs;
        Ok(select_listening_interface(
            allow_privileged,
            settings.application.admin_access,
            settings.virtual_machine.vm_type,
            SLIRP_GUEST_IP,
            &self.ctx.events,
            |iface| {
                let found = addrs.get(iface).cloned();
                async move { found }
            },
        )
        .await)
    }

    fn bridged_networking(&self) -> bool {
        self.options.darwin
    }

    async fn current_resources(&self) -> Result<Option<(f64, u32)>> {
        let config = LimaConfiguration::load(&instance_config_path(&self.ctx.paths)).await?;
        Ok(config.map(|c| c.resources()))
    }

    fn guest_command(&self, _args: &[&str]) -> Option<Cmd> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::paths::Paths;
    use crate::progress::ProgressTracker;

    fn mock(root: &Path) -> MockSupervisor {
        let events = EventBus::new();
        MockSupervisor::new(SupervisorContext {
            paths: Paths::under(root),
            config: EngineConfig::default(),
            progress: ProgressTracker::new(events.clone()),
            events,
        })
    }

    #[tokio::test]
    async fn start_moves_new_descriptor_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = mock(tmp.path());
        vm.update_config(&BackendSettings::default(), false).await.unwrap();
        let paths = Paths::under(tmp.path());
        assert!(new_config_path(&paths).exists());

        vm.start_vm().await.unwrap();
        assert!(!new_config_path(&paths).exists());
        assert!(instance_config_path(&paths).exists());
        assert_eq!(vm.current_resources().await.unwrap(), Some((4.0, 4)));
        assert!(vm.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn simulates_k3s_install() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = mock(tmp.path());
        vm.start_vm().await.unwrap();
        assert!(vm.exec(&["/usr/local/bin/k3s", "--version"]).await.is_err());

        vm.exec(&["/usr/local/bin/install-k3s", "v1.27.3+k3s1", "/cache"])
            .await
            .unwrap();
        let out = vm.exec(&["/usr/local/bin/k3s", "--version"]).await.unwrap();
        assert!(out.starts_with("k3s version v1.27.3+k3s1"));
        assert_eq!(vm.installed_k3s().as_deref(), Some("v1.27.3+k3s1"));
    }

    #[tokio::test]
    async fn exec_needs_a_running_vm() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = mock(tmp.path());
        assert!(vm.exec(&["true"]).await.is_err());
        vm.start_vm().await.unwrap();
        vm.stop_vm().await.unwrap();
        assert_eq!(vm.status().await.unwrap(), VmStatus::Stopped);
        assert!(vm.exec(&["true"]).await.is_err());
    }
}
