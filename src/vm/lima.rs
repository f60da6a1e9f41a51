//! Lima supervisor (macOS and Linux).
//!
//! Drives a single Lima instance through `limactl` with `LIMA_HOME` pointed at
//! the application's directory.  On macOS it also owns the socket_vmnet
//! networking setup, which is the bulk of the privileged host work.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::host_os;
use crate::process::Cmd;
use crate::settings::{BackendSettings, ContainerEngine};
use crate::sudo::{SudoCommand, SudoReason};
use crate::{Error, Result};

use super::config::{
    default_mounts, network_config, network_policy, sudoers_file, ConfigInputs, HostNetwork,
    LimaConfiguration, LimaNetworkConfig, DOCKER_SOCKET, MACHINE_NAME, PREVIOUS_SUDOERS_PATH,
    SUDOERS_PATH, VAR_RUN,
};
use super::network::{parse_inet_addr, select_listening_interface, ListeningInterface, SLIRP_GUEST_IP};
use super::{
    apply_descriptor, instance_config_path, new_config_path, SupervisorContext, VmStatus,
    VmSupervisor,
};

/// Install location of the socket_vmnet helper.
const VMNET_DIR: &str = "/opt/rancher-desktop";

/// One line of `limactl list --json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LimaListEntry {
    name: String,
    status: String,
    #[serde(default)]
    vm_type: Option<String>,
}

/// Status of instance `name` in `limactl list --json` output.
fn parse_list_output(stdout: &str, name: &str) -> Option<(VmStatus, Option<String>)> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<LimaListEntry>(l) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(line = l, error = %e, "could not parse limactl list output");
                None
            }
        })
        .find(|entry| entry.name == name)
        .map(|entry| {
            let status = match entry.status.as_str() {
                "Running" => VmStatus::Running,
                "Broken" => VmStatus::Broken,
                _ => VmStatus::Stopped,
            };
            (status, entry.vm_type)
        })
}

/// Host interfaces from `system_profiler SPNetworkDataType -json`.
fn parse_host_networks(stdout: &str) -> Result<Vec<HostNetwork>> {
    let doc: Value = serde_json::from_str(stdout)?;
    let entries = doc
        .get("SPNetworkDataType")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(entries
        .iter()
        .filter_map(|entry| {
            let interface = entry.get("interface")?.as_str()?.to_string();
            let ipv4 = entry
                .pointer("/IPv4/Addresses")
                .and_then(Value::as_array)
                .map(|addrs| {
                    addrs
                        .iter()
                        .filter_map(|a| a.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Some(HostNetwork {
                interface,
                dhcp: entry.get("dhcp").is_some(),
                ipv4,
            })
        })
        .collect())
}

/// Follow `path` through symlinks, whether or not the final target exists.
async fn eval_symlink(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    for _ in 0..32 {
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => match tokio::fs::read_link(&current).await
            {
                Ok(target) if target.is_relative() => {
                    current = current
                        .parent()
                        .map(|dir| dir.join(&target))
                        .unwrap_or(target);
                }
                Ok(target) => current = target,
                Err(e) => {
                    debug!(path = %current.display(), error = %e, "readlink failed");
                    break;
                }
            },
            _ => break,
        }
    }
    current
}

/// Whether every file under `src` exists with identical bytes under `dst`.
fn tree_matches(src: &Path, dst: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(src) else {
        return false;
    };
    entries.flatten().all(|entry| {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        match entry.file_type() {
            Ok(t) if t.is_dir() => tree_matches(&from, &to),
            Ok(_) => matches!(
                (std::fs::read(&from), std::fs::read(&to)),
                (Ok(a), Ok(b)) if a == b
            ),
            Err(_) => false,
        }
    })
}

/// Lima-backed VM supervisor.
pub struct LimaSupervisor {
    ctx: SupervisorContext,
    /// SSH port chosen for this process; 0 until first needed.
    ssh_port: Mutex<u16>,
}

impl LimaSupervisor {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self {
            ctx,
            ssh_port: Mutex::new(0),
        }
    }

    fn darwin(&self) -> bool {
        cfg!(target_os = "macos")
    }

    fn limactl(&self) -> Cmd {
        Cmd::new(self.ctx.config.limactl(&self.ctx.paths)).env("LIMA_HOME", self.ctx.paths.lima())
    }

    async fn lima(&self, args: &[&str]) -> Result<String> {
        self.limactl().args(args).read().await
    }

    async fn list_entry(&self) -> Result<Option<(VmStatus, Option<String>)>> {
        let stdout = self.lima(&["list", "--json"]).await?;
        Ok(parse_list_output(&stdout, MACHINE_NAME))
    }

    /// The SSH port stays fixed for the lifetime of a running instance.
    async fn ssh_port(&self) -> Result<u16> {
        let mut port = self.ssh_port.lock().await;
        if *port == 0 {
            if self.is_running().await? {
                let existing = LimaConfiguration::load(&instance_config_path(&self.ctx.paths))
                    .await?
                    .and_then(|c| c.ssh)
                    .map(|s| s.local_port)
                    .filter(|p| *p != 0);
                if let Some(existing) = existing {
                    *port = existing;
                    return Ok(existing);
                }
            }
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            *port = listener.local_addr()?.port();
            debug!(port = *port, "picked ssh port");
        }
        Ok(*port)
    }

    async fn host_networks(&self) -> Result<Vec<HostNetwork>> {
        let stdout = Cmd::new("/usr/sbin/system_profiler")
            .args(["SPNetworkDataType", "-json", "-detailLevel", "basic"])
            .read()
            .await?;
        parse_host_networks(&stdout)
    }

    fn networks_path(&self) -> PathBuf {
        self.ctx.paths.lima().join("_config").join("networks.yaml")
    }

    /// Rewrite `networks.yaml`; a file that is not ours is kept as
    /// `networks.orig.yaml`.
    async fn install_network_config(&self, allow_root: bool) -> Result<LimaNetworkConfig> {
        let path = self.networks_path();
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_yaml::from_str::<LimaNetworkConfig>(&raw) {
                Ok(config) if config.paths.var_run == VAR_RUN => Some(config),
                Ok(_) => {
                    let backup = path.with_file_name("networks.orig.yaml");
                    tokio::fs::rename(&path, &backup).await?;
                    info!(backup = %backup.display(), "lima network configuration has unexpected contents; moved aside");
                    None
                }
                Err(e) => {
                    info!(path = %path.display(), error = %e, "existing networks.yaml is not parsable; replacing");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let interfaces: Vec<String> = if allow_root {
            self.host_networks()
                .await?
                .into_iter()
                .map(|n| n.interface)
                .collect()
        } else {
            Vec::new()
        };
        let config = network_config(existing, &interfaces, allow_root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_yaml::to_string(&config)?).await?;
        Ok(config)
    }

    async fn vmnet_tools_command(&self) -> Result<Option<SudoCommand>> {
        let source = self.ctx.paths.resources.join(host_os()).join("lima/socket_vmnet");
        let (src, dst) = (source.clone(), PathBuf::from(VMNET_DIR));
        let up_to_date = tokio::task::spawn_blocking(move || tree_matches(&src, &dst))
            .await
            .unwrap_or(false);
        if up_to_date {
            return Ok(None);
        }
        info!(source = %source.display(), "vmnet tools install required");
        Ok(Some(SudoCommand {
            reason: SudoReason::Networking,
            commands: vec![
                format!("mkdir -p {VMNET_DIR}"),
                format!("cp -R \"{}/.\" {VMNET_DIR}", source.display()),
                format!("chown -R root:wheel {VMNET_DIR}"),
            ],
            paths: vec![VMNET_DIR.to_string()],
        }))
    }

    async fn run_dir_command(&self) -> Result<Option<SudoCommand>> {
        let mut commands = Vec::new();
        match tokio::fs::metadata(VAR_RUN).await {
            Ok(meta) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::MetadataExt;
                    if meta.uid() == 0 && meta.mode() & 0o002 == 0 {
                        return Ok(None);
                    }
                }
                #[cfg(not(unix))]
                let _ = meta;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                commands.push(format!("mkdir -p {VAR_RUN}"));
                commands.push(format!("chmod 755 {VAR_RUN}"));
            }
            Err(e) => return Err(e.into()),
        }
        commands.push(format!("chown -R root:daemon {VAR_RUN}"));
        commands.push(format!("chmod -R o-w {VAR_RUN}"));
        Ok(Some(SudoCommand {
            reason: SudoReason::Networking,
            commands,
            paths: vec![VAR_RUN.to_string()],
        }))
    }

    async fn sudoers_command(&self) -> Result<Option<SudoCommand>> {
        let mut commands = Vec::new();
        let mut paths = Vec::new();
        if tokio::fs::metadata(PREVIOUS_SUDOERS_PATH).await.is_ok() {
            commands.push(format!("rm -f {PREVIOUS_SUDOERS_PATH}"));
            paths.push(PREVIOUS_SUDOERS_PATH.to_string());
        }

        let sudoers = sudoers_file(&self.install_network_config(true).await?)?;
        let current = match tokio::fs::read_to_string(SUDOERS_PATH).await {
            Ok(current) => Some(current),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current.as_deref() != Some(sudoers.as_str()) {
            let staged = tempfile::Builder::new()
                .prefix("rd-sudoers")
                .suffix(".txt")
                .tempfile()?;
            tokio::fs::write(staged.path(), &sudoers).await?;
            let (_, staged) = staged.keep().map_err(|e| Error::Io(e.error))?;
            let dir = Path::new(SUDOERS_PATH)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            commands.push(format!(
                "mkdir -p \"{dir}\" && cp \"{}\" {SUDOERS_PATH} && rm -f \"{}\"",
                staged.display(),
                staged.display()
            ));
            paths.push(SUDOERS_PATH.to_string());
        }

        Ok((!commands.is_empty()).then_some(SudoCommand {
            reason: SudoReason::Networking,
            commands,
            paths,
        }))
    }

    async fn docker_socket_command(&self, settings: &BackendSettings) -> Option<SudoCommand> {
        if settings.container_engine.name != ContainerEngine::Moby {
            return None;
        }
        let target = self.ctx.paths.docker_socket();
        if eval_symlink(Path::new(DOCKER_SOCKET)).await == target {
            return None;
        }
        Some(SudoCommand {
            reason: SudoReason::DockerSocket,
            commands: vec![format!(
                "ln -sf \"{}\" \"{DOCKER_SOCKET}\"",
                target.display()
            )],
            paths: vec![DOCKER_SOCKET.to_string()],
        })
    }

    /// Put the bundled base image in place of the instance's boot disk.
    async fn replace_base_disk(&self) -> Result<()> {
        if self.is_running().await? {
            self.lima(&["stop", MACHINE_NAME]).await?;
        }
        let basedisk = self.ctx.paths.lima().join(MACHINE_NAME).join("basedisk");
        tokio::fs::copy(self.ctx.config.base_image(&self.ctx.paths), &basedisk).await?;
        Ok(())
    }

    /// Expose Lima's per-instance logs next to ours.
    async fn link_logs(&self) {
        let machine_dir = self.ctx.paths.lima().join(MACHINE_NAME);
        let Ok(mut dir) = tokio::fs::read_dir(&machine_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".log") {
                continue;
            }
            let link = self.ctx.paths.logs.join(format!("lima.{name}"));
            #[cfg(unix)]
            if let Err(e) = tokio::fs::symlink(entry.path(), &link).await {
                debug!(link = %link.display(), error = %e, "could not link lima log");
            }
            #[cfg(not(unix))]
            let _ = link;
        }
    }
}

#[async_trait]
impl VmSupervisor for LimaSupervisor {
    fn name(&self) -> &'static str {
        "lima"
    }

    async fn status(&self) -> Result<VmStatus> {
        Ok(self
            .list_entry()
            .await?
            .map(|(status, _)| status)
            .unwrap_or(VmStatus::NotRegistered))
    }

    fn ensure_architecture_match(&self) -> Result<()> {
        if translated_process() {
            return Err(Error::fatal(
                "Fatal Error",
                "Rancher Desktop for x86_64 does not work on arm64.",
            ));
        }
        Ok(())
    }

    async fn ensure_virtualization_supported(&self) -> Result<()> {
        if self.darwin() {
            let out = Cmd::new("/usr/sbin/sysctl")
                .args(["-n", "kern.hv_support"])
                .read()
                .await
                .unwrap_or_default();
            if out.trim() != "1" {
                return Err(Error::fatal(
                    "Fatal Error",
                    "Virtualization does not appear to be supported on your machine.",
                ));
            }
            return Ok(());
        }
        let cpuinfo = tokio::fs::read_to_string("/proc/cpuinfo").await?;
        let supported = cpuinfo
            .lines()
            .filter(|l| l.starts_with("flags"))
            .any(|l| l.split_whitespace().any(|f| f == "vmx" || f == "svm"));
        if !supported && tokio::fs::metadata("/dev/kvm").await.is_err() {
            return Err(Error::fatal(
                "Virtualization not supported",
                "Virtualization does not appear to be supported on your machine. \
                 Please enable it in your BIOS or firmware settings.",
            ));
        }
        Ok(())
    }

    async fn update_config(&self, settings: &BackendSettings, allow_privileged: bool) -> Result<()> {
        let paths = &self.ctx.paths;
        let vm = &settings.virtual_machine;
        let host_networks = if self.darwin() {
            self.install_network_config(allow_privileged).await?;
            if allow_privileged {
                self.host_networks().await?
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        let inputs = ConfigInputs {
            base_image: self.ctx.config.base_image(paths),
            arch: self.ctx.config.arch().as_str().to_string(),
            mounts: default_mounts(
                &paths.home,
                &[&paths.cache, &paths.logs, &paths.resources],
                self.darwin(),
                vm.mount_type,
            ),
            ssh_port: self.ssh_port().await?,
            docker_host_socket: paths.docker_socket(),
            network: network_policy(self.darwin(), allow_privileged, vm.vm_type, &host_networks),
        };
        apply_descriptor(&self.ctx, settings, &inputs, || self.replace_base_disk()).await?;
        Ok(())
    }

    async fn privileged_commands(&self, settings: &BackendSettings) -> Result<Vec<SudoCommand>> {
        let progress = &self.ctx.progress;
        let mut commands = Vec::new();
        if self.darwin() {
            commands.extend(
                progress
                    .action("Setting up virtual ethernet", 10, self.vmnet_tools_command())
                    .await?,
            );
            let (run_dir, sudoers) = progress
                .action("Setting Lima permissions", 10, async {
                    Ok((self.run_dir_command().await?, self.sudoers_command().await?))
                })
                .await?;
            commands.extend(run_dir);
            commands.extend(sudoers);
        }
        commands.extend(
            progress
                .action("Setting up Docker socket", 10, async {
                    Ok(self.docker_socket_command(settings).await)
                })
                .await?,
        );
        Ok(commands)
    }

    async fn start_vm(&self) -> Result<()> {
        let pending = new_config_path(&self.ctx.paths);
        let target = if self.is_registered().await? {
            MACHINE_NAME.to_string()
        } else {
            pending.display().to_string()
        };
        let result = self.lima(&["start", "--tty=false", &target]).await;
        self.link_logs().await;
        if let Err(e) = tokio::fs::remove_file(&pending).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %pending.display(), error = %e, "could not remove new instance config");
            }
        }
        result.map(|_| ())
    }

    async fn stop_vm(&self) -> Result<()> {
        let vm_type = self.list_entry().await?.and_then(|(_, t)| t);
        match self.lima(&["stop", MACHINE_NAME]).await {
            Ok(_) => Ok(()),
            // The first stop of a new VZ machine can panic in limactl.
            Err(e) if vm_type.as_deref() == Some("vz") => {
                warn!(error = %e, "limactl stop failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_vm(&self) -> Result<()> {
        self.lima(&["delete", "--force", MACHINE_NAME]).await?;
        Ok(())
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        self.limactl()
            .args(["shell", "--workdir=/", MACHINE_NAME, "sudo"])
            .args(args)
            .read()
            .await
    }

    async fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()> {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let workdir = tempfile::Builder::new()
            .prefix(&format!("rd-{name}-"))
            .tempdir()?;
        let staged = workdir.path().join(&name);
        tokio::fs::write(&staged, contents).await?;

        let tag = workdir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let guest_tmp = format!("/tmp/{tag}.{name}");
        let result = async {
            self.lima(&[
                "copy",
                &staged.display().to_string(),
                &format!("{MACHINE_NAME}:{guest_tmp}"),
            ])
            .await?;
            self.exec(&["chmod", &format!("{mode:o}"), &guest_tmp]).await?;
            self.exec(&["mv", &guest_tmp, path]).await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            let _ = self.exec(&["rm", "-f", &guest_tmp]).await;
        }
        result
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
        Ok(select_listening_interface(
            allow_privileged,
            settings.application.admin_access,
            settings.virtual_machine.vm_type,
            SLIRP_GUEST_IP,
            &self.ctx.events,
            |iface| async move {
                self.exec(&["ip", "--family", "inet", "addr", "show", iface])
                    .await
                    .ok()
                    .and_then(|out| parse_inet_addr(&out))
            },
        )
        .await)
    }

    fn bridged_networking(&self) -> bool {
        self.darwin()
    }

    async fn current_resources(&self) -> Result<Option<(f64, u32)>> {
        let config = LimaConfiguration::load(&instance_config_path(&self.ctx.paths)).await?;
        Ok(config.map(|c| c.resources()))
    }

    fn guest_command(&self, args: &[&str]) -> Option<Cmd> {
        Some(
            self.limactl()
                .args(["shell", "--workdir=/", MACHINE_NAME, "sudo"])
                .args(args),
        )
    }
}

/// An x86_64 build running under Rosetta on Apple silicon.
#[cfg(target_os = "macos")]
fn translated_process() -> bool {
    let mut value: libc::c_int = 0;
    let mut size = std::mem::size_of::<libc::c_int>();
    let name = c"sysctl.proc_translated";
    // SAFETY: name is NUL-terminated and value/size describe a valid c_int.
    let rc = unsafe {
        libc::sysctlbyname(
            name.as_ptr(),
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    rc == 0 && value == 1
}

#[cfg(not(target_os = "macos"))]
fn translated_process() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_output_finds_our_instance() {
        let out = "{\"name\":\"other\",\"status\":\"Running\"}\n\
                   {\"name\":\"0\",\"status\":\"Stopped\",\"vmType\":\"vz\"}\n";
        assert_eq!(
            parse_list_output(out, "0"),
            Some((VmStatus::Stopped, Some("vz".to_string())))
        );
        assert_eq!(parse_list_output("", "0"), None);
        assert_eq!(
            parse_list_output("not json\n{\"name\":\"0\",\"status\":\"Broken\"}", "0"),
            Some((VmStatus::Broken, None))
        );
    }

    #[test]
    fn host_networks_from_system_profiler() {
        let out = r#"{"SPNetworkDataType":[
            {"interface":"en0","dhcp":{"dhcp_message_type":"0x5"},"IPv4":{"Addresses":["192.168.1.20"]}},
            {"interface":"en5","IPv4":{}},
            {"_name":"bridge"}
        ]}"#;
        let nets = parse_host_networks(out).unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[0].dhcp);
        assert_eq!(nets[0].ipv4, vec!["192.168.1.20"]);
        assert!(!nets[1].dhcp);
        assert!(nets[1].ipv4.is_empty());
    }

    #[test]
    fn identical_trees_match() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, dst) = (tmp.path().join("src"), tmp.path().join("dst"));
        for dir in [&src, &dst] {
            std::fs::create_dir_all(dir.join("bin")).unwrap();
            std::fs::write(dir.join("bin/socket_vmnet"), b"binary").unwrap();
        }
        assert!(tree_matches(&src, &dst));
        std::fs::write(dst.join("bin/socket_vmnet"), b"older").unwrap();
        assert!(!tree_matches(&src, &dst));
        assert!(!tree_matches(&src, &tmp.path().join("missing")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_chains_are_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("docker.sock");
        let hop = tmp.path().join("hop");
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &hop).unwrap();
        std::os::unix::fs::symlink(&hop, &link).unwrap();
        assert_eq!(eval_symlink(&link).await, target);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn status_comes_from_limactl_list() {
        use crate::config::EngineConfig;
        use crate::events::EventBus;
        use crate::paths::Paths;
        use crate::progress::ProgressTracker;
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("limactl");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ \"$1\" = list ] && echo '{\"name\":\"0\",\"status\":\"Running\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let events = EventBus::new();
        let config = EngineConfig {
            limactl: Some(script),
            ..Default::default()
        };
        let lima = LimaSupervisor::new(SupervisorContext {
            paths: Paths::under(tmp.path()),
            config,
            progress: ProgressTracker::new(events.clone()),
            events,
        });
        assert_eq!(lima.status().await.unwrap(), VmStatus::Running);
        assert!(lima.is_registered().await.unwrap());
        let cmd = lima.guest_command(&["tail", "-F", "/var/log/k3s.log"]).unwrap();
        assert_eq!(cmd.display(), "limactl shell --workdir=/ 0 sudo tail -F /var/log/k3s.log");
    }
}
