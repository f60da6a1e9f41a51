//! WSL2 supervisor (Windows).
//!
//! The VM is a pair of WSL distributions: `rancher-desktop` runs the engine
//! and `rancher-desktop-data` holds persistent state.  Resources are a WSL
//! global setting, so there is no descriptor to merge; the settings snapshot
//! is only logged.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::process::Cmd;
use crate::settings::BackendSettings;
use crate::sudo::SudoCommand;
use crate::{Error, Result};

use super::network::{guest_ip_from_proc, Backoff, ListeningInterface};
use super::{SupervisorContext, VmStatus, VmSupervisor};

pub const DISTRO: &str = "rancher-desktop";
pub const DATA_DISTRO: &str = "rancher-desktop-data";

const WSL: &str = "wsl.exe";

/// Decode `wsl.exe` output, which is UTF-16LE on most Windows builds.
fn decode_wsl_output(bytes: &[u8]) -> String {
    let looks_wide = bytes.len() >= 2 && bytes.len() % 2 == 0 && bytes[1] == 0;
    let text = if looks_wide {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    text.trim_start_matches('\u{feff}').to_string()
}

fn lists_distro(listing: &str, name: &str) -> bool {
    listing
        .split(['\r', '\n'])
        .map(|l| l.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .any(|l| l == name)
}

/// Translate a Windows host path into its `/mnt/<drive>` form.
fn wsl_path(host: &Path) -> String {
    let raw = host.display().to_string();
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let rest = chars.as_str().replace('\\', "/");
            format!("/mnt/{}{}", drive.to_ascii_lowercase(), rest)
        }
        _ => raw.replace('\\', "/"),
    }
}

/// `memory` (GiB) and `processors` from the `[wsl2]` section of `.wslconfig`.
fn parse_wslconfig(contents: &str) -> (Option<f64>, Option<u32>) {
    let mut in_wsl2 = false;
    let (mut memory, mut cpus) = (None, None);
    for line in contents.lines().map(str::trim) {
        if line.starts_with('[') {
            in_wsl2 = line.eq_ignore_ascii_case("[wsl2]");
            continue;
        }
        if !in_wsl2 {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "memory" => memory = parse_size_gib(value),
            "processors" => cpus = value.parse().ok(),
            _ => {}
        }
    }
    (memory, cpus)
}

fn parse_size_gib(value: &str) -> Option<f64> {
    let upper = value.to_ascii_uppercase();
    let (number, scale) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1.0)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1.0 / 1024.0)
    } else {
        (upper.as_str(), 1.0 / (1024.0 * 1024.0 * 1024.0))
    };
    number.trim().parse::<f64>().ok().map(|n| n * scale)
}

pub struct WslSupervisor {
    ctx: SupervisorContext,
}

impl WslSupervisor {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self { ctx }
    }

    fn wsl(&self) -> Cmd {
        Cmd::new(WSL)
    }

    async fn listed(&self, running_only: bool) -> Result<String> {
        let mut cmd = self.wsl().args(["--list", "--quiet"]);
        if running_only {
            cmd = cmd.arg("--running");
        }
        let output = cmd.output().await?;
        // `--running` exits non-zero when nothing runs.
        if !output.success() && !running_only {
            return Err(Error::Command {
                command: cmd.display(),
                code: Some(output.exit_code),
                stderr: decode_wsl_output(&output.stderr).trim().to_string(),
            });
        }
        Ok(decode_wsl_output(&output.stdout))
    }

    fn distro_file(&self) -> std::path::PathBuf {
        self.ctx
            .paths
            .resources
            .join("win32")
            .join(format!("distro-{}.tar", self.ctx.config.image_version))
    }

    async fn ensure_registered(&self, name: &str) -> Result<()> {
        if lists_distro(&self.listed(false).await?, name) {
            return Ok(());
        }
        let install_dir = self.ctx.paths.app_home.join("distro").join(name);
        tokio::fs::create_dir_all(&install_dir).await?;
        info!(distro = name, "registering WSL distribution");
        self.wsl()
            .arg("--import")
            .arg(name)
            .arg(install_dir.as_os_str())
            .arg(self.distro_file().as_os_str())
            .args(["--version", "2"])
            .run()
            .await?;
        if !lists_distro(&self.listed(false).await?, name) {
            return Err(Error::fatal(
                "Error registering WSL2 distribution",
                format!("{name} is not listed after import"),
            ));
        }
        Ok(())
    }

    fn exec_cmd(&self, args: &[&str]) -> Cmd {
        self.wsl()
            .args(["--distribution", DISTRO, "--exec"])
            .args(args)
    }
}

#[async_trait]
impl VmSupervisor for WslSupervisor {
    fn name(&self) -> &'static str {
        "wsl"
    }

    async fn status(&self) -> Result<VmStatus> {
        if !lists_distro(&self.listed(false).await?, DISTRO) {
            return Ok(VmStatus::NotRegistered);
        }
        if lists_distro(&self.listed(true).await?, DISTRO) {
            Ok(VmStatus::Running)
        } else {
            Ok(VmStatus::Stopped)
        }
    }

    fn ensure_architecture_match(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_virtualization_supported(&self) -> Result<()> {
        let output = self.wsl().arg("--status").output().await?;
        if !output.success() {
            return Err(Error::fatal(
                "WSL not available",
                "Windows Subsystem for Linux does not appear to be installed.",
            ));
        }
        Ok(())
    }

    async fn update_config(&self, settings: &BackendSettings, allow_privileged: bool) -> Result<()> {
        debug!(settings = %settings.to_value(), allow_privileged, "WSL configuration");
        Ok(())
    }

    async fn privileged_commands(&self, _settings: &BackendSettings) -> Result<Vec<SudoCommand>> {
        Ok(Vec::new())
    }

    async fn start_vm(&self) -> Result<()> {
        self.ensure_registered(DATA_DISTRO).await?;
        self.ensure_registered(DISTRO).await?;
        // Any command boots the distribution.
        self.exec_cmd(&["/bin/true"]).run().await?;
        Ok(())
    }

    async fn stop_vm(&self) -> Result<()> {
        if let Err(e) = self.wsl().args(["--terminate", DISTRO]).run().await {
            // Terminating a stopped distribution fails.
            if self.is_running().await? {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete_vm(&self) -> Result<()> {
        for name in [DISTRO, DATA_DISTRO] {
            if lists_distro(&self.listed(false).await?, name) {
                self.wsl().args(["--unregister", name]).run().await?;
            }
        }
        Ok(())
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        self.exec_cmd(args).read().await
    }

    async fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()> {
        let script = format!("cat > \"$0\" && chmod {mode:o} \"$0\"");
        self.exec_cmd(&["/bin/sh", "-c", &script, path])
            .stdin(contents)
            .run()
            .await?;
        Ok(())
    }

    fn guest_path(&self, host: &Path) -> String {
        wsl_path(host)
    }

    async fn guest_ip(&self) -> Result<String> {
        Backoff::host_ip(self.ctx.config.host_ip_attempts)
            .retry("the WSL VM address", || async {
                let route = self.exec(&["cat", "/proc/net/route"]).await?;
                let fib_trie = self.exec(&["cat", "/proc/net/fib_trie"]).await?;
                Ok(guest_ip_from_proc(&route, &fib_trie))
            })
            .await
    }

    async fn listening_interface(
        &self,
        _settings: &BackendSettings,
        _allow_privileged: bool,
    ) -> Result<ListeningInterface> {
        Ok(ListeningInterface {
            iface: "eth0".to_string(),
            addr: self.guest_ip().await?,
        })
    }

    fn bridged_networking(&self) -> bool {
        false
    }

    async fn current_resources(&self) -> Result<Option<(f64, u32)>> {
        let path = self.ctx.paths.home.join(".wslconfig");
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match parse_wslconfig(&contents) {
                (Some(memory), Some(cpus)) => Ok(Some((memory, cpus))),
                _ => Ok(None),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn guest_command(&self, args: &[&str]) -> Option<Cmd> {
        Some(self.exec_cmd(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn wide_listing_is_decoded() {
        let listing = decode_wsl_output(&utf16("Ubuntu\r\nrancher-desktop\r\nrancher-desktop-data\r\n"));
        assert!(lists_distro(&listing, DISTRO));
        assert!(lists_distro(&listing, DATA_DISTRO));
        assert!(!lists_distro(&listing, "rancher"));

        let narrow = decode_wsl_output(b"Ubuntu\n");
        assert!(lists_distro(&narrow, "Ubuntu"));
        assert!(!lists_distro(&narrow, DISTRO));
    }

    #[test]
    fn windows_paths_map_under_mnt() {
        assert_eq!(
            wsl_path(Path::new(r"C:\Users\me\AppData\Local\rancher-desktop")),
            "/mnt/c/Users/me/AppData/Local/rancher-desktop"
        );
        assert_eq!(wsl_path(Path::new("/already/posix")), "/already/posix");
    }

    #[test]
    fn wslconfig_resources() {
        let contents = "[user]\nmemory=1GB\n\n[wsl2]\nmemory = 6GB\nprocessors=4\nswap=0\n";
        assert_eq!(parse_wslconfig(contents), (Some(6.0), Some(4)));
        assert_eq!(parse_wslconfig("[wsl2]\nmemory=512MB\n"), (Some(0.5), None));
        assert_eq!(parse_wslconfig(""), (None, None));
    }
}
