//! VM supervision.
//!
//! This module defines the [`VmSupervisor`] trait every VM flavour
//! implements.  The orchestrator drives the machine only through it:
//! configuration, privileged host requirements, boot and shutdown, and
//! running commands as root inside the guest.
//!
//! Supervisors:
//! - **macOS / Linux**: [`LimaSupervisor`](lima::LimaSupervisor), `limactl`
//!   managed QEMU or VZ machine
//! - **Windows**: [`WslSupervisor`](wsl::WslSupervisor), WSL2 distribution
//! - **Tests**: [`MockSupervisor`](mock::MockSupervisor), in-memory guest

pub mod config;
pub mod lima;
pub mod mock;
pub mod network;
pub mod wsl;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::paths::Paths;
use crate::process::Cmd;
use crate::progress::ProgressTracker;
use crate::settings::BackendSettings;
use crate::sudo::SudoCommand;
use crate::Result;

use self::config::{
    check_base_image, merge_config, BaseImageUpdate, ConfigInputs, LimaConfiguration,
    MACHINE_NAME,
};
use self::network::ListeningInterface;

/// Machine state as reported by the VM manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmStatus {
    NotRegistered,
    Stopped,
    Running,
    Broken,
}

/// Shared handles every supervisor is built with.
#[derive(Clone)]
pub struct SupervisorContext {
    pub paths: Paths,
    pub config: EngineConfig,
    pub progress: ProgressTracker,
    pub events: EventBus,
}

/// Trait that all VM supervisors must implement.
///
/// Guest commands run as root.  Implementations must not cache settings
/// between calls; every operation that depends on them takes them as an
/// argument.
#[async_trait]
pub trait VmSupervisor: Send + Sync {
    /// Short name for logs (`lima`, `wsl`, `mock`).
    fn name(&self) -> &'static str;

    async fn status(&self) -> Result<VmStatus>;

    async fn is_running(&self) -> Result<bool> {
        Ok(self.status().await? == VmStatus::Running)
    }

    async fn is_registered(&self) -> Result<bool> {
        Ok(self.status().await? != VmStatus::NotRegistered)
    }

    /// Fail fatally when the application does not match the host CPU.
    fn ensure_architecture_match(&self) -> Result<()>;

    /// Fail fatally when the host cannot run the VM.
    async fn ensure_virtualization_supported(&self) -> Result<()>;

    /// Merge and persist the VM descriptor.  May stop the VM to replace an
    /// outdated base image.
    async fn update_config(&self, settings: &BackendSettings, allow_privileged: bool)
        -> Result<()>;

    /// Host changes that need root for the full feature set.  Nothing is run.
    async fn privileged_commands(&self, settings: &BackendSettings) -> Result<Vec<SudoCommand>>;

    /// Boot the VM; a no-op when it is already running.
    async fn start_vm(&self) -> Result<()>;

    async fn stop_vm(&self) -> Result<()>;

    async fn delete_vm(&self) -> Result<()>;

    /// Run a command as root in the guest and return its stdout.
    async fn exec(&self, args: &[&str]) -> Result<String>;

    /// Write `contents` to `path` in the guest with the given mode.
    async fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()>;

    /// Where a host path is visible inside the guest.
    fn guest_path(&self, host: &Path) -> String;

    /// The guest's primary IPv4 address.
    async fn guest_ip(&self) -> Result<String>;

    /// Interface k3s should advertise.
    async fn listening_interface(
        &self,
        settings: &BackendSettings,
        allow_privileged: bool,
    ) -> Result<ListeningInterface>;

    /// Whether k3s must be pointed at a bridged interface for flannel.
    fn bridged_networking(&self) -> bool;

    /// Memory (GiB) and CPUs of the machine as configured, if it exists.
    async fn current_resources(&self) -> Result<Option<(f64, u32)>>;

    /// Host command that runs `args` in the guest, for long-running
    /// watchers.  `None` when the guest has no process to attach to.
    fn guest_command(&self, args: &[&str]) -> Option<Cmd>;
}

/// Create the platform-appropriate supervisor.
///
/// On macOS and Linux, returns a [`LimaSupervisor`](lima::LimaSupervisor).
#[cfg(not(windows))]
pub fn create_supervisor(ctx: SupervisorContext) -> Arc<dyn VmSupervisor> {
    Arc::new(lima::LimaSupervisor::new(ctx))
}

/// Create the platform-appropriate supervisor.
///
/// On Windows, returns a [`WslSupervisor`](wsl::WslSupervisor).
#[cfg(windows)]
pub fn create_supervisor(ctx: SupervisorContext) -> Arc<dyn VmSupervisor> {
    Arc::new(wsl::WslSupervisor::new(ctx))
}

/// `lima.yaml` of the existing instance.
pub fn instance_config_path(paths: &Paths) -> PathBuf {
    paths.lima().join(MACHINE_NAME).join("lima.yaml")
}

/// Descriptor handed to `limactl start` for a new instance.
pub fn new_config_path(paths: &Paths) -> PathBuf {
    paths.lima().join("_config").join(format!("{MACHINE_NAME}.yaml"))
}

/// Merge the descriptor and write it where Lima will read it.  For an
/// existing instance the base image is checked first and `upgrade` runs
/// when the bundled image is newer; nothing is written if the check fails.
pub async fn apply_descriptor<F, Fut>(
    ctx: &SupervisorContext,
    settings: &BackendSettings,
    inputs: &ConfigInputs,
    upgrade: F,
) -> Result<LimaConfiguration>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let existing_path = instance_config_path(&ctx.paths);
    let existing = LimaConfiguration::load(&existing_path).await?;
    let merged = merge_config(existing.as_ref(), settings, inputs)?;

    match &existing {
        Some(current) => {
            ctx.progress
                .action("Updating outdated virtual machine", 100, async {
                    if let BaseImageUpdate::Upgrade { from } =
                        check_base_image(current, &ctx.config.image_version)?
                    {
                        info!(from = %from, to = %ctx.config.image_version, "updating base image");
                        upgrade().await?;
                    }
                    Ok(())
                })
                .await?;
            merged.save(&existing_path).await?;
        }
        None => merged.save(&new_config_path(&ctx.paths)).await?,
    }
    Ok(merged)
}
