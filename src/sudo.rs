//! Privileged operation broker.
//!
//! Supervisors describe the host changes they need as [`SudoCommand`]s
//! without running anything.  The broker merges them, asks the user once,
//! and runs everything as a single elevated shell invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::context::Prompter;
use crate::process::Cmd;
use crate::progress::ProgressTracker;
use crate::settings::{BackendSettings, SettingsWriter};
use crate::{Error, Result};

/// Why elevated access is needed; shown to the user grouped by reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SudoReason {
    Networking,
    DockerSocket,
}

impl fmt::Display for SudoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SudoReason::Networking => "networking",
            SudoReason::DockerSocket => "docker-socket",
        })
    }
}

/// One unit of privileged work for the current start attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SudoCommand {
    pub reason: SudoReason,
    /// Shell commands; they must not contain single quotes.
    pub commands: Vec<String>,
    /// Host paths touched, for the consent dialog.
    pub paths: Vec<String>,
}

/// The user's answer to the consent dialog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsentResponse {
    pub accepted: bool,
    pub never_ask_again: bool,
}

/// Affected paths grouped by reason.
pub type Explanations = BTreeMap<SudoReason, Vec<String>>;

/// Host mechanism for running a shell script as root.
#[async_trait]
pub trait HostElevator: Send + Sync {
    /// Whether running as root would prompt for a password.
    async fn requires_password(&self) -> bool;

    /// Run through the interactive OS prompt.  Cancelling it yields
    /// [`Error::ElevationDenied`].
    async fn run_elevated(&self, script: &str) -> Result<()>;

    /// Run with cached credentials; no prompt.
    async fn run_passwordless(&self, script: &str) -> Result<()>;
}

/// `sudo` for the cached case, `osascript` / `pkexec` for the prompt.
#[derive(Debug, Default)]
pub struct SudoElevator;

#[async_trait]
impl HostElevator for SudoElevator {
    async fn requires_password(&self) -> bool {
        // --reset-timestamp ignores cached credentials, so this only passes
        // when sudoers grants the user NOPASSWD.
        match Cmd::new("sudo")
            .args(["--non-interactive", "--reset-timestamp", "true"])
            .output()
            .await
        {
            Ok(out) => !out.success(),
            Err(_) => true,
        }
    }

    async fn run_elevated(&self, script: &str) -> Result<()> {
        if cfg!(target_os = "macos") {
            let shell = format!("/bin/sh -xec '{script}'");
            let apple = format!(
                "do shell script \"{}\" with administrator privileges",
                shell.replace('\\', "\\\\").replace('"', "\\\"")
            );
            let out = Cmd::new("/usr/bin/osascript").args(["-e", &apple]).output().await?;
            if out.success() {
                return Ok(());
            }
            // -128 is errAEUserCanceled
            if out.stderr_str().contains("(-128)") {
                return Err(Error::ElevationDenied);
            }
            return Err(Error::Command {
                command: "osascript".to_string(),
                code: Some(out.exit_code),
                stderr: out.stderr_str().trim().to_string(),
            });
        }

        let cmd = Cmd::new("pkexec").args(["/bin/sh", "-xec", script]);
        let out = cmd.output().await?;
        match out.exit_code {
            0 => Ok(()),
            // pkexec: 126 means the dialog was dismissed
            126 => Err(Error::ElevationDenied),
            code => Err(Error::Command {
                command: cmd.display(),
                code: Some(code),
                stderr: out.stderr_str().trim().to_string(),
            }),
        }
    }

    async fn run_passwordless(&self, script: &str) -> Result<()> {
        Cmd::new("sudo")
            .args(["--non-interactive", "/bin/sh", "-xec", script])
            .run()
            .await?;
        Ok(())
    }
}

/// Elevator that records scripts instead of running them.
#[derive(Debug, Default)]
pub struct MockElevator {
    pub password_required: bool,
    pub deny: bool,
    scripts: Mutex<Vec<String>>,
}

impl MockElevator {
    pub fn new(password_required: bool) -> Self {
        Self {
            password_required,
            ..Default::default()
        }
    }

    /// Make the OS prompt report a cancellation.
    pub fn denying(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, script: &str) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push(script.to_string());
        }
    }
}

#[async_trait]
impl HostElevator for MockElevator {
    async fn requires_password(&self) -> bool {
        self.password_required
    }

    async fn run_elevated(&self, script: &str) -> Result<()> {
        if self.deny {
            return Err(Error::ElevationDenied);
        }
        self.record(script);
        Ok(())
    }

    async fn run_passwordless(&self, script: &str) -> Result<()> {
        self.record(script);
        Ok(())
    }
}

/// Merge commands into one script and their paths into explanations.
pub fn merge_commands(commands: &[SudoCommand]) -> Result<(String, Explanations)> {
    let mut explanations = Explanations::new();
    let mut lines = Vec::new();
    for command in commands {
        explanations
            .entry(command.reason)
            .or_default()
            .extend(command.paths.iter().cloned());
        lines.extend(command.commands.iter().cloned());
    }
    let script = lines.join("; ");
    if script.contains('\'') {
        return Err(Error::Privilege(format!(
            "privileged command contains a single quote: {script}"
        )));
    }
    Ok((script, explanations))
}

/// Asks once per start attempt and runs the merged privileged commands.
pub struct PrivilegeBroker {
    prompter: Arc<dyn Prompter>,
    elevator: Arc<dyn HostElevator>,
    settings: Arc<dyn SettingsWriter>,
    progress: ProgressTracker,
    no_modal_dialogs: bool,
}

impl PrivilegeBroker {
    pub fn new(
        prompter: Arc<dyn Prompter>,
        elevator: Arc<dyn HostElevator>,
        settings: Arc<dyn SettingsWriter>,
        progress: ProgressTracker,
        no_modal_dialogs: bool,
    ) -> Self {
        Self {
            prompter,
            elevator,
            settings,
            progress,
            no_modal_dialogs,
        }
    }

    /// Run `commands` as root if the user allows it.  Returns whether
    /// privileged operations may be used for the rest of this attempt;
    /// declining is not an error.
    pub async fn install(&self, commands: &[SudoCommand], cfg: &BackendSettings) -> Result<bool> {
        if commands.is_empty() {
            debug!("no privileged commands needed");
            return Ok(true);
        }
        let (script, explanations) = merge_commands(commands)?;

        let requires_password = self.elevator.requires_password().await;
        if requires_password {
            let allowed = self
                .progress
                .action(
                    "Expecting user permission to continue",
                    10,
                    self.ask(&explanations, cfg),
                )
                .await?;
            if !allowed {
                info!("privileged operations declined; continuing without them");
                return Ok(false);
            }
        }

        let result = if requires_password {
            self.elevator.run_elevated(&script).await
        } else {
            self.elevator.run_passwordless(&script).await
        };
        match result {
            Ok(()) => {
                info!(reasons = ?explanations.keys().collect::<Vec<_>>(), "privileged commands done");
                Ok(true)
            }
            Err(Error::ElevationDenied) => {
                warn!("elevation prompt dismissed; continuing without privileged operations");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn ask(&self, explanations: &Explanations, cfg: &BackendSettings) -> Result<bool> {
        if self.no_modal_dialogs || !cfg.application.admin_access {
            return Ok(false);
        }
        let response = self.prompter.elevation_consent(explanations).await;
        if response.never_ask_again {
            self.settings
                .write_settings(json!({"application": {"adminAccess": false}}))
                .await?;
            return Ok(false);
        }
        Ok(response.accepted)
    }
}
