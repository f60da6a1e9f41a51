//! Backend state machine.
//!
//! [`BackendHandle`] is the only way to drive the VM.  Lifecycle calls are
//! checked against the [`Action`] guard when they are submitted and then run
//! one at a time by a single orchestrator task, so no two transitions ever
//! overlap.
//!
//! # Example
//!
//! ```no_run
//! use rd_engine::backend::Backend;
//! use rd_engine::context::AppContext;
//! use rd_engine::paths::Paths;
//! use rd_engine::settings::BackendSettings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = AppContext::builder(Paths::from_env()?).build();
//!     let backend = Backend::builder(ctx).spawn()?;
//!
//!     backend.start(BackendSettings::default()).await?;
//!     println!("state: {}", backend.state());
//!     backend.stop().await?;
//!     Ok(())
//! }
//! ```

mod orchestrator;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::context::AppContext;
use crate::events::BackendEvent;
use crate::kube::KubeManager;
use crate::progress::BackendProgress;
use crate::restart::{requires_restart_reasons, FieldOverrides, RestartReasons};
use crate::settings::BackendSettings;
use crate::vm::{create_supervisor, VmSupervisor};
use crate::{Error, Result};

use self::orchestrator::Orchestrator;

const LOG_TAIL_LINES: usize = 10;

/// Externally visible state of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
    /// The container engine runs without Kubernetes.
    Disabled,
}

impl BackendState {
    /// States that tear the Kubernetes layer down.
    pub fn is_teardown(&self) -> bool {
        matches!(
            self,
            BackendState::Stopping | BackendState::Stopped | BackendState::Error | BackendState::Disabled
        )
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendState::Stopped => "STOPPED",
            BackendState::Starting => "STARTING",
            BackendState::Started => "STARTED",
            BackendState::Stopping => "STOPPING",
            BackendState::Error => "ERROR",
            BackendState::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

/// Transition in flight.  Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    None,
    Starting,
    Stopping,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => f.write_str("idle"),
            Action::Starting => f.write_str("starting"),
            Action::Stopping => f.write_str("stopping"),
        }
    }
}

/// What a fatal-error dialog shows next to the error itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    pub last_command: Option<String>,
    pub last_command_comment: String,
    pub last_log_lines: Vec<String>,
}

/// The last error `start` swallowed, kept for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFailure {
    pub title: String,
    pub message: String,
    pub details: FailureDetails,
}

/// State shared between the handle and the orchestrator task.
pub(crate) struct Shared {
    ctx: AppContext,
    vm: Arc<dyn VmSupervisor>,
    state: watch::Sender<BackendState>,
    action: Mutex<Action>,
    abort: Arc<AtomicBool>,
    pending_restart: Mutex<Option<BackendSettings>>,
    /// Snapshot the running machine was last started with.
    current: Mutex<Option<BackendSettings>>,
    last_failure: Mutex<Option<StartFailure>>,
    overrides: FieldOverrides,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn action(&self) -> Action {
        *lock(&self.action)
    }

    fn set_action(&self, action: Action) {
        *lock(&self.action) = action;
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

enum Command {
    Start(BackendSettings, oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    Restart(BackendSettings, oneshot::Sender<Result<()>>),
    Reset(BackendSettings, oneshot::Sender<Result<()>>),
    Delete { force: bool, reply: oneshot::Sender<Result<()>> },
    FactoryReset { keep_system_images: bool, reply: oneshot::Sender<Result<()>> },
}

/// Entry point for building a backend.
pub struct Backend;

impl Backend {
    pub fn builder(ctx: AppContext) -> BackendBuilder {
        BackendBuilder { ctx, vm: None }
    }
}

/// Builder for [`BackendHandle`].
pub struct BackendBuilder {
    ctx: AppContext,
    vm: Option<Arc<dyn VmSupervisor>>,
}

impl BackendBuilder {
    /// Use this supervisor instead of the platform default.
    pub fn supervisor(mut self, vm: Arc<dyn VmSupervisor>) -> Self {
        self.vm = Some(vm);
        self
    }

    /// Start the orchestrator task.  Must be called inside a tokio runtime.
    pub fn spawn(self) -> Result<BackendHandle> {
        let vm = self
            .vm
            .unwrap_or_else(|| create_supervisor(self.ctx.supervisor_context()));
        let (state, state_rx) = watch::channel(BackendState::Stopped);
        let abort = Arc::new(AtomicBool::new(false));
        let kube = KubeManager::new(self.ctx.clone(), vm.clone(), state_rx, abort.clone())?;
        let shared = Arc::new(Shared {
            overrides: kube.restart_overrides(),
            ctx: self.ctx,
            vm,
            state,
            action: Mutex::new(Action::None),
            abort,
            pending_restart: Mutex::new(None),
            current: Mutex::new(None),
            last_failure: Mutex::new(None),
        });
        let orchestrator = Orchestrator::new(shared.clone(), kube);

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(orchestrator.run(rx));
        info!(vm = shared.vm.name(), "backend ready");
        Ok(BackendHandle { tx, shared })
    }
}

/// Cloneable handle to the backend.
#[derive(Clone)]
pub struct BackendHandle {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl BackendHandle {
    pub fn state(&self) -> BackendState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BackendState> {
        self.shared.state.subscribe()
    }

    pub fn action(&self) -> Action {
        self.shared.action()
    }

    pub fn progress(&self) -> BackendProgress {
        self.shared.ctx.progress.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.shared.ctx.events.subscribe()
    }

    pub fn vm(&self) -> &Arc<dyn VmSupervisor> {
        &self.shared.vm
    }

    /// The last non-fatal error that ended a `start`, if any.
    pub fn last_failure(&self) -> Option<StartFailure> {
        lock(&self.shared.last_failure).clone()
    }

    /// Claim the action slot, failing if something else holds it.
    fn claim(&self, action: Action) -> Result<()> {
        let mut current = lock(&self.shared.action);
        if *current != Action::None {
            return Err(Error::Busy(*current));
        }
        *current = action;
        Ok(())
    }

    async fn submit<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).await.is_err() {
            self.shared.set_action(Action::None);
            return Err(backend_gone());
        }
        rx.await.map_err(|_| backend_gone())?
    }

    /// Bring the VM and, if enabled, Kubernetes up.  Rejected while another
    /// transition is running.
    pub async fn start(&self, settings: BackendSettings) -> Result<()> {
        self.claim(Action::Starting)?;
        self.shared.abort.store(false, Ordering::SeqCst);
        self.submit(|reply| Command::Start(settings, reply)).await
    }

    /// Stop everything.  Ignored while another transition is running: a
    /// start in progress is left to finish with the VM up.  Use
    /// [`abort`](Self::abort) to cancel a start.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut action = lock(&self.shared.action);
            if *action != Action::None {
                debug!(%action, "stop requested while busy; ignoring");
                return Ok(());
            }
            *action = Action::Stopping;
        }
        self.submit(Command::Stop).await
    }

    /// Stop then start with new settings.  While a transition is running
    /// the restart is queued and runs once the backend is idle; a later
    /// call replaces an earlier queued one.
    pub async fn restart(&self, settings: BackendSettings) -> Result<()> {
        {
            let mut action = lock(&self.shared.action);
            if *action != Action::None {
                info!(%action, "backend busy; restart deferred");
                *lock(&self.shared.pending_restart) = Some(settings);
                return Ok(());
            }
            *action = Action::Starting;
        }
        self.shared.abort.store(false, Ordering::SeqCst);
        self.submit(|reply| Command::Restart(settings, reply)).await
    }

    /// Wipe Kubernetes state, keeping images and volumes, then start.
    pub async fn reset(&self, settings: BackendSettings) -> Result<()> {
        self.claim(Action::Starting)?;
        self.shared.abort.store(false, Ordering::SeqCst);
        self.submit(|reply| Command::Reset(settings, reply)).await
    }

    /// Destroy the VM.  `force` skips the graceful shutdown.
    pub async fn del(&self, force: bool) -> Result<()> {
        self.claim(Action::Stopping)?;
        self.submit(|reply| Command::Delete { force, reply }).await
    }

    /// Delete the VM and every application directory.  Does not restart.
    pub async fn factory_reset(&self, keep_system_images: bool) -> Result<()> {
        self.claim(Action::Stopping)?;
        self.submit(|reply| Command::FactoryReset {
            keep_system_images,
            reply,
        })
        .await
    }

    /// Ask an in-flight `start` to give up at its next checkpoint; the VM
    /// is then stopped.
    pub fn abort(&self) {
        if self.shared.action() == Action::Starting {
            self.shared.abort.store(true, Ordering::SeqCst);
        }
    }

    /// Which settings in `desired` differ from the running configuration,
    /// and how disruptive applying each would be.  Empty before the first
    /// `start`.
    pub async fn requires_restart_reasons(&self, desired: &Value) -> Result<RestartReasons> {
        let Some(current) = lock(&self.shared.current).clone() else {
            return Ok(RestartReasons::new());
        };
        let mut extra = BTreeMap::new();
        if let Some((memory, cpus)) = self.shared.vm.current_resources().await? {
            extra.insert("virtualMachine.memoryInGB".to_string(), json!(memory));
            extra.insert("virtualMachine.numberCPUs".to_string(), json!(cpus));
        }
        Ok(requires_restart_reasons(
            &current.to_value(),
            desired,
            &self.shared.overrides,
            &extra,
        ))
    }

    /// Context for an error dialog about `err`.
    pub async fn failure_details(&self, err: &Error) -> FailureDetails {
        failure_details(&self.shared.ctx.paths.engine_log(), err).await
    }
}

fn backend_gone() -> Error {
    Error::fatal("Backend Error", "the backend task has exited")
}

pub(crate) async fn failure_details(engine_log: &Path, err: &Error) -> FailureDetails {
    let last_log_lines = match tokio::fs::read_to_string(engine_log).await {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(LOG_TAIL_LINES);
            lines[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(e) => {
            debug!(path = %engine_log.display(), error = %e, "engine log unavailable");
            Vec::new()
        }
    };
    FailureDetails {
        last_command: err.last_command().map(str::to_string),
        last_command_comment: err.step_description().unwrap_or("Unknown").to_string(),
        last_log_lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_states() {
        assert!(BackendState::Stopped.is_teardown());
        assert!(BackendState::Disabled.is_teardown());
        assert!(!BackendState::Starting.is_teardown());
        assert!(!BackendState::Started.is_teardown());
        assert_eq!(serde_json::to_value(BackendState::Started).unwrap(), json!("STARTED"));
        assert_eq!(BackendState::Error.to_string(), "ERROR");
    }

    #[tokio::test]
    async fn failure_details_tail_the_engine_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("rd-engine.log");
        let contents: String = (1..=15).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&log, contents).unwrap();

        let err = Error::Step {
            description: "Starting k3s".to_string(),
            source: Box::new(Error::Command {
                command: "rc-service k3s start".to_string(),
                code: Some(1),
                stderr: String::new(),
            }),
        };
        let details = failure_details(&log, &err).await;
        assert_eq!(details.last_command.as_deref(), Some("rc-service k3s start"));
        assert_eq!(details.last_command_comment, "Starting k3s");
        assert_eq!(details.last_log_lines.len(), 10);
        assert_eq!(details.last_log_lines[0], "line 6");

        let missing = failure_details(&tmp.path().join("none.log"), &Error::NoVersionAvailable).await;
        assert_eq!(missing.last_command, None);
        assert_eq!(missing.last_command_comment, "Unknown");
        assert!(missing.last_log_lines.is_empty());
    }
}
