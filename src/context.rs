//! Application context.
//!
//! Everything the orchestrator needs from the outside world is held here and
//! handed to components explicitly: host directories, engine configuration,
//! the event bus, the user-interaction callbacks, and the settings writer.
//!
//! # Example
//!
//! ```no_run
//! use rd_engine::context::AppContext;
//! use rd_engine::paths::Paths;
//!
//! # fn main() -> rd_engine::Result<()> {
//! let ctx = AppContext::builder(Paths::from_env()?)
//!     .no_modal_dialogs(true)
//!     .build();
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::paths::Paths;
use crate::progress::ProgressTracker;
use crate::settings::{JsonSettingsStore, SettingsWriter};
use crate::sudo::{ConsentResponse, Explanations, HostElevator, SudoElevator};
use crate::vm::SupervisorContext;

// ---------------------------------------------------------------------------
// User interaction
// ---------------------------------------------------------------------------

/// A modal question with a fixed set of answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingChoice {
    pub title: String,
    pub message: String,
    pub detail: Option<String>,
    pub buttons: Vec<String>,
    /// Button selected by default.
    pub default_id: usize,
    /// Index reported when the dialog is dismissed.
    pub cancel_id: usize,
}

/// UI collaborator for the two decisions only a user can make.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask whether the grouped privileged changes may be made.
    async fn elevation_consent(&self, explanations: &Explanations) -> ConsentResponse;

    /// Show `choice` and return the index of the button pressed.
    async fn blocking_choice(&self, choice: &BlockingChoice) -> usize;
}

/// Prompter with canned answers that records every question.
#[derive(Debug, Default)]
pub struct FixedPrompter {
    consent: ConsentResponse,
    choice: Option<usize>,
    consent_requests: Mutex<Vec<Explanations>>,
    choices: Mutex<Vec<BlockingChoice>>,
}

impl FixedPrompter {
    pub fn new(consent: ConsentResponse) -> Self {
        Self {
            consent,
            ..Default::default()
        }
    }

    /// Accepts elevation and picks the first button of every choice.
    pub fn accepting() -> Self {
        Self::new(ConsentResponse {
            accepted: true,
            never_ask_again: false,
        })
        .with_choice(0)
    }

    /// Declines elevation and cancels every choice.
    pub fn declining() -> Self {
        Self::new(ConsentResponse::default())
    }

    /// Answer blocking choices with `index` instead of their cancel button.
    pub fn with_choice(mut self, index: usize) -> Self {
        self.choice = Some(index);
        self
    }

    pub fn consent_requests(&self) -> Vec<Explanations> {
        self.consent_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn choices(&self) -> Vec<BlockingChoice> {
        self.choices.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Prompter for FixedPrompter {
    async fn elevation_consent(&self, explanations: &Explanations) -> ConsentResponse {
        if let Ok(mut requests) = self.consent_requests.lock() {
            requests.push(explanations.clone());
        }
        self.consent
    }

    async fn blocking_choice(&self, choice: &BlockingChoice) -> usize {
        if let Ok(mut choices) = self.choices.lock() {
            choices.push(choice.clone());
        }
        self.choice.unwrap_or(choice.cancel_id)
    }
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

/// Decides whether upstream release servers are reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Online when `host:port` resolves within a few seconds.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    target: String,
}

impl DnsProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for DnsProbe {
    async fn is_online(&self) -> bool {
        let lookup = tokio::net::lookup_host(self.target.as_str());
        match tokio::time::timeout(Duration::from_secs(5), lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "connectivity probe failed");
                false
            }
            Err(_) => {
                debug!(target = %self.target, "connectivity probe timed out");
                false
            }
        }
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

#[async_trait]
impl ConnectivityProbe for FixedProbe {
    async fn is_online(&self) -> bool {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Collaborators shared by every component of one backend.
#[derive(Clone)]
pub struct AppContext {
    pub paths: Paths,
    pub config: EngineConfig,
    pub events: EventBus,
    pub progress: ProgressTracker,
    pub prompter: Arc<dyn Prompter>,
    pub settings: Arc<dyn SettingsWriter>,
    pub elevator: Arc<dyn HostElevator>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    /// Never show modal dialogs; every question takes its safe answer.
    pub no_modal_dialogs: bool,
}

impl AppContext {
    pub fn builder(paths: Paths) -> AppContextBuilder {
        AppContextBuilder::new(paths)
    }

    /// The handles a VM supervisor is built with.
    pub fn supervisor_context(&self) -> SupervisorContext {
        SupervisorContext {
            paths: self.paths.clone(),
            config: self.config.clone(),
            progress: self.progress.clone(),
            events: self.events.clone(),
        }
    }
}

/// Builder for [`AppContext`]; unset collaborators get host defaults.
pub struct AppContextBuilder {
    paths: Paths,
    config: EngineConfig,
    events: EventBus,
    prompter: Option<Arc<dyn Prompter>>,
    settings: Option<Arc<dyn SettingsWriter>>,
    elevator: Option<Arc<dyn HostElevator>>,
    connectivity: Option<Arc<dyn ConnectivityProbe>>,
    no_modal_dialogs: bool,
}

impl AppContextBuilder {
    fn new(paths: Paths) -> Self {
        Self {
            paths,
            config: EngineConfig::default(),
            events: EventBus::new(),
            prompter: None,
            settings: None,
            elevator: None,
            connectivity: None,
            no_modal_dialogs: false,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsWriter>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn elevator(mut self, elevator: Arc<dyn HostElevator>) -> Self {
        self.elevator = Some(elevator);
        self
    }

    pub fn connectivity(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.connectivity = Some(probe);
        self
    }

    pub fn no_modal_dialogs(mut self, enabled: bool) -> Self {
        self.no_modal_dialogs = enabled;
        self
    }

    pub fn build(self) -> AppContext {
        let settings = self.settings.unwrap_or_else(|| {
            Arc::new(JsonSettingsStore::new(self.paths.settings_file())) as Arc<dyn SettingsWriter>
        });
        let connectivity = self.connectivity.unwrap_or_else(|| {
            Arc::new(DnsProbe::new(self.config.connectivity_host.clone()))
                as Arc<dyn ConnectivityProbe>
        });
        AppContext {
            progress: ProgressTracker::new(self.events.clone()),
            prompter: self
                .prompter
                .unwrap_or_else(|| Arc::new(FixedPrompter::declining())),
            elevator: self.elevator.unwrap_or_else(|| Arc::new(SudoElevator)),
            settings,
            connectivity,
            paths: self.paths,
            config: self.config,
            events: self.events,
            no_modal_dialogs: self.no_modal_dialogs,
        }
    }
}
