//! Shared setup for the backend integration tests: a scratch directory
//! tree, a mock VM, canned prompts and a pre-populated k3s cache.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rd_engine::backend::{Backend, BackendHandle, BackendState};
use rd_engine::config::EngineConfig;
use rd_engine::context::{AppContext, FixedPrompter, FixedProbe};
use rd_engine::events::BackendEvent;
use rd_engine::paths::Paths;
use rd_engine::settings::{BackendSettings, JsonSettingsStore};
use rd_engine::sudo::MockElevator;
use rd_engine::vm::mock::{MockOptions, MockSupervisor};
use rd_engine::vm::VmSupervisor;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const K3S_NEW: &str = "v1.29.1+k3s1";
pub const K3S_OLD: &str = "v1.28.5+k3s1";

pub struct Harness {
    pub tmp: TempDir,
    pub paths: Paths,
    pub vm: Arc<MockSupervisor>,
    pub prompter: Arc<FixedPrompter>,
    pub elevator: Arc<MockElevator>,
    pub backend: BackendHandle,
    pub events: broadcast::Receiver<BackendEvent>,
    /// Stands in for the k3s API server.
    api: TcpListener,
}

pub struct HarnessBuilder {
    options: MockOptions,
    prompter: FixedPrompter,
    elevator: MockElevator,
    online: bool,
    no_modal_dialogs: bool,
    cached: Vec<&'static str>,
    download_url: Option<String>,
    catalog_urls: Option<(String, String)>,
}

impl HarnessBuilder {
    pub fn options(mut self, options: MockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn prompter(mut self, prompter: FixedPrompter) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn elevator(mut self, elevator: MockElevator) -> Self {
        self.elevator = elevator;
        self
    }

    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn no_modal_dialogs(mut self) -> Self {
        self.no_modal_dialogs = true;
        self
    }

    /// Versions present in the artifact cache before the backend starts.
    pub fn cached(mut self, versions: &[&'static str]) -> Self {
        self.cached = versions.to_vec();
        self
    }

    /// Point the release catalog and downloads at a mock server.
    pub fn upstream(mut self, channels: String, releases: String, download: String) -> Self {
        self.catalog_urls = Some((channels, releases));
        self.download_url = Some(download);
        self
    }

    pub async fn build(self) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::under(tmp.path());
        for version in &self.cached {
            cache_k3s(&paths.cache, version).await;
        }

        // Nothing listens on port 9; unexpected downloads fail fast.
        let unreachable = "http://127.0.0.1:9".to_string();
        let (channels, releases) = self
            .catalog_urls
            .unwrap_or_else(|| (unreachable.clone(), unreachable.clone()));
        let config = EngineConfig {
            arch: Some(k3s_dist::Arch::X86_64),
            k3s_channels_url: channels,
            k3s_releases_url: releases,
            k3s_download_url: self.download_url.unwrap_or(unreachable),
            ..EngineConfig::default()
        };

        let prompter = Arc::new(self.prompter);
        let elevator = Arc::new(self.elevator);
        let ctx = AppContext::builder(paths.clone())
            .config(config)
            .prompter(prompter.clone())
            .elevator(elevator.clone())
            .settings(Arc::new(JsonSettingsStore::new(paths.settings_file())))
            .connectivity(Arc::new(FixedProbe(self.online)))
            .no_modal_dialogs(self.no_modal_dialogs)
            .build();
        let vm = Arc::new(MockSupervisor::with_options(
            ctx.supervisor_context(),
            self.options,
        ));
        let backend = Backend::builder(ctx)
            .supervisor(vm.clone() as Arc<dyn VmSupervisor>)
            .spawn()
            .unwrap();
        let events = backend.subscribe();

        Harness {
            tmp,
            paths,
            vm,
            prompter,
            elevator,
            backend,
            events,
            api: TcpListener::bind("127.0.0.1:0").unwrap(),
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            options: MockOptions::default(),
            prompter: FixedPrompter::accepting(),
            elevator: MockElevator::new(false),
            online: false,
            no_modal_dialogs: false,
            cached: vec![K3S_NEW, K3S_OLD],
            download_url: None,
            catalog_urls: None,
        }
    }

    /// Settings that run k3s `version` on the stand-in API port.
    pub fn kube_settings(&self, version: &str) -> BackendSettings {
        let mut settings = BackendSettings::default();
        settings.kubernetes.enabled = true;
        settings.kubernetes.version = version.to_string();
        settings.kubernetes.port = self.api.local_addr().unwrap().port();
        settings
    }

    /// Container engine only.
    pub fn engine_settings(&self) -> BackendSettings {
        let mut settings = BackendSettings::default();
        settings.kubernetes.enabled = false;
        settings
    }

    /// Every state change seen so far.
    pub fn drain_states(&mut self) -> Vec<BackendState> {
        let mut states = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let BackendEvent::StateChanged { state } = event {
                states.push(state);
            }
        }
        states
    }

    /// Wait until the backend reports `state`.
    pub async fn wait_for_state(&self, state: BackendState) {
        let mut rx = self.backend.watch_state();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    /// The stored settings document.
    pub fn stored_settings(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.paths.settings_file()).unwrap_or_default();
        serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
    }

    /// k3s version the host recorded as installed.
    pub fn recorded_k3s(&self) -> Option<String> {
        std::fs::read_to_string(self.paths.app_home.join("k3s-version")).ok()
    }

    /// Guest commands issued after the first `skip` entries.
    pub fn commands_since(&self, skip: usize) -> Vec<String> {
        self.vm.commands().into_iter().skip(skip).collect()
    }
}

/// Put a checksum-valid artifact set for `raw` into the cache.
pub async fn cache_k3s(cache: &Path, raw: &str) {
    let dir = cache.join("k3s").join(raw);
    std::fs::create_dir_all(&dir).unwrap();
    let exe = dir.join("k3s");
    let images = dir.join("k3s-airgap-images-amd64.tar.zst");
    std::fs::write(&exe, format!("k3s binary {raw}")).unwrap();
    std::fs::write(&images, format!("airgap images {raw}")).unwrap();

    let exe_sum = k3s_dist::cache::sha256_file(&exe).await.unwrap();
    let images_sum = k3s_dist::cache::sha256_file(&images).await.unwrap();
    std::fs::write(
        dir.join("sha256sum-amd64.txt"),
        format!("{exe_sum}  k3s\n{images_sum}  k3s-airgap-images-amd64.tar.zst\n"),
    )
    .unwrap();
}
