use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use k3s_dist::K3sDist;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rd_engine::backend::{Backend, BackendHandle, BackendState};
use rd_engine::config::load_config;
use rd_engine::context::{AppContext, BlockingChoice, Prompter};
use rd_engine::events::BackendEvent;
use rd_engine::paths::Paths;
use rd_engine::restart::{default_overrides, overall_severity, requires_restart_reasons};
use rd_engine::settings::{BackendSettings, JsonSettingsStore};
use rd_engine::sudo::{ConsentResponse, Explanations};

#[derive(Parser, Debug)]
#[command(name = "rd-engine", version, about = "Run the desktop Kubernetes VM backend")]
struct Cli {
    /// Answer every question with its accepting choice.
    #[arg(long, global = true)]
    yes: bool,

    /// Never prompt; privileged operations are skipped.
    #[arg(long, global = true, env = "RD_NO_MODAL_DIALOGS")]
    no_modal_dialogs: bool,

    /// Engine configuration file (default `<config>/engine.yaml`).
    #[arg(long, global = true, env = "RD_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the VM with the stored settings.
    Start {
        /// Run only the container engine.
        #[arg(long)]
        no_kubernetes: bool,
        /// k3s version to run, e.g. `1.29.1`.
        #[arg(long)]
        kubernetes_version: Option<String>,
        /// Stay attached, keeping the log and service watchers alive until
        /// interrupted, then stop.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop Kubernetes, the container engine and the VM.
    Stop,
    /// Stop and start again with the stored settings.
    Restart,
    /// Wipe Kubernetes state, keeping images, and start again.
    Reset,
    /// Delete the VM.
    Delete {
        /// Skip the graceful shutdown.
        #[arg(long)]
        force: bool,
    },
    /// Delete the VM and every application directory.
    FactoryReset {
        /// Keep downloaded k3s images.
        #[arg(long)]
        keep_system_images: bool,
    },
    /// Show the VM state.
    Status,
    /// List known k3s versions.
    Versions {
        /// Refresh the catalog from the network first.
        #[arg(long)]
        refresh: bool,
    },
    /// Report which changes in a JSON settings patch need a restart.
    RestartReasons {
        /// e.g. `{"kubernetes":{"version":"1.28.5"}}`
        patch: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let paths = Paths::from_env()?;
    let _log_guard = init_logging(&paths.logs);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths.config.join("engine.yaml"));
    let config = load_config(&config_path)?;
    let dist = K3sDist::new(config.dist_config(&paths))?;
    let store = Arc::new(JsonSettingsStore::new(paths.settings_file()));

    let bar = progress_bar();
    let prompter = Arc::new(TerminalPrompter {
        assume_yes: cli.yes,
        bar: bar.clone(),
    });
    let ctx = AppContext::builder(paths.clone())
        .config(config)
        .settings(store.clone())
        .prompter(prompter)
        .no_modal_dialogs(cli.no_modal_dialogs)
        .build();
    let backend = Backend::builder(ctx).spawn()?;
    let renderer = tokio::spawn(render_events(backend.clone(), bar.clone()));

    let started = Instant::now();
    let outcome = run(&cli.command, &backend, &store, &dist).await;
    renderer.abort();
    bar.finish_and_clear();

    match outcome {
        Ok(()) => {
            info!(elapsed = %humantime::format_duration(round(started.elapsed())), "done");
            Ok(())
        }
        Err(e) => {
            let details = backend.failure_details(&e).await;
            eprintln!("error: {e}");
            if let Some(command) = &details.last_command {
                eprintln!("  last command: {command}");
            }
            eprintln!("  during: {}", details.last_command_comment);
            for line in &details.last_log_lines {
                eprintln!("  | {line}");
            }
            std::process::exit(1);
        }
    }
}

async fn run(
    command: &Command,
    backend: &BackendHandle,
    store: &JsonSettingsStore,
    dist: &K3sDist,
) -> rd_engine::Result<()> {
    match command {
        Command::Start {
            no_kubernetes,
            kubernetes_version,
            foreground,
        } => {
            let mut settings = store.load().await?;
            if *no_kubernetes {
                settings.kubernetes.enabled = false;
            }
            if let Some(version) = kubernetes_version {
                settings.kubernetes.version = version.trim_start_matches('v').to_string();
            }
            backend.start(settings).await?;
            report_start(backend);
            if *foreground && backend.state() != BackendState::Error {
                println!("running; press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                backend.stop().await?;
            }
        }
        Command::Stop => backend.stop().await?,
        Command::Restart => {
            backend.restart(store.load().await?).await?;
            report_start(backend);
        }
        Command::Reset => {
            backend.reset(store.load().await?).await?;
            report_start(backend);
        }
        Command::Delete { force } => backend.del(*force).await?,
        Command::FactoryReset { keep_system_images } => {
            backend.factory_reset(*keep_system_images).await?
        }
        Command::Status => print_status(backend, store).await?,
        Command::Versions { refresh } => print_versions(backend, store, dist, *refresh).await?,
        Command::RestartReasons { patch } => {
            let desired: Value = serde_json::from_str(patch)?;
            print_restart_reasons(backend, store, &desired).await?;
        }
    }
    Ok(())
}

fn report_start(backend: &BackendHandle) {
    println!("state: {}", backend.state());
    if let Some(failure) = backend.last_failure() {
        eprintln!("{}: {}", failure.title, failure.message);
        eprintln!("  during: {}", failure.details.last_command_comment);
    }
}

async fn print_status(backend: &BackendHandle, store: &JsonSettingsStore) -> rd_engine::Result<()> {
    let settings = store.load().await?;
    let status = backend.vm().status().await?;
    let resources = backend.vm().current_resources().await?;
    let report = json!({
        "vm": backend.vm().name(),
        "status": status,
        "resources": resources.map(|(memory, cpus)| json!({"memoryInGB": memory, "numberCPUs": cpus})),
        "settings": settings,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn print_versions(
    backend: &BackendHandle,
    store: &JsonSettingsStore,
    dist: &K3sDist,
    refresh: bool,
) -> rd_engine::Result<()> {
    let entries = if refresh {
        dist.update_catalog().await?
    } else {
        dist.available_versions(true).await?
    };
    let cached = dist.cached_versions().await?;
    let wanted = store.load().await?.kubernetes.version;
    for entry in entries {
        let marker = if entry.version.short() == wanted { "*" } else { " " };
        let local = if cached.contains(&entry.version) { " (cached)" } else { "" };
        let channels = if entry.channels.is_empty() {
            String::new()
        } else {
            format!(" [{}]", entry.channels.join(", "))
        };
        println!("{marker} {}{channels}{local}", entry.version.raw());
    }
    if !backend.vm().is_registered().await? {
        info!("no VM yet; versions apply on first start");
    }
    Ok(())
}

async fn print_restart_reasons(
    backend: &BackendHandle,
    store: &JsonSettingsStore,
    desired: &Value,
) -> rd_engine::Result<()> {
    // A fresh process has no running snapshot; the stored settings are what
    // the VM was last started with.
    let current: BackendSettings = store.load().await?;
    let mut extra = std::collections::BTreeMap::new();
    if let Some((memory, cpus)) = backend.vm().current_resources().await? {
        extra.insert("virtualMachine.memoryInGB".to_string(), json!(memory));
        extra.insert("virtualMachine.numberCPUs".to_string(), json!(cpus));
    }
    let reasons = requires_restart_reasons(&current.to_value(), desired, &default_overrides(), &extra);
    let report = json!({
        "severity": overall_severity(&reasons),
        "reasons": reasons,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_logging(logs: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = std::fs::create_dir_all(logs) {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(io::stderr))
            .init();
        warn!(dir = %logs.display(), error = %e, "log directory unavailable; logging to stderr only");
        return None;
    }
    let appender = tracing_appender::rolling::never(logs, "rd-engine.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Some(guard)
}

fn progress_bar() -> ProgressBar {
    if !io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {pos}/{len}") {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Feed backend events into the progress bar until aborted.
async fn render_events(backend: BackendHandle, bar: ProgressBar) {
    let mut events = backend.subscribe();
    loop {
        match events.recv().await {
            Ok(BackendEvent::Progress { progress }) => {
                let description = progress.description.clone().unwrap_or_default();
                let since = progress
                    .transition_time
                    .and_then(|t| SystemTime::now().duration_since(t).ok())
                    .map(|d| format!(" ({})", humantime::format_duration(round(d))))
                    .unwrap_or_default();
                bar.set_message(format!("{description}{since}"));
                if !progress.is_indeterminate() {
                    bar.set_length(progress.max.max(0) as u64);
                    bar.set_position(progress.current.max(0) as u64);
                }
            }
            Ok(BackendEvent::StateChanged { state }) => bar.println(format!("state: {state}")),
            Ok(BackendEvent::ShowNotification { title, body }) => {
                bar.println(format!("{title}: {body}"))
            }
            Ok(BackendEvent::CurrentPortChanged { port }) => {
                bar.println(format!("Kubernetes API on port {port}"))
            }
            Ok(BackendEvent::ServiceChanged { services }) => {
                bar.println(format!("{} service ports", services.len()))
            }
            Ok(BackendEvent::ServiceError { message }) => {
                bar.println(format!("service watch: {message}"))
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "progress display fell behind")
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn round(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

/// Asks questions on the terminal.  Without a terminal every question gets
/// its safe answer.
struct TerminalPrompter {
    assume_yes: bool,
    bar: ProgressBar,
}

impl TerminalPrompter {
    async fn ask(&self, prompt: String) -> Option<String> {
        if !io::stdin().is_terminal() {
            return None;
        }
        self.bar.suspend(|| {
            eprint!("{prompt}");
            let _ = io::stderr().flush();
        });
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().read_line(&mut line).ok().map(|_| line.trim().to_string())
        })
        .await
        .ok()
        .flatten()
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn elevation_consent(&self, explanations: &Explanations) -> ConsentResponse {
        if self.assume_yes {
            return ConsentResponse {
                accepted: true,
                never_ask_again: false,
            };
        }
        let mut prompt = String::from("Administrator access is needed to:\n");
        for (reason, paths) in explanations {
            prompt.push_str(&format!("  - {reason}\n"));
            for path in paths {
                prompt.push_str(&format!("      {path}\n"));
            }
        }
        prompt.push_str("Allow? [y]es / [n]o / [never] ask again: ");
        let answer = self.ask(prompt).await.unwrap_or_default().to_ascii_lowercase();
        ConsentResponse {
            accepted: matches!(answer.as_str(), "y" | "yes"),
            never_ask_again: answer == "never",
        }
    }

    async fn blocking_choice(&self, choice: &BlockingChoice) -> usize {
        if self.assume_yes {
            return 0;
        }
        let mut prompt = format!("{}\n{}\n", choice.title, choice.message);
        if let Some(detail) = &choice.detail {
            prompt.push_str(&format!("{detail}\n"));
        }
        for (i, button) in choice.buttons.iter().enumerate() {
            prompt.push_str(&format!("  {}) {button}\n", i + 1));
        }
        prompt.push_str(&format!("Choice [{}]: ", choice.default_id + 1));
        match self.ask(prompt).await {
            None => choice.cancel_id,
            Some(answer) if answer.is_empty() => choice.default_id,
            Some(answer) => answer
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .filter(|n| *n < choice.buttons.len())
                .unwrap_or(choice.cancel_id),
        }
    }
}
