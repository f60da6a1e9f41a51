//! Long-running guest watchers.
//!
//! Two watchers run while Kubernetes is up: one mirrors the guest k3s log
//! into the host log directory, the other polls the cluster's services and
//! reports changes on the event bus.  Each is supervised: when it exits
//! while the backend is `STARTING` or `STARTED` it is restarted after a
//! delay, otherwise it ends quietly.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendState;
use crate::events::{BackendEvent, EventBus};
use crate::process::Cmd;
use crate::vm::VmSupervisor;
use crate::{Error, Result};

const GUEST_K3S_LOG: &str = "/var/log/k3s.log";
const RESTART_DELAY: Duration = Duration::from_secs(5);
const SERVICE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One exposed port of a Kubernetes service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Service entries from `kubectl get services -A -o json`.  Blank output is
/// an empty cluster.
pub fn parse_services(output: &str) -> Result<Vec<ServiceEntry>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: Value = serde_json::from_str(output)?;
    let items = doc.get("items").and_then(Value::as_array);
    let mut entries = Vec::new();
    for item in items.into_iter().flatten() {
        let text = |pointer: &str| {
            item.pointer(pointer)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let (namespace, name) = (text("/metadata/namespace"), text("/metadata/name"));
        let ports = item.pointer("/spec/ports").and_then(Value::as_array);
        match ports {
            Some(ports) if !ports.is_empty() => {
                for port in ports {
                    entries.push(ServiceEntry {
                        namespace: namespace.clone(),
                        name: name.clone(),
                        port_name: port.get("name").and_then(Value::as_str).map(str::to_string),
                        port: port
                            .get("port")
                            .and_then(Value::as_u64)
                            .and_then(|p| u16::try_from(p).ok()),
                    });
                }
            }
            _ => entries.push(ServiceEntry {
                namespace,
                name,
                port_name: None,
                port: None,
            }),
        }
    }
    entries.sort_by(|a, b| (&a.namespace, &a.name, a.port).cmp(&(&b.namespace, &b.name, b.port)));
    Ok(entries)
}

fn is_active(state: BackendState) -> bool {
    matches!(state, BackendState::Starting | BackendState::Started)
}

/// Run `watcher` until the backend goes inactive, restarting it after
/// `delay` whenever it returns early.
pub async fn supervise<F, Fut>(
    name: &'static str,
    state: watch::Receiver<BackendState>,
    delay: Duration,
    mut watcher: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let outcome = watcher().await;
        if !is_active(*state.borrow()) {
            debug!(watcher = name, "backend inactive; watcher done");
            return;
        }
        match outcome {
            Ok(()) => info!(watcher = name, "watcher exited; restarting"),
            Err(e) => warn!(watcher = name, error = %e, "watcher failed; restarting"),
        }
        tokio::time::sleep(delay).await;
        if !is_active(*state.borrow()) {
            return;
        }
    }
}

/// Copy the stdout of `cmd` into `dest` line by line until it exits.  The
/// source replays the whole guest log, so `dest` starts out empty.
pub async fn mirror_log(cmd: &Cmd, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .await?;
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().ok_or_else(|| Error::Command {
        command: cmd.display(),
        code: None,
        stderr: "stdout not captured".to_string(),
    })?;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    let status = child.wait().await?;
    debug!(command = %cmd.display(), %status, "log source exited");
    Ok(())
}

/// Polls the cluster's services and reports changes.
struct ServicePoller {
    vm: Arc<dyn VmSupervisor>,
    events: EventBus,
    state: watch::Receiver<BackendState>,
    last: tokio::sync::Mutex<Option<Vec<ServiceEntry>>>,
}

impl ServicePoller {
    async fn run(&self) -> Result<()> {
        while is_active(*self.state.borrow()) {
            let output = self
                .vm
                .exec(&["/usr/local/bin/k3s", "kubectl", "get", "services", "-A", "-o", "json"])
                .await;
            let services = match output.and_then(|out| parse_services(&out)) {
                Ok(services) => services,
                Err(e) => {
                    self.events.emit(BackendEvent::ServiceError {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };
            let mut last = self.last.lock().await;
            if last.as_ref() != Some(&services) {
                debug!(count = services.len(), "services changed");
                self.events.emit(BackendEvent::ServiceChanged {
                    services: services.clone(),
                });
                *last = Some(services);
            }
            drop(last);
            tokio::time::sleep(SERVICE_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

/// Handles of the running watchers; dropping it stops them.
#[derive(Default)]
pub struct Watchers {
    tasks: Vec<JoinHandle<()>>,
}

impl Watchers {
    pub fn start(
        vm: Arc<dyn VmSupervisor>,
        logs_dir: PathBuf,
        events: EventBus,
        state: watch::Receiver<BackendState>,
    ) -> Self {
        let mut tasks = Vec::new();

        if let Some(tail) = vm.guest_command(&["tail", "-n", "+1", "-F", GUEST_K3S_LOG]) {
            let dest = logs_dir.join("k3s.log");
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                supervise("k3s log", state, RESTART_DELAY, || {
                    let (tail, dest) = (tail.clone(), dest.clone());
                    async move { mirror_log(&tail, &dest).await }
                })
                .await;
            }));
        }

        let poller = Arc::new(ServicePoller {
            vm,
            events,
            state: state.clone(),
            last: tokio::sync::Mutex::new(None),
        });
        tasks.push(tokio::spawn(async move {
            supervise("services", state, RESTART_DELAY, || {
                let poller = poller.clone();
                async move { poller.run().await }
            })
            .await;
        }));

        Self { tasks }
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn services_are_flattened_per_port() {
        let out = r#"{"items":[
            {"metadata":{"namespace":"kube-system","name":"traefik"},
             "spec":{"ports":[{"name":"web","port":80},{"name":"websecure","port":443}]}},
            {"metadata":{"namespace":"default","name":"kubernetes"},
             "spec":{"ports":[{"name":"https","port":443}]}},
            {"metadata":{"namespace":"default","name":"headless"},"spec":{}}
        ]}"#;
        let services = parse_services(out).unwrap();
        assert_eq!(services.len(), 4);
        assert_eq!(services[0].name, "headless");
        assert_eq!(services[0].port, None);
        assert_eq!(services[1].port, Some(443));
        assert_eq!(services[3].port_name.as_deref(), Some("websecure"));
        assert!(parse_services("").unwrap().is_empty());
        assert!(parse_services("not json").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_only_while_active() {
        let (tx, rx) = watch::channel(BackendState::Started);
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let task = tokio::spawn(supervise("test", rx, Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Config("boom".into()))
            }
        }));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(BackendState::Stopping).unwrap();
        task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mirrors_output_into_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("logs/k3s.log");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "stale\n").unwrap();

        let cmd = Cmd::new("/bin/sh").args(["-c", "echo starting k3s; echo ready"]);
        mirror_log(&cmd, &dest).await.unwrap();
        let log = std::fs::read_to_string(&dest).unwrap();
        let re = regex_lite::Regex::new(r"(?m)^starting k3s$").unwrap();
        assert!(re.is_match(&log));
        assert_eq!(log, "starting k3s\nready\n");
    }
}
