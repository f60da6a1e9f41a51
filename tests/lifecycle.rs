//! Backend lifecycle through the public handle, against the mock VM.

mod common;

use std::time::Duration;

use common::{Harness, K3S_NEW};
use rd_engine::backend::{Action, BackendState};
use rd_engine::context::FixedPrompter;
use rd_engine::restart::Severity;
use rd_engine::settings::ContainerEngine;
use rd_engine::sudo::{MockElevator, SudoCommand, SudoReason};
use rd_engine::vm::config::{HostNetwork, LimaConfiguration};
use rd_engine::vm::instance_config_path;
use rd_engine::vm::mock::MockOptions;
use rd_engine::vm::VmSupervisor;
use rd_engine::Error;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

fn slow_guest() -> MockOptions {
    MockOptions {
        exec_delay: Duration::from_millis(20),
        ..MockOptions::default()
    }
}

/// Yield until the backend has picked up the submitted command.
async fn until_starting(h: &Harness) {
    for _ in 0..1000 {
        if h.backend.state() == BackendState::Starting {
            return;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("backend never reached STARTING");
}

#[tokio::test]
async fn start_with_kubernetes_reaches_started() {
    let mut h = Harness::builder().build().await;
    assert_ok!(h.backend.start(h.kube_settings("1.29.1")).await);

    assert_eq!(h.backend.state(), BackendState::Started);
    assert_eq!(h.backend.action(), Action::None);
    assert_eq!(
        h.drain_states(),
        vec![BackendState::Starting, BackendState::Started]
    );
    assert_eq!(h.vm.installed_k3s().as_deref(), Some(K3S_NEW));
    assert_eq!(h.recorded_k3s().as_deref(), Some(K3S_NEW));

    let order: Vec<usize> = [
        "update-config allow_privileged=true",
        "start",
        "/sbin/rc-service --ifnotstarted docker start",
        "install-k3s v1.29.1+k3s1",
        "/sbin/rc-service --ifnotstarted k3s start",
    ]
    .iter()
    .map(|needle| h.vm.position(needle).unwrap_or_else(|| panic!("missing {needle}")))
    .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");

    let kubeconfig = std::fs::read_to_string(&h.paths.kubeconfig).unwrap();
    assert!(kubeconfig.contains("rancher-desktop"));
    let conf = h.vm.file("/etc/conf.d/k3s").unwrap();
    assert!(conf.contains("ENGINE=\"moby\""), "{conf}");
}

#[tokio::test]
async fn engine_only_start_is_disabled() {
    let mut h = Harness::builder().cached(&[]).build().await;
    assert_ok!(h.backend.start(h.engine_settings()).await);

    assert_eq!(h.backend.state(), BackendState::Disabled);
    assert_eq!(
        h.drain_states(),
        vec![BackendState::Starting, BackendState::Disabled]
    );
    assert!(h.vm.position("install-k3s").is_none());
    assert!(h.vm.position("update-ca-certificates").is_some());
}

#[tokio::test]
async fn auxiliary_failures_do_not_abort_start() {
    let options = MockOptions {
        fail_on: vec!["trivy".to_string(), "update-ca-certificates".to_string()],
        ..MockOptions::default()
    };
    let h = Harness::builder().options(options).build().await;
    assert_ok!(h.backend.start(h.kube_settings("1.29.1")).await);
    assert_eq!(h.backend.state(), BackendState::Started);
}

#[tokio::test]
async fn second_stop_is_a_no_op() {
    let mut h = Harness::builder().build().await;
    h.backend.start(h.engine_settings()).await.unwrap();
    h.drain_states();

    let (first, second) = tokio::join!(h.backend.stop(), h.backend.stop());
    assert_ok!(first);
    assert_ok!(second);

    assert_eq!(
        h.drain_states(),
        vec![BackendState::Stopping, BackendState::Stopped]
    );
    assert!(!h.vm.is_running().await.unwrap());
    assert!(h.vm.position("/sbin/fstrim /mnt/data").is_some());
}

#[tokio::test]
async fn start_is_rejected_while_busy() {
    let h = Harness::builder().options(slow_guest()).build().await;
    let first = {
        let backend = h.backend.clone();
        let settings = h.kube_settings("1.29.1");
        tokio::spawn(async move { backend.start(settings).await })
    };
    until_starting(&h).await;

    let err = assert_err!(h.backend.start(h.engine_settings()).await);
    assert!(matches!(err, Error::Busy(Action::Starting)), "{err}");
    assert!(matches!(h.backend.del(true).await, Err(Error::Busy(_))));

    assert_ok!(first.await.unwrap());
    assert_eq!(h.backend.state(), BackendState::Started);
}

#[tokio::test]
async fn stop_during_start_is_ignored() {
    let mut h = Harness::builder().options(slow_guest()).build().await;
    let start = {
        let backend = h.backend.clone();
        let settings = h.kube_settings("1.29.1");
        tokio::spawn(async move { backend.start(settings).await })
    };
    until_starting(&h).await;
    assert_ok!(h.backend.stop().await);
    assert_ok!(start.await.unwrap());

    assert_eq!(h.backend.state(), BackendState::Started);
    assert_eq!(h.backend.action(), Action::None);
    assert_eq!(
        h.drain_states(),
        vec![BackendState::Starting, BackendState::Started]
    );
    assert!(h.vm.is_running().await.unwrap());
    assert!(h.vm.position("/sbin/rc-service --ifnotstarted k3s start").is_some());
}

#[tokio::test]
async fn abort_during_start_stops_the_vm() {
    let mut h = Harness::builder().options(slow_guest()).build().await;
    let start = {
        let backend = h.backend.clone();
        let settings = h.kube_settings("1.29.1");
        tokio::spawn(async move { backend.start(settings).await })
    };
    until_starting(&h).await;
    h.backend.abort();
    assert_ok!(start.await.unwrap());

    assert_eq!(h.backend.state(), BackendState::Stopped);
    assert_eq!(h.backend.action(), Action::None);
    let states = h.drain_states();
    assert_eq!(states.first(), Some(&BackendState::Starting));
    assert_eq!(states.last(), Some(&BackendState::Stopped));
    assert!(!states.contains(&BackendState::Started));
    assert!(h.vm.position("/sbin/rc-service --ifnotstarted k3s start").is_none());
    assert!(!h.vm.is_running().await.unwrap());
}

#[tokio::test]
async fn abort_when_idle_does_nothing() {
    let h = Harness::builder().build().await;
    h.backend.abort();
    assert_ok!(h.backend.start(h.engine_settings()).await);
    assert_eq!(h.backend.state(), BackendState::Disabled);
}

#[tokio::test]
async fn moby_is_configured_before_it_starts() {
    let h = Harness::builder().build().await;
    assert_ok!(h.backend.start(h.kube_settings("1.29.1")).await);

    let cni = h.vm.position("mkdir -p /etc/cni/net.d").expect("CNI dir created");
    let conflist = h
        .vm
        .position("write /etc/cni/net.d/10-flannel.conflist")
        .expect("flannel config written");
    let conf = h.vm.position("write /etc/conf.d/docker").expect("docker conf written");
    let started = h
        .vm
        .position("/sbin/rc-service --ifnotstarted docker start")
        .unwrap();
    assert!(cni < conflist && conflist < started && conf < started);

    let flannel = h.vm.file("/etc/cni/net.d/10-flannel.conflist").unwrap();
    let flannel: serde_json::Value = serde_json::from_str(&flannel).unwrap();
    assert_eq!(flannel["plugins"][0]["type"], json!("flannel"));
    let docker = h.vm.file("/etc/conf.d/docker").unwrap();
    assert!(docker.contains("--host=unix:///var/run/docker.sock "), "{docker}");
    assert!(docker.contains("--host=unix:///var/run/docker.sock.raw"), "{docker}");
    assert!(docker.contains("${DOCKER_OPTS:-}"), "{docker}");
    assert!(h.vm.position("namespaces create default").is_none());
}

#[tokio::test]
async fn containerd_gets_its_default_namespace() {
    let options = MockOptions {
        fail_on: vec!["namespaces create".to_string()],
        ..MockOptions::default()
    };
    let h = Harness::builder().options(options).build().await;
    let mut settings = h.kube_settings("1.29.1");
    settings.container_engine.name = ContainerEngine::Containerd;
    settings.kubernetes.options.flannel = false;

    // An existing namespace makes `ctr` fail; start carries on.
    assert_ok!(h.backend.start(settings).await);
    assert_eq!(h.backend.state(), BackendState::Started);

    let started = h
        .vm
        .position("/sbin/rc-service --ifnotstarted containerd start")
        .expect("containerd started");
    let namespace = h
        .vm
        .position("ctr --address /run/k3s/containerd/containerd.sock namespaces create default")
        .expect("namespace created");
    assert!(started < namespace);
    assert!(h.vm.position("mkdir -p /etc/cni/net.d").is_some());
    assert!(h.vm.file("/etc/cni/net.d/10-flannel.conflist").is_none());
    assert!(h.vm.file("/etc/conf.d/docker").is_none());
    assert!(h.vm.position("/sbin/rc-service --ifnotstarted docker start").is_none());
}

#[tokio::test]
async fn restart_requested_mid_start_runs_afterwards() {
    let mut h = Harness::builder().options(slow_guest()).build().await;
    let start = {
        let backend = h.backend.clone();
        let settings = h.engine_settings();
        tokio::spawn(async move { backend.start(settings).await })
    };
    until_starting(&h).await;

    let mut wanted = h.engine_settings();
    wanted.virtual_machine.number_cpus = 6;
    assert_ok!(h.backend.restart(wanted).await);
    assert_ok!(start.await.unwrap());

    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let states = h.drain_states();
            if states.contains(&BackendState::Stopped) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deferred restart never stopped the VM");
    h.wait_for_state(BackendState::Disabled).await;

    let (_, cpus) = h.vm.current_resources().await.unwrap().unwrap();
    assert_eq!(cpus, 6);
}

#[tokio::test]
async fn declined_elevation_starts_without_bridged_networking() {
    let options = MockOptions {
        darwin: true,
        host_networks: vec![HostNetwork {
            interface: "en0".to_string(),
            dhcp: true,
            ipv4: vec!["192.168.1.20".to_string()],
        }],
        sudo_commands: vec![SudoCommand {
            reason: SudoReason::Networking,
            commands: vec!["mkdir -p /private/var/run/rancher-desktop-lima".to_string()],
            paths: vec!["/private/var/run/rancher-desktop-lima".to_string()],
        }],
        ..MockOptions::default()
    };
    let h = Harness::builder()
        .options(options)
        .prompter(FixedPrompter::declining())
        .elevator(MockElevator::new(true))
        .build()
        .await;

    assert_ok!(h.backend.start(h.engine_settings()).await);
    assert_eq!(h.backend.state(), BackendState::Disabled);
    assert_eq!(h.prompter.consent_requests().len(), 1);
    assert!(h.elevator.scripts().is_empty());
    assert!(h.vm.position("update-config allow_privileged=false").is_some());

    let config = LimaConfiguration::load(&instance_config_path(&h.paths))
        .await
        .unwrap()
        .unwrap();
    assert!(!config.has_bridged_network());
}

#[tokio::test]
async fn accepted_elevation_runs_one_script() {
    let options = MockOptions {
        sudo_commands: vec![
            SudoCommand {
                reason: SudoReason::Networking,
                commands: vec!["mkdir -p /opt/rancher-desktop".to_string()],
                paths: vec!["/opt/rancher-desktop".to_string()],
            },
            SudoCommand {
                reason: SudoReason::DockerSocket,
                commands: vec!["ln -sf /tmp/docker.sock /var/run/docker.sock".to_string()],
                paths: vec!["/var/run/docker.sock".to_string()],
            },
        ],
        ..MockOptions::default()
    };
    let h = Harness::builder()
        .options(options)
        .elevator(MockElevator::new(true))
        .build()
        .await;

    assert_ok!(h.backend.start(h.engine_settings()).await);
    let scripts = h.elevator.scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("mkdir -p /opt/rancher-desktop"));
    assert!(scripts[0].contains("/var/run/docker.sock"));
    assert!(h.vm.position("update-config allow_privileged=false").is_none());
}

#[tokio::test]
async fn fatal_start_errors_propagate_and_allow_retry() {
    let options = MockOptions {
        virtualization_supported: false,
        ..MockOptions::default()
    };
    let h = Harness::builder().options(options).build().await;

    let err = assert_err!(h.backend.start(h.engine_settings()).await);
    assert!(err.is_fatal());
    assert_eq!(err.title(), "Virtualization not supported");
    assert_eq!(h.backend.state(), BackendState::Error);
    assert_eq!(h.backend.action(), Action::None);

    let details = h.backend.failure_details(&err).await;
    assert_eq!(details.last_command_comment, "Ensuring virtualization is supported");

    // ERROR -> STARTING is allowed.
    assert!(!matches!(
        h.backend.start(h.engine_settings()).await,
        Err(Error::Busy(_))
    ));
}

#[tokio::test]
async fn reset_wipes_kubernetes_state_and_starts_again() {
    let mut h = Harness::builder().build().await;
    h.backend.start(h.kube_settings("1.29.1")).await.unwrap();
    h.drain_states();
    let before = h.vm.commands().len();

    assert_ok!(h.backend.reset(h.kube_settings("1.29.1")).await);
    assert_eq!(h.backend.state(), BackendState::Started);
    assert_eq!(
        h.drain_states(),
        vec![
            BackendState::Stopping,
            BackendState::Stopped,
            BackendState::Starting,
            BackendState::Started
        ]
    );
    let since = h.commands_since(before);
    let wipe = since
        .iter()
        .position(|c| c.starts_with("rm -rf /etc/rancher/k3s"))
        .expect("k3s state removed");
    let install = since
        .iter()
        .position(|c| c.contains("install-k3s"))
        .expect("k3s reinstalled");
    assert!(wipe < install);
    assert!(!since.iter().any(|c| c == "delete"));
}

#[tokio::test]
async fn delete_removes_the_vm_and_install_record() {
    let h = Harness::builder().build().await;
    h.backend.start(h.kube_settings("1.29.1")).await.unwrap();
    assert!(h.recorded_k3s().is_some());

    assert_ok!(h.backend.del(false).await);
    assert_eq!(h.backend.state(), BackendState::Stopped);
    assert!(!h.vm.is_registered().await.unwrap());
    assert!(h.recorded_k3s().is_none());
    assert!(!instance_config_path(&h.paths).exists());
    // A graceful delete stops the engine first.
    assert!(h.vm.position("/sbin/rc-service --ifstarted docker stop").is_some());
}

#[tokio::test]
async fn factory_reset_can_keep_the_image_cache() {
    let h = Harness::builder().build().await;
    h.backend.start(h.engine_settings()).await.unwrap();
    std::fs::create_dir_all(&h.paths.logs).unwrap();
    std::fs::write(h.paths.logs.join("rd-engine.log"), "started\n").unwrap();
    std::fs::create_dir_all(&h.paths.config).unwrap();
    std::fs::write(h.paths.settings_file(), "{}").unwrap();

    assert_ok!(h.backend.factory_reset(true).await);
    assert_eq!(h.backend.state(), BackendState::Stopped);
    assert!(!h.vm.is_registered().await.unwrap());
    assert!(!h.paths.config.exists());
    assert!(!h.paths.logs.exists());
    assert!(!h.paths.app_home.exists());
    assert!(h.paths.cache.join("k3s").join(K3S_NEW).is_dir());
}

#[tokio::test]
async fn factory_reset_without_keep_removes_the_cache() {
    let h = Harness::builder().build().await;
    h.backend.start(h.engine_settings()).await.unwrap();
    std::fs::create_dir_all(&h.paths.alt_app_home).unwrap();

    assert_ok!(h.backend.factory_reset(false).await);
    assert!(!h.paths.cache.exists());
    assert!(!h.paths.alt_app_home.exists());
    // Not restarted.
    assert!(!h.vm.is_running().await.unwrap());
}

#[tokio::test]
async fn restart_reasons_compare_against_the_running_settings() {
    let h = Harness::builder().build().await;
    assert!(h
        .backend
        .requires_restart_reasons(&json!({"kubernetes": {"version": "1.28.5"}}))
        .await
        .unwrap()
        .is_empty());

    let settings = h.kube_settings("1.29.1");
    h.backend.start(settings.clone()).await.unwrap();

    let same = h
        .backend
        .requires_restart_reasons(&settings.to_value())
        .await
        .unwrap();
    assert!(same.is_empty(), "{same:?}");

    let reasons = h
        .backend
        .requires_restart_reasons(&json!({
            "kubernetes": {"version": "1.28.5"},
            "virtualMachine": {"memoryInGB": 8},
            "application": {"debug": true},
        }))
        .await
        .unwrap();
    assert_eq!(reasons["kubernetes.version"].severity, Severity::Reset);
    assert_eq!(reasons["virtualMachine.memoryInGB"].severity, Severity::Restart);
    assert_eq!(reasons["virtualMachine.memoryInGB"].current, json!(4.0));
    assert!(!reasons.contains_key("application.debug"));
}
