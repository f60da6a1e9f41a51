//! The Lima descriptor as written through the supervisor.

mod common;

use common::Harness;
use rd_engine::settings::{BackendSettings, VmType};
use rd_engine::vm::config::{HostNetwork, LimaConfiguration, DOCKER_SOCKET};
use rd_engine::vm::mock::MockOptions;
use rd_engine::vm::{instance_config_path, new_config_path, VmSupervisor};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

fn existing_descriptor(image: &str) -> String {
    format!(
        "images:\n\
         - location: /old/resources/{image}\n  arch: x86_64\n\
         cpus: 2\n\
         env:\n  HTTP_PROXY: http://proxy:3128\n\
         portForwards:\n\
         - guestSocket: {DOCKER_SOCKET}\n  hostSocket: /stale/docker.sock\n\
         - guestPort: 8080\n  hostPort: 8080\n"
    )
}

fn darwin_host() -> MockOptions {
    MockOptions {
        darwin: true,
        host_networks: vec![HostNetwork {
            interface: "en0".to_string(),
            dhcp: true,
            ipv4: vec!["192.168.1.20".to_string()],
        }],
        ..MockOptions::default()
    }
}

#[tokio::test]
async fn update_config_is_idempotent() {
    let h = Harness::builder().build().await;
    let settings = BackendSettings::default();

    assert_ok!(h.vm.update_config(&settings, true).await);
    let first = std::fs::read_to_string(new_config_path(&h.paths)).unwrap();
    assert_ok!(h.vm.update_config(&settings, true).await);
    let second = std::fs::read_to_string(new_config_path(&h.paths)).unwrap();
    assert_eq!(first, second);

    h.vm.start_vm().await.unwrap();
    assert_ok!(h.vm.update_config(&settings, true).await);
    let third = std::fs::read_to_string(instance_config_path(&h.paths)).unwrap();
    assert_eq!(second, third);
}

#[tokio::test]
async fn existing_descriptor_is_merged_not_replaced() {
    let h = Harness::builder().build().await;
    let path = instance_config_path(&h.paths);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, existing_descriptor("alpine-lima-v0.2.31-rd-3.18.0.iso")).unwrap();

    let mut settings = BackendSettings::default();
    settings.virtual_machine.number_cpus = 6;
    assert_ok!(h.vm.update_config(&settings, false).await);

    let config = LimaConfiguration::load(&path).await.unwrap().unwrap();
    assert_eq!(config.cpus, Some(6));
    assert_eq!(config.other["env"], json!({"HTTP_PROXY": "http://proxy:3128"}));

    let forwards = config.port_forwards.unwrap();
    let docker: Vec<_> = forwards
        .iter()
        .filter(|f| f.get("guestSocket") == Some(&json!(DOCKER_SOCKET)))
        .collect();
    assert_eq!(docker.len(), 1);
    assert_eq!(
        docker[0]["hostSocket"],
        json!(h.paths.docker_socket().display().to_string())
    );
    assert!(forwards.iter().any(|f| f.get("guestPort") == Some(&json!(8080))));
    assert_eq!(h.vm.base_image_upgrades(), 0);
}

#[tokio::test]
async fn newer_base_image_is_refused() {
    let h = Harness::builder().build().await;
    let path = instance_config_path(&h.paths);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let original = existing_descriptor("alpine-lima-v0.3.0-rd-3.18.0.iso");
    std::fs::write(&path, &original).unwrap();

    let err = assert_err!(h.vm.update_config(&BackendSettings::default(), true).await);
    assert!(err.is_fatal());
    assert_eq!(err.title(), "Rancher Desktop Update Required");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
}

#[tokio::test]
async fn older_base_image_is_replaced() {
    let h = Harness::builder().build().await;
    let path = instance_config_path(&h.paths);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, existing_descriptor("alpine-lima-v0.2.20-rd-3.17.0.iso")).unwrap();

    assert_ok!(h.vm.update_config(&BackendSettings::default(), true).await);
    assert_eq!(h.vm.base_image_upgrades(), 1);
    assert!(h.vm.position("replace basedisk").is_some());

    let config = LimaConfiguration::load(&path).await.unwrap().unwrap();
    assert_eq!(config.images.len(), 1);
    assert!(config.images[0].location.ends_with("alpine-lima-v0.2.31-rd-3.18.0.iso"));
}

#[tokio::test]
async fn bridged_networking_needs_root() {
    let h = Harness::builder().options(darwin_host()).build().await;
    let settings = BackendSettings::default();
    let path = new_config_path(&h.paths);

    assert_ok!(h.vm.update_config(&settings, true).await);
    let privileged = LimaConfiguration::load(&path).await.unwrap().unwrap();
    assert!(privileged.has_bridged_network());

    assert_ok!(h.vm.update_config(&settings, false).await);
    let unprivileged = LimaConfiguration::load(&path).await.unwrap().unwrap();
    assert!(!unprivileged.has_bridged_network());
    assert!(unprivileged.networks.is_none());
}

#[tokio::test]
async fn vz_without_root_uses_vz_nat() {
    let h = Harness::builder().options(darwin_host()).build().await;
    let mut settings = BackendSettings::default();
    settings.virtual_machine.vm_type = VmType::Vz;

    assert_ok!(h.vm.update_config(&settings, false).await);
    let config = LimaConfiguration::load(&new_config_path(&h.paths))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(config.vm_type.as_deref(), Some("vz"));
    let networks = config.networks.unwrap();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].vz_nat, Some(true));
}
