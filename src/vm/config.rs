//! Lima VM descriptor (`lima.yaml`) and networking descriptor
//! (`networks.yaml`).
//!
//! The descriptor is merged, never replaced: keys we do not manage survive
//! an update, managed keys are overwritten, and the docker socket forward is
//! upserted.  The base image reference only moves forward.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::settings::{deep_merge, BackendSettings, MountType, VmType};
use crate::{Error, Result};

/// Lima instance name.
pub const MACHINE_NAME: &str = "0";
/// Docker socket inside the VM (and the default one on the host).
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

const GIB: u64 = 1024 * 1024 * 1024;

/// Keys older releases stored in `lima.yaml` that Lima rejects.
const OBSOLETE_KEYS: &[&str] = &["k3s", "paths"];

const DEFAULT_CONFIG: &str = r#"
arch: default
images: []
cpus: 4
memory: 4294967296
disk: 107374182400
mounts: []
ssh:
  loadDotSSHPubKeys: false
containerd:
  system: false
  user: false
provision:
- mode: system
  script: |
    #!/bin/sh
    hostname lima-rancher-desktop
portForwards: []
"#;

// ---------------------------------------------------------------------------
// lima.yaml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimaImage {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NinePOptions {
    #[serde(rename = "securityModel")]
    pub security_model: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub msize: String,
    pub cache: String,
}

impl Default for NinePOptions {
    fn default() -> Self {
        Self {
            security_model: "none".to_string(),
            protocol_version: "9p2000.L".to_string(),
            msize: "128KiB".to_string(),
            cache: "mmap".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimaMount {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    #[serde(rename = "9p", default, skip_serializing_if = "Option::is_none")]
    pub nine_p: Option<NinePOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default)]
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_dot_ssh_pub_keys: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimaNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lima: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(rename = "vzNAT", default, skip_serializing_if = "Option::is_none")]
    pub vz_nat: Option<bool>,
}

/// A port forward rule; Lima accepts many shapes so this stays untyped.
pub type PortForward = BTreeMap<String, Value>;

/// The parts of `lima.yaml` we manage; everything else lands in `other`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimaConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default)]
    pub images: Vec<LimaImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<LimaMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forwards: Option<Vec<PortForward>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<Vec<LimaNetwork>>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl LimaConfiguration {
    /// Read a descriptor; a missing file is `None`.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_yaml::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_yaml::to_string(self)?).await?;
        debug!(path = %path.display(), "wrote lima config");
        Ok(())
    }

    /// Memory in GiB and CPU count, with Lima's own defaults.
    pub fn resources(&self) -> (f64, u32) {
        let memory = self.memory.unwrap_or(4 * GIB) as f64 / GIB as f64;
        (memory, self.cpus.unwrap_or(2))
    }

    /// Bridged `rd0` / shared `rd1` interfaces.
    pub fn has_bridged_network(&self) -> bool {
        self.networks.iter().flatten().any(|n| {
            n.lima
                .as_deref()
                .is_some_and(|l| l.starts_with(BRIDGED_PREFIX))
        })
    }

    /// Point the docker socket forward at `host_socket`, adding it if needed.
    pub fn upsert_docker_forward(&mut self, host_socket: &Path) {
        let host_socket = Value::String(host_socket.display().to_string());
        let forwards = self.port_forwards.get_or_insert_with(Vec::new);
        let existing = forwards.iter_mut().find(|entry| {
            entry.len() == 2
                && entry.get("guestSocket") == Some(&Value::String(DOCKER_SOCKET.to_string()))
                && entry.contains_key("hostSocket")
        });
        match existing {
            Some(entry) => {
                entry.insert("hostSocket".to_string(), host_socket);
            }
            None => {
                let mut entry = PortForward::new();
                entry.insert("guestSocket".to_string(), json!(DOCKER_SOCKET));
                entry.insert("hostSocket".to_string(), host_socket);
                forwards.push(entry);
            }
        }
    }
}

/// Network layout to write into the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// Leave `networks` as it is (non-macOS hosts).
    Unmanaged,
    /// socket_vmnet: always the shared `rd1`, plus bridged `rd0` over the
    /// named host interface when one has a DHCP address.
    SocketVmnet { bridge: Option<String> },
    VzNat,
    /// No privileged networking at all.
    Disabled,
}

/// One host interface as reported by `system_profiler`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostNetwork {
    pub interface: String,
    pub dhcp: bool,
    pub ipv4: Vec<String>,
}

/// Pick the network layout for this start attempt.
pub fn network_policy(
    darwin: bool,
    allow_root: bool,
    vm_type: VmType,
    host_networks: &[HostNetwork],
) -> NetworkPolicy {
    if !darwin {
        return NetworkPolicy::Unmanaged;
    }
    if allow_root {
        let bridge = host_networks
            .iter()
            .find(|n| n.dhcp && n.ipv4.iter().any(|a| !a.is_empty()))
            .map(|n| n.interface.clone());
        if bridge.is_none() {
            info!("no acceptable host network for bridging");
        }
        return NetworkPolicy::SocketVmnet { bridge };
    }
    if vm_type == VmType::Vz {
        NetworkPolicy::VzNat
    } else {
        info!("administrator access disallowed, not using socket_vmnet");
        NetworkPolicy::Disabled
    }
}

/// Everything the merged descriptor is computed from.
#[derive(Debug, Clone)]
pub struct ConfigInputs {
    pub base_image: PathBuf,
    pub arch: String,
    pub mounts: Vec<LimaMount>,
    pub ssh_port: u16,
    pub docker_host_socket: PathBuf,
    pub network: NetworkPolicy,
}

/// Merge `existing` (if any) with the defaults and the values derived from
/// `settings`.  Running it twice with the same inputs is a no-op.
pub fn merge_config(
    existing: Option<&LimaConfiguration>,
    settings: &BackendSettings,
    inputs: &ConfigInputs,
) -> Result<LimaConfiguration> {
    let vm = &settings.virtual_machine;
    let mut tree: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
    if let Some(config) = existing {
        deep_merge(&mut tree, &serde_json::to_value(config)?);
    }

    let cpus = if vm.number_cpus == 0 { 4 } else { vm.number_cpus };
    let memory_gb = if vm.memory_in_gb == 0 { 4 } else { vm.memory_in_gb };
    let computed = json!({
        "vmType": vm.vm_type.as_str(),
        "rosetta": {"enabled": vm.use_rosetta, "binfmt": vm.use_rosetta},
        "images": [{"location": inputs.base_image.display().to_string(), "arch": inputs.arch}],
        "cpus": cpus,
        "memory": u64::from(memory_gb) * GIB,
        "mounts": inputs.mounts,
        "mountType": vm.mount_type.as_str(),
        "ssh": {"localPort": inputs.ssh_port},
        "hostResolver": {"hosts": {
            "lima-rancher-desktop": "lima-0",
            "host.rancher-desktop.internal": "host.lima.internal",
            "host.docker.internal": "host.lima.internal",
        }},
    });
    deep_merge(&mut tree, &computed);

    let mut config: LimaConfiguration = serde_json::from_value(tree)?;
    for key in OBSOLETE_KEYS {
        config.other.remove(*key);
    }
    // Alpine boots via UEFI.
    if let Some(Value::Object(firmware)) = config.other.get_mut("firmware") {
        firmware.insert("legacyBIOS".to_string(), Value::Bool(false));
    }

    match &inputs.network {
        NetworkPolicy::Unmanaged => {}
        NetworkPolicy::SocketVmnet { bridge } => {
            let mut networks = vec![LimaNetwork {
                lima: Some(SHARED_NETWORK.to_string()),
                interface: Some("rd1".to_string()),
                vz_nat: None,
            }];
            if let Some(iface) = bridge {
                networks.push(LimaNetwork {
                    lima: Some(format!("{BRIDGED_PREFIX}{iface}")),
                    interface: Some("rd0".to_string()),
                    vz_nat: None,
                });
            }
            config.networks = Some(networks);
        }
        NetworkPolicy::VzNat => {
            config.networks = Some(vec![LimaNetwork {
                lima: None,
                interface: Some("vznat".to_string()),
                vz_nat: Some(true),
            }]);
        }
        NetworkPolicy::Disabled => config.networks = None,
    }

    config.upsert_docker_forward(&inputs.docker_host_socket);
    Ok(config)
}

/// Host directories shared into the VM.  Cache, logs and resources are
/// added only when no other mount already covers them.
pub fn default_mounts(
    home: &Path,
    extra_dirs: &[&Path],
    darwin: bool,
    mount_type: MountType,
) -> Vec<LimaMount> {
    let mut locations: Vec<String> = vec!["~".to_string(), "/tmp/rancher-desktop".to_string()];
    if darwin {
        // /var and /tmp are symlinks into /private there
        locations.extend(
            ["/Volumes", "/var/folders", "/private/tmp", "/private/var/folders"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    for dir in extra_dirs {
        let covered = locations.iter().any(|loc| {
            let root = if loc == "~" {
                home.to_path_buf()
            } else {
                PathBuf::from(loc)
            };
            dir.starts_with(&root)
        });
        if !covered {
            locations.push(dir.display().to_string());
        }
    }
    locations
        .into_iter()
        .map(|location| LimaMount {
            location,
            writable: Some(true),
            nine_p: (mount_type == MountType::NineP).then(NinePOptions::default),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Base image versioning
// ---------------------------------------------------------------------------

static IMAGE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    // "alpline" was a typo in old image names
    Regex::new(r"^alpl?ine-lima-v([0-9.]+)(?:[+.]rd(\d+))?-").expect("valid image regex")
});

static RD_PATCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[+.]rd(\d+)").expect("valid patch regex"));

/// What to do with the base image recorded in an existing descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImageUpdate {
    UpToDate,
    /// The recorded image is older than the bundled one.
    Upgrade { from: String },
    /// The recorded image name carries no version; leave it alone.
    Unknown,
}

/// Base image version as `([major, minor, patch], rd patch)`.
type ImageVersion = ([u64; 3], Option<u64>);

fn coerce(version: &str) -> Option<[u64; 3]> {
    let mut parts = [0u64; 3];
    let mut any = false;
    for (slot, piece) in parts
        .iter_mut()
        .zip(version.split('.').filter(|p| !p.is_empty()))
    {
        *slot = piece.parse().ok()?;
        any = true;
    }
    any.then_some(parts)
}

/// Version tag embedded in an image file name.
pub fn image_version(file_name: &str) -> Option<ImageVersion> {
    let caps = IMAGE_VERSION.captures(file_name)?;
    let core = coerce(caps.get(1)?.as_str())?;
    let rd = caps.get(2).and_then(|m| m.as_str().parse().ok());
    Some((core, rd))
}

/// Compare the recorded base image against `bundled_version` (e.g.
/// `0.2.31` or `0.2.31.rd2`).  A recorded image newer than the bundled one
/// is fatal.
pub fn check_base_image(
    existing: &LimaConfiguration,
    bundled_version: &str,
) -> Result<BaseImageUpdate> {
    let names: Vec<String> = existing
        .images
        .iter()
        .filter_map(|i| {
            Path::new(&i.location)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .collect();
    let Some((found, found_rd)) = names.iter().find_map(|n| image_version(n)) else {
        info!(images = ?names, "could not find base image version; skipping update");
        return Ok(BaseImageUpdate::Unknown);
    };

    let bundled_core = bundled_version
        .split(['+', '-'])
        .next()
        .and_then(|v| coerce(v.split(".rd").next().unwrap_or(v)))
        .ok_or_else(|| Error::Config(format!("bad bundled image version {bundled_version}")))?;
    let bundled_rd = RD_PATCH
        .captures(bundled_version)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok());

    let ordering = bundled_core
        .cmp(&found)
        .then_with(|| bundled_rd.unwrap_or(0).cmp(&found_rd.unwrap_or(0)))
        .then_with(|| bundled_rd.is_some().cmp(&found_rd.is_some()));

    let from = format!("{}.{}.{}", found[0], found[1], found[2]);
    match ordering {
        std::cmp::Ordering::Less => {
            info!(existing = %from, bundled = bundled_version, "base disk is newer than bundled image");
            Err(Error::fatal(
                "Rancher Desktop Update Required",
                "This Rancher Desktop installation appears to be older than the version that \
                 created your existing Kubernetes cluster. Please either update Rancher Desktop \
                 or reset Kubernetes and container images.",
            ))
        }
        std::cmp::Ordering::Equal => Ok(BaseImageUpdate::UpToDate),
        std::cmp::Ordering::Greater => Ok(BaseImageUpdate::Upgrade { from }),
    }
}

// ---------------------------------------------------------------------------
// networks.yaml
// ---------------------------------------------------------------------------

pub const SHARED_NETWORK: &str = "rancher-desktop-shared";
pub const BRIDGED_PREFIX: &str = "rancher-desktop-bridged_";
pub const SOCKET_VMNET: &str = "/opt/rancher-desktop/bin/socket_vmnet";
pub const VAR_RUN: &str = "/private/var/run/rancher-desktop-lima";
pub const SUDOERS_PATH: &str = "/private/etc/sudoers.d/zzzzz-rancher-desktop-lima";
/// Sudoers file name used by 1.0.0 and earlier.
pub const PREVIOUS_SUDOERS_PATH: &str = "/private/etc/sudoers.d/rancher-desktop-lima";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPaths {
    #[serde(rename = "socketVMNet")]
    pub socket_vmnet: String,
    #[serde(rename = "varRun")]
    pub var_run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudoers: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetworkDef {
    Host {
        gateway: String,
        #[serde(rename = "dhcpEnd")]
        dhcp_end: String,
        netmask: String,
    },
    Shared {
        gateway: String,
        #[serde(rename = "dhcpEnd")]
        dhcp_end: String,
        netmask: String,
    },
    Bridged {
        interface: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimaNetworkConfig {
    pub paths: NetworkPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub networks: BTreeMap<String, NetworkDef>,
}

impl Default for LimaNetworkConfig {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            SHARED_NETWORK.to_string(),
            NetworkDef::Shared {
                gateway: "192.168.205.1".to_string(),
                dhcp_end: "192.168.205.254".to_string(),
                netmask: "255.255.255.0".to_string(),
            },
        );
        networks.insert(
            "host".to_string(),
            NetworkDef::Host {
                gateway: "192.168.206.1".to_string(),
                dhcp_end: "192.168.206.254".to_string(),
                netmask: "255.255.255.0".to_string(),
            },
        );
        Self {
            paths: NetworkPaths {
                socket_vmnet: SOCKET_VMNET.to_string(),
                var_run: VAR_RUN.to_string(),
                sudoers: Some(SUDOERS_PATH.to_string()),
            },
            group: Some("everyone".to_string()),
            networks,
        }
    }
}

/// Bring `existing` in line with what we need.  A file whose `varRun` is
/// not ours is replaced (the caller backs it up first).  Bridged networks
/// are regenerated for every host interface; the sudoers path is kept only
/// when root is allowed.
pub fn network_config(
    existing: Option<LimaNetworkConfig>,
    host_interfaces: &[String],
    allow_root: bool,
) -> LimaNetworkConfig {
    let mut config = existing
        .filter(|c| c.paths.var_run == VAR_RUN)
        .unwrap_or_default();
    config.paths.socket_vmnet = SOCKET_VMNET.to_string();
    if config.group.as_deref() == Some("staff") {
        config.group = Some("everyone".to_string());
    }
    config.networks.retain(|name, _| !name.starts_with(BRIDGED_PREFIX));

    if allow_root {
        for iface in host_interfaces.iter().filter(|i| !i.is_empty()) {
            config.networks.insert(
                format!("{BRIDGED_PREFIX}{iface}"),
                NetworkDef::Bridged {
                    interface: iface.clone(),
                },
            );
        }
        match config.paths.sudoers.as_deref() {
            None | Some(PREVIOUS_SUDOERS_PATH) => {
                config.paths.sudoers = Some(SUDOERS_PATH.to_string());
            }
            Some(_) => {}
        }
    } else {
        config.paths.sudoers = None;
    }
    config
}

fn daemon_rule(name: &str, args: &str) -> String {
    format!(
        "# Manage \"{name}\" network daemons\n\n\
         %everyone ALL=(root:wheel) NOPASSWD:NOSETENV: \\\n    \
         {SOCKET_VMNET} --pidfile=/private/var/run/{name}_socket_vmnet.pid --socket-group=everyone {args} /private/var/run/socket_vmnet.{name}, \\\n    \
         /usr/bin/pkill -F /private/var/run/{name}_socket_vmnet.pid\n"
    )
}

/// The sudoers file `limactl sudoers` would generate for `config`.
pub fn sudoers_file(config: &LimaNetworkConfig) -> Result<String> {
    let Some(NetworkDef::Host {
        gateway,
        dhcp_end,
        netmask,
    }) = config.networks.get("host")
    else {
        return Err(Error::Config("host network has wrong type".to_string()));
    };
    let mut sudoers = String::from(
        "%everyone ALL=(root:wheel) NOPASSWD:NOSETENV: /bin/mkdir -m 775 -p /private/var/run\n\n",
    );
    sudoers += &daemon_rule(
        "host",
        &format!("--vmnet-mode=host --vmnet-gateway={gateway} --vmnet-dhcp-end={dhcp_end} --vmnet-mask={netmask}"),
    );
    sudoers.push('\n');

    for (name, def) in &config.networks {
        if let (Some(iface), NetworkDef::Bridged { .. }) = (name.strip_prefix(BRIDGED_PREFIX), def)
        {
            sudoers += &daemon_rule(
                name,
                &format!("--vmnet-mode=bridged --vmnet-interface={iface}"),
            );
            sudoers.push('\n');
        }
    }

    let Some(NetworkDef::Shared {
        gateway,
        dhcp_end,
        netmask,
    }) = config.networks.get(SHARED_NETWORK)
    else {
        return Err(Error::Config("shared network has wrong type".to_string()));
    };
    sudoers += &daemon_rule(
        SHARED_NETWORK,
        &format!("--vmnet-mode=shared --vmnet-gateway={gateway} --vmnet-dhcp-end={dhcp_end} --vmnet-mask={netmask}"),
    );
    Ok(sudoers)
}
