//! User settings snapshot consumed by the backend, and the JSON store the CLI
//! keeps them in.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// Settings relevant to the VM, as seen by the backend.  Cloned on `start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub application: ApplicationSettings,
    pub container_engine: ContainerEngineSettings,
    pub kubernetes: KubernetesSettings,
    pub virtual_machine: VirtualMachineSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationSettings {
    /// Whether privileged host changes may be requested at all.
    pub admin_access: bool,
    pub debug: bool,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            admin_access: true,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerEngine {
    #[default]
    Moby,
    Containerd,
}

impl ContainerEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerEngine::Moby => "moby",
            ContainerEngine::Containerd => "containerd",
        }
    }

    /// Name of the OpenRC service inside the VM.
    pub fn service(&self) -> &'static str {
        match self {
            ContainerEngine::Moby => "docker",
            ContainerEngine::Containerd => "containerd",
        }
    }
}

impl fmt::Display for ContainerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerEngineSettings {
    pub name: ContainerEngine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesSettings {
    pub enabled: bool,
    /// Desired k3s version without the `v` prefix or build suffix; empty
    /// means "newest available".
    pub version: String,
    pub port: u16,
    pub options: KubernetesOptions,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            version: String::new(),
            port: 6443,
            options: KubernetesOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesOptions {
    pub traefik: bool,
    pub flannel: bool,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            traefik: true,
            flannel: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    #[default]
    Qemu,
    Vz,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Qemu => "qemu",
            VmType::Vz => "vz",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountType {
    #[default]
    #[serde(rename = "reverse-sshfs")]
    ReverseSshfs,
    #[serde(rename = "9p")]
    NineP,
    #[serde(rename = "virtiofs")]
    Virtiofs,
}

impl MountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountType::ReverseSshfs => "reverse-sshfs",
            MountType::NineP => "9p",
            MountType::Virtiofs => "virtiofs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineSettings {
    #[serde(rename = "memoryInGB")]
    pub memory_in_gb: u32,
    #[serde(rename = "numberCPUs")]
    pub number_cpus: u32,
    #[serde(rename = "type")]
    pub vm_type: VmType,
    pub use_rosetta: bool,
    pub mount_type: MountType,
}

impl Default for VirtualMachineSettings {
    fn default() -> Self {
        Self {
            memory_in_gb: 4,
            number_cpus: 4,
            vm_type: VmType::default(),
            use_rosetta: false,
            mount_type: MountType::default(),
        }
    }
}

impl BackendSettings {
    /// The settings as a JSON tree with camelCase keys.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// A copy with `patch` deep-merged over it.
    pub fn merged(&self, patch: &Value) -> Result<Self> {
        let mut tree = self.to_value();
        deep_merge(&mut tree, patch);
        serde_json::from_value(tree)
            .map_err(|e| Error::Config(format!("invalid settings: {e}")))
    }
}

/// Recursively merge `patch` into `target`.  Objects merge key by key;
/// anything else (including arrays) replaces the target value.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

// ---------------------------------------------------------------------------
// Writing settings back
// ---------------------------------------------------------------------------

/// Collaborator the backend calls when it must persist a derived value
/// (resolved k3s version, disabled admin access, disabled kubernetes).
#[async_trait]
pub trait SettingsWriter: Send + Sync {
    async fn write_settings(&self, patch: Value) -> Result<()>;
}

/// Settings persisted as one JSON document.
pub struct JsonSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the settings; a missing file yields the defaults.
    pub async fn load(&self) -> Result<BackendSettings> {
        let _g = self.lock.lock().await;
        let tree = self.read_tree().await?;
        serde_json::from_value(tree).map_err(|e| {
            Error::Config(format!("invalid settings file {}: {e}", self.path.display()))
        })
    }

    async fn read_tree(&self) -> Result<Value> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                Error::Config(format!("invalid settings file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Value::Object(Default::default()))
            }
            Err(e) => Err(Error::Config(format!(
                "failed reading {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl SettingsWriter for JsonSettingsStore {
    async fn write_settings(&self, patch: Value) -> Result<()> {
        let _g = self.lock.lock().await;
        let mut tree = self.read_tree().await?;
        deep_merge(&mut tree, &patch);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(&tree)?;
        tokio::fs::write(&self.path, data).await.map_err(|e| {
            Error::Config(format!("failed writing {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), %patch, "settings updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: BackendSettings =
            serde_json::from_value(json!({"kubernetes": {"version": "1.27.3"}})).unwrap();
        assert_eq!(settings.kubernetes.version, "1.27.3");
        assert!(settings.kubernetes.enabled);
        assert_eq!(settings.kubernetes.port, 6443);
        assert!(settings.application.admin_access);
        assert_eq!(settings.virtual_machine.memory_in_gb, 4);
    }

    #[test]
    fn keys_are_camel_case() {
        let tree = BackendSettings::default().to_value();
        assert!(tree.pointer("/virtualMachine/memoryInGB").is_some());
        assert!(tree.pointer("/virtualMachine/numberCPUs").is_some());
        assert_eq!(tree.pointer("/containerEngine/name"), Some(&json!("moby")));
        assert_eq!(
            tree.pointer("/virtualMachine/mountType"),
            Some(&json!("reverse-sshfs"))
        );
    }

    #[test]
    fn deep_merge_replaces_leaves_and_arrays() {
        let mut target = json!({"a": {"b": 1, "c": [1, 2]}, "d": true});
        deep_merge(&mut target, &json!({"a": {"c": [3]}, "e": "x"}));
        assert_eq!(target, json!({"a": {"b": 1, "c": [3]}, "d": true, "e": "x"}));
    }

    #[test]
    fn merged_rejects_bad_types() {
        let base = BackendSettings::default();
        assert!(base.merged(&json!({"kubernetes": {"port": "nope"}})).is_err());
        let merged = base.merged(&json!({"kubernetes": {"enabled": false}})).unwrap();
        assert!(!merged.kubernetes.enabled);
    }

    #[tokio::test]
    async fn store_merges_patches() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(tmp.path().join("cfg/settings.json"));
        assert_eq!(store.load().await.unwrap(), BackendSettings::default());

        store
            .write_settings(json!({"kubernetes": {"version": "1.26.6"}}))
            .await
            .unwrap();
        store
            .write_settings(json!({"application": {"adminAccess": false}}))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.kubernetes.version, "1.26.6");
        assert!(!loaded.application.admin_access);
        assert!(loaded.kubernetes.enabled);
    }
}
