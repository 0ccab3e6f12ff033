//! Per-operation configuration structs with documented defaults.
//!
//! These deserialize directly from the thin API layer's JSON bodies; every
//! optional field carries its default here rather than in the handlers.

use std::time::Duration;

use serde::Deserialize;

use crate::media::{AnswerSettings, DEFAULT_MIRROR_URL};

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Mirror serving installer images.
    pub mirror_url: String,
    /// Wait between VM creation and auto-start.
    pub creation_grace: Duration,
    /// Wait between stop and delete during teardown.
    pub stop_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mirror_url: DEFAULT_MIRROR_URL.to_string(),
            creation_grace: Duration::from_secs(3),
            stop_grace: Duration::from_secs(5),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_nested_name() -> String {
    "nested-proxmox".to_string()
}

fn default_nested_memory() -> u32 {
    16384
}

fn default_nested_cores() -> u32 {
    4
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_disk_storage() -> String {
    "local-lvm".to_string()
}

fn default_iso_storage() -> String {
    "local".to_string()
}

fn default_disk_size() -> String {
    "100G".to_string()
}

/// Request shape for creating the nested hypervisor VM.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNestedConfig {
    /// Outer cluster node to create the VM on. Required.
    pub node: String,
    #[serde(default = "default_nested_name")]
    pub name: String,
    /// Explicit VM identifier; next free cluster id when absent.
    #[serde(default)]
    pub vmid: Option<u32>,
    /// Memory in MiB.
    #[serde(default = "default_nested_memory")]
    pub memory: u32,
    #[serde(default = "default_nested_cores")]
    pub cores: u32,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// Storage pool for the VM disk.
    #[serde(default = "default_disk_storage")]
    pub storage: String,
    /// Storage pool for installer/answer ISOs.
    #[serde(default = "default_iso_storage")]
    pub iso_storage: String,
    /// Disk size; a trailing `G` is accepted and stripped.
    #[serde(default = "default_disk_size")]
    pub disk_size: String,
    /// Explicit installer volid. Skips the media resolver entirely.
    #[serde(default)]
    pub iso: Option<String>,
    /// Root password baked into the answer image.
    #[serde(default)]
    pub root_password: Option<String>,
    /// Auto-start after creation.
    #[serde(default = "default_true")]
    pub start: bool,
}

impl Default for CreateNestedConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            name: default_nested_name(),
            vmid: None,
            memory: default_nested_memory(),
            cores: default_nested_cores(),
            bridge: default_bridge(),
            storage: default_disk_storage(),
            iso_storage: default_iso_storage(),
            disk_size: default_disk_size(),
            iso: None,
            root_password: None,
            start: true,
        }
    }
}

impl CreateNestedConfig {
    /// Answer document settings derived from this request.
    pub(crate) fn answer_settings(&self) -> AnswerSettings {
        let mut settings = AnswerSettings {
            fqdn: format!("{}.local", self.name),
            ..Default::default()
        };
        if let Some(password) = &self.root_password {
            settings.root_password = password.clone();
        }
        settings
    }
}

fn default_fleet_count() -> usize {
    12
}

fn default_nested_user() -> String {
    "root@pam".to_string()
}

fn default_nested_port() -> u16 {
    8006
}

fn default_vm_memory() -> u32 {
    512
}

fn default_vm_cores() -> u32 {
    1
}

/// Request shape for populating the guest fleet inside the nested cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFleetConfig {
    #[serde(default = "default_fleet_count")]
    pub count: usize,
    /// Naming theme; a random one when absent.
    #[serde(default)]
    pub theme: Option<String>,
    /// Nested cluster endpoint host. Required.
    pub nested_host: String,
    #[serde(default = "default_nested_user")]
    pub nested_user: String,
    /// Nested cluster password. Required.
    pub nested_password: String,
    #[serde(default = "default_nested_port")]
    pub nested_port: u16,
    /// Per-guest memory in MiB.
    #[serde(default = "default_vm_memory")]
    pub vm_memory: u32,
    #[serde(default = "default_vm_cores")]
    pub vm_cores: u32,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default = "default_disk_storage")]
    pub storage: String,
    /// Attach a cloud-init drive with guest/guest credentials and DHCP.
    #[serde(default = "default_true")]
    pub use_cloudinit: bool,
    #[serde(default = "default_true")]
    pub start_vms: bool,
}

impl Default for CreateFleetConfig {
    fn default() -> Self {
        Self {
            count: default_fleet_count(),
            theme: None,
            nested_host: String::new(),
            nested_user: default_nested_user(),
            nested_password: String::new(),
            nested_port: default_nested_port(),
            vm_memory: default_vm_memory(),
            vm_cores: default_vm_cores(),
            bridge: default_bridge(),
            storage: default_disk_storage(),
            use_cloudinit: true,
            start_vms: true,
        }
    }
}

/// Request shape for tearing down the nested hypervisor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestroyConfig {
    /// Outer cluster node hosting the nested VM. Required.
    pub node: String,
    /// Explicit target; falls back to the current nested record.
    #[serde(default)]
    pub vmid: Option<u32>,
}
