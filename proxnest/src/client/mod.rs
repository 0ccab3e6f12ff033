//! Hypervisor client adapter interface.
//!
//! The engine consumes a Proxmox-style control endpoint through these traits
//! and never talks wire formats itself; an RPC client crate (or a test
//! double) provides the implementation. The one exception is the media
//! resolver's direct-upload path, which needs the session's authentication
//! ticket pair exposed here.

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::ProxnestResult;

/// One cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
}

/// A VM as reported by a node listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub vmid: u32,
    pub name: Option<String>,
    /// True when the VM is a template. On the wire this is `0`/`1`.
    #[serde(default, deserialize_with = "flag_from_int")]
    pub template: bool,
}

fn flag_from_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(u8::deserialize(deserializer)? != 0)
}

/// A storage pool visible on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage: String,
    /// Comma-separated content kinds the pool accepts (`iso,vztmpl,...`).
    pub content: Option<String>,
}

/// One entry of a storage pool's content listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEntry {
    /// Volume identifier, e.g. `local:iso/proxmox-ve_8.1-2.iso`.
    pub volid: String,
    /// Content kind (`iso`, `images`, ...).
    pub content: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A cluster-wide VM resource entry; only the identifier matters here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResource {
    pub vmid: u32,
}

/// Authentication ticket pair for the direct-upload path.
#[derive(Debug, Clone)]
pub struct AuthTicket {
    /// `PVEAuthCookie` value.
    pub ticket: String,
    /// `CSRFPreventionToken` header value.
    pub csrf_token: String,
}

/// VM definition submitted to `create_vm`.
///
/// Field names follow the Proxmox API so a client implementation can
/// serialize the spec as-is. Unset options are omitted from the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmSpec {
    pub vmid: u32,
    pub name: String,
    /// Memory in MiB.
    pub memory: u32,
    pub cores: u32,
    pub sockets: u32,
    /// CPU model; `host` passes through virtualization extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    pub net0: String,
    pub scsihw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scsi0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vga: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciuser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipassword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipconfig0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sshkeys: Option<String>,
}

/// Typed interface over a Proxmox-style control endpoint.
///
/// Implementations must be cheap to share (`Arc<dyn HypervisorClient>`) and
/// internally handle session renewal; the engine treats every error as a
/// `RemoteApi` failure.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn list_nodes(&self) -> ProxnestResult<Vec<NodeInfo>>;

    async fn list_vms(&self, node: &str) -> ProxnestResult<Vec<VmInfo>>;

    async fn list_storage(&self, node: &str) -> ProxnestResult<Vec<StorageInfo>>;

    async fn list_storage_content(
        &self,
        node: &str,
        storage: &str,
    ) -> ProxnestResult<Vec<ContentEntry>>;

    async fn create_vm(&self, node: &str, spec: &VmSpec) -> ProxnestResult<()>;

    async fn start_vm(&self, node: &str, vmid: u32) -> ProxnestResult<()>;

    async fn stop_vm(&self, node: &str, vmid: u32) -> ProxnestResult<()>;

    /// Delete a VM, optionally purging its disks from storage.
    async fn delete_vm(&self, node: &str, vmid: u32, purge: bool) -> ProxnestResult<()>;

    /// Cluster-wide VM resources, used for free-vmid computation.
    async fn list_cluster_vm_resources(&self) -> ProxnestResult<Vec<VmResource>>;

    /// `host:port` base of the endpoint, for direct HTTPS calls.
    fn endpoint(&self) -> String;

    /// Current ticket pair, if the client authenticated with one.
    fn auth_ticket(&self) -> Option<AuthTicket>;
}

/// Factory for client sessions.
///
/// The engine connects twice with different credentials: once to the outer
/// cluster and once to the nested cluster living inside a guest, so the
/// connector is a first-class seam rather than a constructor.
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        password: &str,
        port: u16,
    ) -> ProxnestResult<Arc<dyn HypervisorClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_listing_tolerates_integer_template_flag() {
        // Proxmox reports template as 0/1 and omits it for plain VMs.
        let raw = r#"[{"vmid": 100, "name": "web-01", "status": "running"},
                      {"vmid": 900, "name": "debian-tmpl", "template": 1}]"#;
        let vms: Vec<VmInfo> = serde_json::from_str(raw).unwrap();
        assert!(!vms[0].template);
        assert!(vms[1].template);
        assert_eq!(vms[1].name.as_deref(), Some("debian-tmpl"));
    }

    #[test]
    fn test_vm_spec_omits_unset_options() {
        let spec = VmSpec {
            vmid: 100,
            name: "nested-proxmox".into(),
            memory: 16384,
            cores: 4,
            sockets: 1,
            net0: "virtio,bridge=vmbr0".into(),
            scsihw: "virtio-scsi-single".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["vmid"], 100);
        assert!(json.get("cpu").is_none());
        assert!(json.get("ide0").is_none());
        assert!(json.get("cipassword").is_none());
    }
}
