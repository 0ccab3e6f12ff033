//! In-memory hypervisor doubles for engine and resolver tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AuthTicket, ContentEntry, HypervisorClient, HypervisorConnector, NodeInfo, StorageInfo,
    VmInfo, VmResource, VmSpec,
};
use crate::errors::{ProxnestError, ProxnestResult};

/// Scriptable `HypervisorClient` recording every mutation.
#[derive(Default)]
pub(crate) struct MockClient {
    pub nodes: Vec<NodeInfo>,
    pub vms: Vec<VmInfo>,
    pub storage: Vec<StorageInfo>,
    pub content: Vec<ContentEntry>,
    pub resources: Vec<VmResource>,
    /// `create_vm` fails for specs whose name is in this set.
    pub fail_create_names: HashSet<String>,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub created: Mutex<Vec<VmSpec>>,
    pub started: Mutex<Vec<u32>>,
    pub stopped: Mutex<Vec<u32>>,
    pub deleted: Mutex<Vec<(u32, bool)>>,
}

impl MockClient {
    pub fn with_nodes(names: &[&str]) -> Self {
        Self {
            nodes: names
                .iter()
                .map(|n| NodeInfo {
                    node: n.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl HypervisorClient for MockClient {
    async fn list_nodes(&self) -> ProxnestResult<Vec<NodeInfo>> {
        if self.nodes.is_empty() {
            return Err(ProxnestError::RemoteApi("no nodes".into()));
        }
        Ok(self.nodes.clone())
    }

    async fn list_vms(&self, _node: &str) -> ProxnestResult<Vec<VmInfo>> {
        Ok(self.vms.clone())
    }

    async fn list_storage(&self, _node: &str) -> ProxnestResult<Vec<StorageInfo>> {
        Ok(self.storage.clone())
    }

    async fn list_storage_content(
        &self,
        _node: &str,
        _storage: &str,
    ) -> ProxnestResult<Vec<ContentEntry>> {
        Ok(self.content.clone())
    }

    async fn create_vm(&self, _node: &str, spec: &VmSpec) -> ProxnestResult<()> {
        if self.fail_create_names.contains(&spec.name) {
            return Err(ProxnestError::RemoteApi(format!(
                "simulated create failure for {}",
                spec.name
            )));
        }
        self.created.lock().push(spec.clone());
        Ok(())
    }

    async fn start_vm(&self, _node: &str, vmid: u32) -> ProxnestResult<()> {
        if self.fail_start {
            return Err(ProxnestError::RemoteApi("simulated start failure".into()));
        }
        self.started.lock().push(vmid);
        Ok(())
    }

    async fn stop_vm(&self, _node: &str, vmid: u32) -> ProxnestResult<()> {
        if self.fail_stop {
            return Err(ProxnestError::RemoteApi("simulated stop failure".into()));
        }
        self.stopped.lock().push(vmid);
        Ok(())
    }

    async fn delete_vm(&self, _node: &str, vmid: u32, purge: bool) -> ProxnestResult<()> {
        self.deleted.lock().push((vmid, purge));
        Ok(())
    }

    async fn list_cluster_vm_resources(&self) -> ProxnestResult<Vec<VmResource>> {
        Ok(self.resources.clone())
    }

    fn endpoint(&self) -> String {
        "mock:8006".to_string()
    }

    fn auth_ticket(&self) -> Option<AuthTicket> {
        Some(AuthTicket {
            ticket: "mock-ticket".into(),
            csrf_token: "mock-csrf".into(),
        })
    }
}

/// Connector returning a pre-built client, or failing on demand.
pub(crate) struct MockConnector {
    pub client: Arc<MockClient>,
    pub fail: bool,
    /// Fail every connect attempt after this many successes.
    pub fail_after: Option<usize>,
    pub connects: Mutex<Vec<(String, String, u16)>>,
}

impl MockConnector {
    pub fn new(client: Arc<MockClient>) -> Self {
        Self {
            client,
            fail: false,
            fail_after: None,
            connects: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(client: Arc<MockClient>) -> Self {
        Self {
            fail: true,
            ..Self::new(client)
        }
    }

    pub fn failing_after(client: Arc<MockClient>, successes: usize) -> Self {
        Self {
            fail_after: Some(successes),
            ..Self::new(client)
        }
    }
}

#[async_trait]
impl HypervisorConnector for MockConnector {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        _password: &str,
        port: u16,
    ) -> ProxnestResult<Arc<dyn HypervisorClient>> {
        let attempts = {
            let mut connects = self.connects.lock();
            connects.push((host.to_string(), user.to_string(), port));
            connects.len()
        };
        if self.fail || self.fail_after.is_some_and(|n| attempts > n) {
            return Err(ProxnestError::RemoteApi(format!(
                "simulated connect failure to {}",
                host
            )));
        }
        Ok(self.client.clone())
    }
}
