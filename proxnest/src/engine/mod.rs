//! Provisioning engine: status state machine plus task runner.
//!
//! `ProvisionEngine` is the single entry point the thin API layer talks to.
//! All mutable state (session, status register, nested/fleet records) lives
//! behind one mutex inside `EngineInner`; operations run on spawned tasks
//! and report back through `finish_operation`, which applies the terminal
//! transition exactly once.

pub(crate) mod config;
pub(crate) mod state;
mod tasks;

pub use config::{CreateFleetConfig, CreateNestedConfig, DestroyConfig, EngineOptions};
pub use state::{
    GuestVmRecord, NestedHypervisorRecord, Operation, ProvisioningStatus, SessionInfo, VmRunState,
};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::client::{ContentEntry, HypervisorClient, HypervisorConnector, NodeInfo, StorageInfo};
use crate::errors::{ProxnestError, ProxnestResult};
use crate::logsink::{LogEntry, LogSink};
use crate::media::{AnswerImageAuthoring, IsoToolAuthoring, MediaResolver};
use crate::naming;
use state::{EngineState, Session};
use tasks::Outcome;

/// Log entries included in a status snapshot.
const SNAPSHOT_LOG_TAIL: usize = 20;

/// Point-in-time view of the engine for polling observers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub connected: bool,
    pub session: Option<SessionInfo>,
    pub status: ProvisioningStatus,
    pub nested: Option<NestedHypervisorRecord>,
    pub fleet: Vec<GuestVmRecord>,
    /// Most recent log entries, oldest first.
    pub logs: Vec<LogEntry>,
}

/// A template VM somewhere on the outer cluster.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub vmid: u32,
    pub name: String,
    pub node: String,
}

pub(crate) struct EngineInner {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) log: LogSink,
    pub(crate) connector: Arc<dyn HypervisorConnector>,
    pub(crate) media: MediaResolver,
    pub(crate) options: EngineOptions,
    status_tx: watch::Sender<ProvisioningStatus>,
}

impl EngineInner {
    /// Update the status register and publish the change.
    ///
    /// Takes the state guard so status never moves without the lock held.
    fn set_status(&self, st: &mut EngineState, status: ProvisioningStatus) {
        tracing::debug!(from = %st.status, to = %status, "status transition");
        st.status = status;
        self.status_tx.send_replace(status);
    }

    /// Apply an operation's terminal transition. Called exactly once per
    /// started operation, as its very last effect.
    fn finish_operation(&self, op: Operation, result: ProxnestResult<Outcome>) {
        let mut st = self.state.lock();
        match result {
            Ok(Outcome::NestedCreated { vmid, name }) => {
                st.nested = Some(NestedHypervisorRecord { vmid, name });
                self.set_status(&mut st, ProvisioningStatus::NestedCreated);
            }
            Ok(Outcome::FleetCreated { vms }) => {
                st.fleet = vms;
                self.set_status(&mut st, ProvisioningStatus::VmsCreated);
            }
            Ok(Outcome::Destroyed) => {
                st.nested = None;
                st.fleet.clear();
                self.set_status(&mut st, ProvisioningStatus::Idle);
            }
            Err(e) => {
                let what = match op {
                    Operation::CreateNested => "creating nested Proxmox",
                    Operation::CreateFleet => "creating VMs",
                    Operation::DestroyNested => "destroying nested Proxmox",
                };
                tracing::error!(operation = ?op, error = %e, "operation failed");
                self.log.push(format!("Error {}: {}", what, e));
                self.set_status(&mut st, ProvisioningStatus::Error);
            }
        }
    }
}

/// The provisioning orchestration engine.
///
/// Cheaply cloneable; all clones share the same state. Operation starters
/// return an acknowledgement immediately; results are observed by polling
/// [`snapshot`](Self::snapshot)/[`logs`](Self::logs) or awaiting
/// [`watch_status`](Self::watch_status).
#[derive(Clone)]
pub struct ProvisionEngine {
    inner: Arc<EngineInner>,
}

impl ProvisionEngine {
    /// Engine with default options and subprocess ISO authoring.
    pub fn new(connector: Arc<dyn HypervisorConnector>) -> ProxnestResult<Self> {
        Self::with_options(connector, EngineOptions::default())
    }

    pub fn with_options(
        connector: Arc<dyn HypervisorConnector>,
        options: EngineOptions,
    ) -> ProxnestResult<Self> {
        Self::with_authoring(connector, options, Arc::new(IsoToolAuthoring::default()))
    }

    /// Engine with an injected answer-image authoring strategy.
    pub fn with_authoring(
        connector: Arc<dyn HypervisorConnector>,
        options: EngineOptions,
        authoring: Arc<dyn AnswerImageAuthoring>,
    ) -> ProxnestResult<Self> {
        let log = LogSink::new();
        let media = MediaResolver::new(options.mirror_url.clone(), log.clone(), authoring)?;
        let (status_tx, _) = watch::channel(ProvisioningStatus::Idle);

        Ok(Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::new()),
                log,
                connector,
                media,
                options,
                status_tx,
            }),
        })
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    /// Connect to the outer cluster, replacing any previous session.
    ///
    /// Validates the connection by listing nodes; returns their names.
    pub async fn connect(
        &self,
        host: &str,
        user: &str,
        password: &str,
        port: u16,
    ) -> ProxnestResult<Vec<String>> {
        self.inner
            .log
            .push(format!("Connecting to Proxmox at {}:{}...", host, port));

        let connected = async {
            let client = self
                .inner
                .connector
                .connect(host, user, password, port)
                .await?;
            let nodes = client.list_nodes().await?;
            Ok::<_, ProxnestError>((client, nodes))
        }
        .await;

        let (client, nodes) = match connected {
            Ok(ok) => ok,
            Err(e) => {
                self.inner.log.push(format!("Connection failed: {}", e));
                return Err(e);
            }
        };

        {
            let mut st = self.inner.state.lock();
            st.session = Some(Session {
                host: host.to_string(),
                user: user.to_string(),
                port,
                client,
            });
        }

        self.inner.log.push(format!(
            "Connected successfully! Found {} node(s)",
            nodes.len()
        ));
        Ok(nodes.into_iter().map(|n| n.node).collect())
    }

    /// Drop the active session, if any.
    pub fn disconnect(&self) {
        self.inner.state.lock().session = None;
        self.inner.log.push("Disconnected from Proxmox server");
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    pub fn status(&self) -> ProvisioningStatus {
        self.inner.state.lock().status
    }

    /// Receiver that observes every status transition, including the
    /// terminal one of each operation.
    pub fn watch_status(&self) -> watch::Receiver<ProvisioningStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let st = self.inner.state.lock();
        EngineSnapshot {
            connected: st.session.is_some(),
            session: st.session.as_ref().map(SessionInfo::from),
            status: st.status,
            nested: st.nested.clone(),
            fleet: st.fleet.clone(),
            logs: self.inner.log.tail(SNAPSHOT_LOG_TAIL),
        }
    }

    /// The full operational log, oldest first.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.log.entries()
    }

    pub fn clear_logs(&self) {
        self.inner.log.clear();
    }

    // ========================================================================
    // CLUSTER PASS-THROUGHS (for the thin API layer)
    // ========================================================================

    pub async fn list_nodes(&self) -> ProxnestResult<Vec<NodeInfo>> {
        self.session_client()?.list_nodes().await
    }

    /// Template VMs across all outer-cluster nodes.
    pub async fn list_templates(&self) -> ProxnestResult<Vec<TemplateInfo>> {
        let client = self.session_client()?;
        let mut templates = Vec::new();
        for node in client.list_nodes().await? {
            for vm in client.list_vms(&node.node).await? {
                if vm.template {
                    templates.push(TemplateInfo {
                        vmid: vm.vmid,
                        name: vm.name.unwrap_or_else(|| format!("VM {}", vm.vmid)),
                        node: node.node.clone(),
                    });
                }
            }
        }
        Ok(templates)
    }

    pub async fn list_storage(&self, node: &str) -> ProxnestResult<Vec<StorageInfo>> {
        self.session_client()?.list_storage(node).await
    }

    /// ISO images on a storage pool.
    pub async fn list_isos(&self, node: &str, storage: &str) -> ProxnestResult<Vec<ContentEntry>> {
        let content = self
            .session_client()?
            .list_storage_content(node, storage)
            .await?;
        Ok(content
            .into_iter()
            .filter(|entry| entry.content == "iso")
            .collect())
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Start creating the nested hypervisor. Returns as soon as the
    /// operation is admitted; progress is observed via status and logs.
    pub fn start_create_nested(&self, cfg: CreateNestedConfig) -> ProxnestResult<()> {
        let session = {
            let mut st = self.inner.state.lock();
            let session = st.session.clone().ok_or(ProxnestError::NotConnected)?;
            if !st.status.permits(Operation::CreateNested) {
                return Err(ProxnestError::OperationConflict(format!(
                    "cannot create nested hypervisor while status is {}",
                    st.status
                )));
            }
            if cfg.node.is_empty() {
                return Err(ProxnestError::PreconditionMissing("node".to_string()));
            }
            self.inner
                .set_status(&mut st, Operation::CreateNested.in_progress_status());
            session
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tasks::run_create_nested(&inner, session, cfg).await;
            inner.finish_operation(Operation::CreateNested, result);
        });
        Ok(())
    }

    /// Start populating the guest fleet inside the nested cluster.
    pub fn start_create_fleet(&self, cfg: CreateFleetConfig) -> ProxnestResult<()> {
        {
            let mut st = self.inner.state.lock();
            if !st.status.permits(Operation::CreateFleet) {
                return Err(ProxnestError::OperationConflict(format!(
                    "nested hypervisor must be created first (status is {})",
                    st.status
                )));
            }
            if cfg.nested_host.is_empty() {
                return Err(ProxnestError::PreconditionMissing("nested_host".to_string()));
            }
            if cfg.nested_password.is_empty() {
                return Err(ProxnestError::PreconditionMissing(
                    "nested_password".to_string(),
                ));
            }
            self.inner
                .set_status(&mut st, Operation::CreateFleet.in_progress_status());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tasks::run_create_fleet(&inner, cfg).await;
            inner.finish_operation(Operation::CreateFleet, result);
        });
        Ok(())
    }

    /// Start tearing down the nested hypervisor (admissible from any
    /// status, so a stuck deployment can always be destroyed).
    pub fn start_destroy(&self, cfg: DestroyConfig) -> ProxnestResult<()> {
        let (session, vmid) = {
            let mut st = self.inner.state.lock();
            let session = st.session.clone().ok_or(ProxnestError::NotConnected)?;
            if cfg.node.is_empty() {
                return Err(ProxnestError::PreconditionMissing("node".to_string()));
            }
            let vmid = cfg
                .vmid
                .or_else(|| st.nested.as_ref().map(|n| n.vmid))
                .ok_or_else(|| {
                    ProxnestError::PreconditionMissing(
                        "vmid (no nested hypervisor on record)".to_string(),
                    )
                })?;
            self.inner
                .set_status(&mut st, Operation::DestroyNested.in_progress_status());
            (session, vmid)
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tasks::run_destroy(&inner, session, cfg, vmid).await;
            inner.finish_operation(Operation::DestroyNested, result);
        });
        Ok(())
    }

    /// Available naming themes with their five-word previews.
    pub fn themes(&self) -> Vec<(&'static str, &'static [&'static str])> {
        naming::theme_names()
            .into_iter()
            .filter_map(|name| naming::theme_preview(name).map(|preview| (name, preview)))
            .collect()
    }

    fn session_client(&self) -> ProxnestResult<Arc<dyn HypervisorClient>> {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| Arc::clone(&s.client))
            .ok_or(ProxnestError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockClient, MockConnector};
    use crate::client::{ContentEntry, VmInfo, VmResource};
    use crate::media::UnavailableAuthoring;
    use std::collections::HashSet;
    use std::time::Duration;

    fn test_options() -> EngineOptions {
        EngineOptions {
            mirror_url: "https://mirror.invalid/iso".to_string(),
            creation_grace: Duration::ZERO,
            stop_grace: Duration::ZERO,
        }
    }

    fn engine_with(client: Arc<MockClient>) -> ProvisionEngine {
        ProvisionEngine::with_authoring(
            Arc::new(MockConnector::new(client)),
            test_options(),
            Arc::new(UnavailableAuthoring),
        )
        .unwrap()
    }

    async fn connect(engine: &ProvisionEngine) -> Vec<String> {
        engine.connect("pve.lab", "root@pam", "pw", 8006).await.unwrap()
    }

    /// Wait for the running operation to reach its terminal status.
    async fn wait_terminal(engine: &ProvisionEngine) -> ProvisioningStatus {
        let mut rx = engine.watch_status();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| !s.is_in_progress()),
        )
        .await
        .expect("operation timed out")
        .expect("status channel closed");
        *status
    }

    fn log_lines(engine: &ProvisionEngine) -> Vec<String> {
        engine.logs().into_iter().map(|e| e.message).collect()
    }

    // ------------------------------------------------------------------
    // session
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_lists_nodes_and_stores_session() {
        let client = Arc::new(MockClient::with_nodes(&["pve1", "pve2"]));
        let engine = engine_with(client);

        let nodes = connect(&engine).await;
        assert_eq!(nodes, vec!["pve1", "pve2"]);

        let snap = engine.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.session.as_ref().unwrap().host, "pve.lab");
        assert_eq!(snap.status, ProvisioningStatus::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_session() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = ProvisionEngine::with_authoring(
            Arc::new(MockConnector::failing(client)),
            test_options(),
            Arc::new(UnavailableAuthoring),
        )
        .unwrap();

        let err = engine.connect("pve.lab", "root@pam", "pw", 8006).await;
        assert!(err.is_err());
        assert!(!engine.snapshot().connected);
        assert!(log_lines(&engine)
            .iter()
            .any(|l| l.starts_with("Connection failed")));
    }

    #[tokio::test]
    async fn test_disconnect_clears_session() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client);
        connect(&engine).await;

        engine.disconnect();
        assert!(!engine.snapshot().connected);
        assert!(matches!(
            engine.list_nodes().await,
            Err(ProxnestError::NotConnected)
        ));
    }

    // ------------------------------------------------------------------
    // admission
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_nested_requires_session() {
        let engine = engine_with(Arc::new(MockClient::with_nodes(&["pve1"])));
        let err = engine
            .start_create_nested(CreateNestedConfig {
                node: "pve1".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ProxnestError::NotConnected));
        assert_eq!(engine.status(), ProvisioningStatus::Idle);
    }

    #[tokio::test]
    async fn test_create_nested_requires_node() {
        let engine = engine_with(Arc::new(MockClient::with_nodes(&["pve1"])));
        connect(&engine).await;

        let err = engine
            .start_create_nested(CreateNestedConfig::default())
            .unwrap_err();
        assert!(matches!(err, ProxnestError::PreconditionMissing(_)));
        assert_eq!(engine.status(), ProvisioningStatus::Idle);
    }

    #[tokio::test]
    async fn test_fleet_rejected_before_nested_exists() {
        let engine = engine_with(Arc::new(MockClient::with_nodes(&["pve1"])));
        connect(&engine).await;

        let err = engine
            .start_create_fleet(CreateFleetConfig {
                nested_host: "10.0.0.5".into(),
                nested_password: "pw".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ProxnestError::OperationConflict(_)));
        assert_eq!(engine.status(), ProvisioningStatus::Idle);
    }

    #[tokio::test]
    async fn test_conflicting_start_rejected_and_state_unchanged() {
        // Script a client that blocks forever on create so the first
        // operation stays in flight.
        struct Blocking;
        #[async_trait::async_trait]
        impl crate::client::HypervisorClient for Blocking {
            async fn list_nodes(&self) -> ProxnestResult<Vec<NodeInfo>> {
                Ok(vec![NodeInfo {
                    node: "pve1".into(),
                }])
            }
            async fn list_vms(&self, _: &str) -> ProxnestResult<Vec<VmInfo>> {
                Ok(vec![])
            }
            async fn list_storage(&self, _: &str) -> ProxnestResult<Vec<StorageInfo>> {
                Ok(vec![])
            }
            async fn list_storage_content(
                &self,
                _: &str,
                _: &str,
            ) -> ProxnestResult<Vec<ContentEntry>> {
                Ok(vec![])
            }
            async fn create_vm(
                &self,
                _: &str,
                _: &crate::client::VmSpec,
            ) -> ProxnestResult<()> {
                futures::future::pending().await
            }
            async fn start_vm(&self, _: &str, _: u32) -> ProxnestResult<()> {
                Ok(())
            }
            async fn stop_vm(&self, _: &str, _: u32) -> ProxnestResult<()> {
                Ok(())
            }
            async fn delete_vm(&self, _: &str, _: u32, _: bool) -> ProxnestResult<()> {
                Ok(())
            }
            async fn list_cluster_vm_resources(&self) -> ProxnestResult<Vec<VmResource>> {
                Ok(vec![])
            }
            fn endpoint(&self) -> String {
                "mock:8006".into()
            }
            fn auth_ticket(&self) -> Option<crate::client::AuthTicket> {
                None
            }
        }

        struct BlockingConnector;
        #[async_trait::async_trait]
        impl HypervisorConnector for BlockingConnector {
            async fn connect(
                &self,
                _: &str,
                _: &str,
                _: &str,
                _: u16,
            ) -> ProxnestResult<Arc<dyn HypervisorClient>> {
                Ok(Arc::new(Blocking))
            }
        }

        let engine = ProvisionEngine::with_authoring(
            Arc::new(BlockingConnector),
            test_options(),
            Arc::new(UnavailableAuthoring),
        )
        .unwrap();
        connect(&engine).await;

        let cfg = CreateNestedConfig {
            node: "pve1".into(),
            iso: Some("local:iso/x.iso".into()),
            ..Default::default()
        };
        engine.start_create_nested(cfg.clone()).unwrap();
        assert_eq!(engine.status(), ProvisioningStatus::CreatingNested);

        let err = engine.start_create_nested(cfg).unwrap_err();
        assert!(matches!(err, ProxnestError::OperationConflict(_)));
        // In-flight operation untouched.
        assert_eq!(engine.status(), ProvisioningStatus::CreatingNested);
    }

    // ------------------------------------------------------------------
    // create nested
    // ------------------------------------------------------------------

    fn nested_cfg() -> CreateNestedConfig {
        CreateNestedConfig {
            node: "pve1".into(),
            iso: Some("local:iso/proxmox-ve_8.1-2.iso".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_nested_success() {
        let client = Arc::new(MockClient {
            resources: vec![VmResource { vmid: 100 }, VmResource { vmid: 105 }],
            ..MockClient::with_nodes(&["pve1"])
        });
        let engine = engine_with(client.clone());
        connect(&engine).await;

        engine.start_create_nested(nested_cfg()).unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::NestedCreated);

        let snap = engine.snapshot();
        let nested = snap.nested.unwrap();
        // max(100, 105) + 1
        assert_eq!(nested.vmid, 106);
        assert_eq!(nested.name, "nested-proxmox");

        let created = client.created.lock();
        assert_eq!(created.len(), 1);
        let spec = &created[0];
        assert_eq!(spec.cpu.as_deref(), Some("host"));
        assert_eq!(spec.boot.as_deref(), Some("order=ide0;scsi0"));
        assert_eq!(
            spec.ide0.as_deref(),
            Some("local:iso/proxmox-ve_8.1-2.iso,media=cdrom")
        );
        assert_eq!(spec.scsi0.as_deref(), Some("local-lvm:100"));
        assert_eq!(client.started.lock().as_slice(), &[106]);
    }

    #[tokio::test]
    async fn test_create_nested_on_empty_cluster_uses_first_vmid() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client.clone());
        connect(&engine).await;

        engine.start_create_nested(nested_cfg()).unwrap();
        wait_terminal(&engine).await;
        assert_eq!(engine.snapshot().nested.unwrap().vmid, 100);
    }

    #[tokio::test]
    async fn test_create_nested_start_failure_is_nonfatal() {
        let client = Arc::new(MockClient {
            fail_start: true,
            ..MockClient::with_nodes(&["pve1"])
        });
        let engine = engine_with(client);
        connect(&engine).await;

        engine.start_create_nested(nested_cfg()).unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::NestedCreated);
        assert!(log_lines(&engine)
            .iter()
            .any(|l| l.contains("Could not auto-start")));
    }

    #[tokio::test]
    async fn test_create_nested_remote_failure_sets_error_status() {
        let client = Arc::new(MockClient {
            fail_create_names: HashSet::from(["nested-proxmox".to_string()]),
            ..MockClient::with_nodes(&["pve1"])
        });
        let engine = engine_with(client);
        connect(&engine).await;

        engine.start_create_nested(nested_cfg()).unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::Error);
        assert!(engine.snapshot().nested.is_none());
        assert!(log_lines(&engine)
            .iter()
            .any(|l| l.starts_with("Error creating nested Proxmox")));
    }

    #[tokio::test]
    async fn test_create_nested_without_autostart() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client.clone());
        connect(&engine).await;

        engine
            .start_create_nested(CreateNestedConfig {
                start: false,
                ..nested_cfg()
            })
            .unwrap();
        wait_terminal(&engine).await;
        assert!(client.started.lock().is_empty());
    }

    // ------------------------------------------------------------------
    // fleet
    // ------------------------------------------------------------------

    /// Drive the engine to NestedCreated so fleet admission passes.
    async fn provision_nested(engine: &ProvisionEngine) {
        engine.start_create_nested(nested_cfg()).unwrap();
        assert_eq!(wait_terminal(engine).await, ProvisioningStatus::NestedCreated);
    }

    fn fleet_cfg() -> CreateFleetConfig {
        CreateFleetConfig {
            nested_host: "10.0.0.50".into(),
            nested_password: "pw".into(),
            theme: Some("databases".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fleet_partial_failures_keep_successes() {
        // 3 of 12 creations fail; the rest must survive.
        let client = Arc::new(MockClient {
            fail_create_names: HashSet::from([
                "mysql-03".to_string(),
                "redis-04".to_string(),
                "couch-09".to_string(),
            ]),
            ..MockClient::with_nodes(&["pve1"])
        });
        let engine = engine_with(client.clone());
        connect(&engine).await;
        provision_nested(&engine).await;

        engine.start_create_fleet(fleet_cfg()).unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::VmsCreated);

        let snap = engine.snapshot();
        assert_eq!(snap.fleet.len(), 9);
        assert!(snap.fleet.iter().all(|vm| vm.run_state == VmRunState::Running));
        assert!(!snap.fleet.iter().any(|vm| vm.name == "mysql-03"));

        let error_lines: Vec<_> = log_lines(&engine)
            .into_iter()
            .filter(|l| l.starts_with("Error creating VM"))
            .collect();
        assert_eq!(error_lines.len(), 3);
        assert!(error_lines.iter().any(|l| l.contains("mysql-03")));
        assert!(error_lines.iter().any(|l| l.contains("redis-04")));
        assert!(error_lines.iter().any(|l| l.contains("couch-09")));

        // Sequential vmids from 100, skipping nothing for failures.
        assert_eq!(snap.fleet[0].vmid, 100);
        assert_eq!(snap.fleet[0].name, "mongo-01");
    }

    #[tokio::test]
    async fn test_fleet_connect_failure_sets_error() {
        // The outer connect succeeds; the fleet's connect to the nested
        // endpoint (the second attempt overall) fails.
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = ProvisionEngine::with_authoring(
            Arc::new(MockConnector::failing_after(client, 1)),
            test_options(),
            Arc::new(UnavailableAuthoring),
        )
        .unwrap();
        connect(&engine).await;
        provision_nested(&engine).await;

        engine.start_create_fleet(fleet_cfg()).unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::Error);
        assert!(engine.snapshot().fleet.is_empty());
        assert!(log_lines(&engine)
            .iter()
            .any(|l| l.starts_with("Error creating VMs")));
    }

    #[tokio::test]
    async fn test_fleet_respects_start_vms_false() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client.clone());
        connect(&engine).await;
        provision_nested(&engine).await;

        engine
            .start_create_fleet(CreateFleetConfig {
                start_vms: false,
                count: 3,
                ..fleet_cfg()
            })
            .unwrap();
        wait_terminal(&engine).await;

        let snap = engine.snapshot();
        assert_eq!(snap.fleet.len(), 3);
        assert!(snap.fleet.iter().all(|vm| vm.run_state == VmRunState::Stopped));
    }

    #[tokio::test]
    async fn test_fleet_replaced_wholesale_on_rerun() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client);
        connect(&engine).await;
        provision_nested(&engine).await;

        engine
            .start_create_fleet(CreateFleetConfig {
                count: 5,
                ..fleet_cfg()
            })
            .unwrap();
        wait_terminal(&engine).await;
        assert_eq!(engine.snapshot().fleet.len(), 5);

        engine
            .start_create_fleet(CreateFleetConfig {
                count: 2,
                ..fleet_cfg()
            })
            .unwrap();
        wait_terminal(&engine).await;
        // Most recent attempt only, not a merge.
        assert_eq!(engine.snapshot().fleet.len(), 2);
    }

    // ------------------------------------------------------------------
    // destroy
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_destroy_clears_records_and_returns_to_idle() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client.clone());
        connect(&engine).await;
        provision_nested(&engine).await;

        engine
            .start_create_fleet(CreateFleetConfig {
                count: 2,
                ..fleet_cfg()
            })
            .unwrap();
        wait_terminal(&engine).await;

        engine
            .start_destroy(DestroyConfig {
                node: "pve1".into(),
                vmid: None,
            })
            .unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::Idle);

        let snap = engine.snapshot();
        assert!(snap.nested.is_none());
        assert!(snap.fleet.is_empty());
        // Stopped, then deleted with purge, using the vmid from the record.
        assert_eq!(client.stopped.lock().as_slice(), &[100]);
        assert_eq!(client.deleted.lock().as_slice(), &[(100, true)]);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_stop_failure() {
        let client = Arc::new(MockClient {
            fail_stop: true,
            ..MockClient::with_nodes(&["pve1"])
        });
        let engine = engine_with(client.clone());
        connect(&engine).await;
        provision_nested(&engine).await;

        engine
            .start_destroy(DestroyConfig {
                node: "pve1".into(),
                vmid: None,
            })
            .unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::Idle);
        assert!(log_lines(&engine)
            .iter()
            .any(|l| l.starts_with("Stop failed")));
        assert_eq!(client.deleted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_requires_target() {
        let engine = engine_with(Arc::new(MockClient::with_nodes(&["pve1"])));
        connect(&engine).await;

        // No explicit vmid and no nested record.
        let err = engine
            .start_destroy(DestroyConfig {
                node: "pve1".into(),
                vmid: None,
            })
            .unwrap_err();
        assert!(matches!(err, ProxnestError::PreconditionMissing(_)));
        assert_eq!(engine.status(), ProvisioningStatus::Idle);
    }

    #[tokio::test]
    async fn test_destroy_with_explicit_vmid_needs_no_record() {
        let client = Arc::new(MockClient::with_nodes(&["pve1"]));
        let engine = engine_with(client.clone());
        connect(&engine).await;

        engine
            .start_destroy(DestroyConfig {
                node: "pve1".into(),
                vmid: Some(123),
            })
            .unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::Idle);
        assert_eq!(client.deleted.lock().as_slice(), &[(123, true)]);
    }

    // ------------------------------------------------------------------
    // retry from error
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_error_status_admits_retry() {
        let client = Arc::new(MockClient {
            fail_create_names: HashSet::from(["nested-proxmox".to_string()]),
            ..MockClient::with_nodes(&["pve1"])
        });
        let engine = engine_with(client);
        connect(&engine).await;

        engine.start_create_nested(nested_cfg()).unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::Error);

        // Retry under a name the mock accepts.
        engine
            .start_create_nested(CreateNestedConfig {
                name: "nested-take-two".into(),
                ..nested_cfg()
            })
            .unwrap();
        assert_eq!(wait_terminal(&engine).await, ProvisioningStatus::NestedCreated);
        assert_eq!(engine.snapshot().nested.unwrap().name, "nested-take-two");
    }
}
