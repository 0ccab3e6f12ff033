//! Status register, shared records, and operation admission rules.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::client::HypervisorClient;

/// The single authoritative provisioning status.
///
/// Exactly one value is visible at any instant; all mutation happens under
/// the engine's state mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    Idle,
    CreatingNested,
    NestedCreated,
    CreatingVms,
    VmsCreated,
    Destroying,
    Error,
}

impl ProvisioningStatus {
    /// True while an operation is executing.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            ProvisioningStatus::CreatingNested
                | ProvisioningStatus::CreatingVms
                | ProvisioningStatus::Destroying
        )
    }

    /// Whether `op` may start from this status.
    ///
    /// Destroy is admissible from any status so a stuck or half-built
    /// nested hypervisor can always be torn down.
    pub(crate) fn permits(self, op: Operation) -> bool {
        match op {
            Operation::CreateNested => matches!(
                self,
                ProvisioningStatus::Idle
                    | ProvisioningStatus::NestedCreated
                    | ProvisioningStatus::VmsCreated
                    | ProvisioningStatus::Error
            ),
            Operation::CreateFleet => matches!(
                self,
                ProvisioningStatus::NestedCreated
                    | ProvisioningStatus::VmsCreated
                    | ProvisioningStatus::Error
            ),
            Operation::DestroyNested => true,
        }
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningStatus::Idle => "idle",
            ProvisioningStatus::CreatingNested => "creating_nested",
            ProvisioningStatus::NestedCreated => "nested_created",
            ProvisioningStatus::CreatingVms => "creating_vms",
            ProvisioningStatus::VmsCreated => "vms_created",
            ProvisioningStatus::Destroying => "destroying",
            ProvisioningStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// The three long-running operations the task runner executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateNested,
    CreateFleet,
    DestroyNested,
}

impl Operation {
    /// Status set synchronously when the operation is admitted.
    pub(crate) fn in_progress_status(self) -> ProvisioningStatus {
        match self {
            Operation::CreateNested => ProvisioningStatus::CreatingNested,
            Operation::CreateFleet => ProvisioningStatus::CreatingVms,
            Operation::DestroyNested => ProvisioningStatus::Destroying,
        }
    }
}

/// One active connection to the outer cluster. At most one exists at a time.
#[derive(Clone)]
pub struct Session {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub client: Arc<dyn HypervisorClient>,
}

/// Serializable view of the session, without the client handle.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            host: session.host.clone(),
            user: session.user.clone(),
            port: session.port,
        }
    }
}

/// Last observed run state of a guest VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRunState {
    Running,
    Stopped,
}

/// The single nested hypervisor instance currently provisioned.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NestedHypervisorRecord {
    pub vmid: u32,
    pub name: String,
}

/// One guest VM created inside the nested hypervisor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GuestVmRecord {
    pub vmid: u32,
    pub name: String,
    pub run_state: VmRunState,
}

/// All mutable engine state, owned by a single mutex.
pub(crate) struct EngineState {
    pub session: Option<Session>,
    pub status: ProvisioningStatus,
    pub nested: Option<NestedHypervisorRecord>,
    /// Replaced wholesale on each completed fleet creation.
    pub fleet: Vec<GuestVmRecord>,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            session: None,
            status: ProvisioningStatus::Idle,
            nested: None,
            fleet: Vec::new(),
        }
    }
}
