//! Provisioning engine for nested Proxmox hypervisors.
//!
//! Drives a two-level deployment: a nested hypervisor VM created on an
//! outer Proxmox cluster, then a fleet of guest VMs created inside that
//! nested cluster. One [`ProvisionEngine`] owns all state; long-running
//! operations are fire-and-forget tasks observed through the status
//! register, the bounded operational log, and a status watch channel.
//!
//! The hypervisor RPC layer is not part of this crate: the engine consumes
//! it through the [`client::HypervisorConnector`] / [`client::HypervisorClient`]
//! seams, which an embedding binary implements over its RPC client of
//! choice. The media resolver's direct storage upload is the one place this
//! crate speaks HTTPS to a hypervisor itself.

pub mod client;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod logsink;
pub mod media;
pub mod naming;

pub use engine::{
    CreateFleetConfig, CreateNestedConfig, DestroyConfig, EngineOptions, EngineSnapshot,
    GuestVmRecord, NestedHypervisorRecord, ProvisionEngine, ProvisioningStatus, SessionInfo,
    TemplateInfo, VmRunState,
};
pub use errors::{ProxnestError, ProxnestResult};
pub use logsink::{LogEntry, LogSink};
