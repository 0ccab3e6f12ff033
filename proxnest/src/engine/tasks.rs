//! Operation bodies executed by the task runner.
//!
//! Each body runs on its own spawned task, owns no locks across awaits, and
//! reports back through an [`Outcome`]. The engine applies the outcome (or
//! the error) as the operation's single terminal state transition.

use crate::client::{HypervisorClient, VmSpec};
use crate::engine::config::{CreateFleetConfig, CreateNestedConfig, DestroyConfig};
use crate::engine::state::{GuestVmRecord, Session, VmRunState};
use crate::engine::EngineInner;
use crate::errors::{ProxnestError, ProxnestResult};
use crate::media::{MediaAsset, MediaKind};
use crate::naming;

/// First vmid assigned inside the nested cluster.
const FLEET_BASE_VMID: u32 = 100;

/// Fallback vmid on an empty outer cluster.
const FIRST_CLUSTER_VMID: u32 = 100;

/// What a completed operation changes in the shared records.
pub(crate) enum Outcome {
    NestedCreated { vmid: u32, name: String },
    FleetCreated { vms: Vec<GuestVmRecord> },
    Destroyed,
}

/// Create the nested hypervisor VM on the outer cluster.
pub(crate) async fn run_create_nested(
    inner: &EngineInner,
    session: Session,
    cfg: CreateNestedConfig,
) -> ProxnestResult<Outcome> {
    let client = session.client;
    inner.log.push("Starting nested Proxmox creation...");

    let vmid = match cfg.vmid {
        Some(vmid) => vmid,
        None => next_free_vmid(client.as_ref()).await?,
    };
    inner.log.push(format!("Using VMID: {}", vmid));

    let (installer, answer) = match &cfg.iso {
        // Explicit volid: the operator already staged an installer.
        Some(volid) => (
            MediaAsset {
                volid: volid.clone(),
                kind: MediaKind::Installer,
            },
            None,
        ),
        None => {
            let installer = inner
                .media
                .ensure_installer(client.as_ref(), &cfg.node, &cfg.iso_storage)
                .await?;
            let answer = inner
                .media
                .ensure_answer_image(
                    client.as_ref(),
                    &cfg.node,
                    &cfg.iso_storage,
                    &cfg.answer_settings(),
                )
                .await?;
            (installer, answer)
        }
    };

    // LVM pools take a bare number of gigabytes.
    let disk_size = cfg.disk_size.trim_end_matches(['G', 'g']);

    let mut spec = VmSpec {
        vmid,
        name: cfg.name.clone(),
        memory: cfg.memory,
        cores: cfg.cores,
        sockets: 1,
        // cpu=host passes through VMX/SVM so the guest can itself virtualize.
        cpu: Some("host".to_string()),
        net0: format!("virtio,bridge={}", cfg.bridge),
        scsihw: "virtio-scsi-single".to_string(),
        agent: Some("enabled=1".to_string()),
        scsi0: Some(format!("{}:{}", cfg.storage, disk_size)),
        ide0: Some(format!("{},media=cdrom", installer.volid)),
        // Installer first, then disk.
        boot: Some("order=ide0;scsi0".to_string()),
        ide2: Some(format!("{}:cloudinit", cfg.storage)),
        ciuser: Some("guest".to_string()),
        cipassword: Some("guest".to_string()),
        ipconfig0: Some("ip=dhcp".to_string()),
        ..Default::default()
    };
    if let Some(answer) = &answer {
        spec.ide1 = Some(format!("{},media=cdrom", answer.volid));
    }

    inner.log.push(format!("Creating VM: {}", cfg.name));
    client.create_vm(&cfg.node, &spec).await?;
    inner
        .log
        .push(format!("Nested Proxmox VM created with VMID {}", vmid));

    if cfg.start {
        inner.log.push("Waiting for VM to be ready...");
        tokio::time::sleep(inner.options.creation_grace).await;

        inner.log.push("Starting nested Proxmox VM...");
        match client.start_vm(&cfg.node, vmid).await {
            Ok(()) => inner.log.push("Nested Proxmox VM started successfully"),
            // The VM object exists either way; a failed auto-start is not
            // an operation failure.
            Err(e) => {
                inner
                    .log
                    .push(format!("Warning: Could not auto-start VM: {}", e));
                inner.log.push("Please start the VM manually");
            }
        }
    }

    inner.log.push("Nested Proxmox creation complete!");
    Ok(Outcome::NestedCreated {
        vmid,
        name: cfg.name,
    })
}

/// Max in-use identifier across the cluster, plus one.
async fn next_free_vmid(client: &dyn HypervisorClient) -> ProxnestResult<u32> {
    let resources = client.list_cluster_vm_resources().await?;
    Ok(resources
        .iter()
        .map(|r| r.vmid)
        .max()
        .map(|max| max + 1)
        .unwrap_or(FIRST_CLUSTER_VMID))
}

/// Populate the guest fleet inside the nested cluster.
///
/// Per-VM failures are logged and skipped; the operation always completes
/// with the list of guests that did come up, even if that list is empty.
pub(crate) async fn run_create_fleet(
    inner: &EngineInner,
    cfg: CreateFleetConfig,
) -> ProxnestResult<Outcome> {
    let names = naming::generate_names(cfg.count, cfg.theme.as_deref());
    inner.log.push(format!(
        "Creating {} VMs with theme: {}",
        cfg.count,
        cfg.theme.as_deref().unwrap_or("random")
    ));

    inner.log.push(format!(
        "Connecting to nested Proxmox at {}...",
        cfg.nested_host
    ));
    let nested = inner
        .connector
        .connect(
            &cfg.nested_host,
            &cfg.nested_user,
            &cfg.nested_password,
            cfg.nested_port,
        )
        .await?;

    let nodes = nested.list_nodes().await?;
    let node = nodes
        .first()
        .ok_or_else(|| ProxnestError::RemoteApi("no nodes found in nested Proxmox".to_string()))?
        .node
        .clone();
    inner.log.push(format!("Using node: {}", node));

    let mut created = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let vmid = FLEET_BASE_VMID + i as u32;
        inner
            .log
            .push(format!("Creating VM: {} (VMID: {})", name, vmid));

        match create_one_guest(nested.as_ref(), &node, vmid, name, &cfg).await {
            Ok(run_state) => {
                created.push(GuestVmRecord {
                    vmid,
                    name: name.clone(),
                    run_state,
                });
                inner.log.push(format!("VM {} created successfully", name));
            }
            Err(e) => {
                inner
                    .log
                    .push(format!("Error creating VM {}: {}", name, e));
            }
        }
    }

    inner
        .log
        .push(format!("Created {} VMs successfully!", created.len()));
    Ok(Outcome::FleetCreated { vms: created })
}

async fn create_one_guest(
    client: &dyn HypervisorClient,
    node: &str,
    vmid: u32,
    name: &str,
    cfg: &CreateFleetConfig,
) -> ProxnestResult<VmRunState> {
    let mut spec = VmSpec {
        vmid,
        name: name.to_string(),
        memory: cfg.vm_memory,
        cores: cfg.vm_cores,
        sockets: 1,
        net0: format!("virtio,bridge={}", cfg.bridge),
        scsihw: "virtio-scsi-single".to_string(),
        serial0: Some("socket".to_string()),
        vga: Some("serial0".to_string()),
        scsi0: Some(format!("{}:8", cfg.storage)),
        ..Default::default()
    };

    if cfg.use_cloudinit {
        spec.ide2 = Some(format!("{}:cloudinit", cfg.storage));
        spec.ciuser = Some("guest".to_string());
        spec.cipassword = Some("guest".to_string());
        spec.ipconfig0 = Some("ip=dhcp".to_string());
        spec.sshkeys = Some(String::new());
    }

    client.create_vm(node, &spec).await?;

    if cfg.start_vms {
        client.start_vm(node, vmid).await?;
        Ok(VmRunState::Running)
    } else {
        Ok(VmRunState::Stopped)
    }
}

/// Tear down the nested hypervisor VM with storage purge.
pub(crate) async fn run_destroy(
    inner: &EngineInner,
    session: Session,
    cfg: DestroyConfig,
    vmid: u32,
) -> ProxnestResult<Outcome> {
    let client = session.client;
    inner
        .log
        .push(format!("Destroying nested Proxmox VM {}...", vmid));

    inner.log.push("Stopping VM...");
    match client.stop_vm(&cfg.node, vmid).await {
        Ok(()) => tokio::time::sleep(inner.options.stop_grace).await,
        // Already stopped is fine; deletion proceeds either way.
        Err(e) => inner
            .log
            .push(format!("Stop failed (VM might already be stopped): {}", e)),
    }

    inner.log.push("Deleting VM...");
    client.delete_vm(&cfg.node, vmid, true).await?;

    inner.log.push("Nested Proxmox destroyed successfully!");
    Ok(Outcome::Destroyed)
}
