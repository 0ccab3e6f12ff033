//! Automated-install answer document and ISO authoring.
//!
//! The Proxmox automated installer searches removable media for a volume
//! labeled `proxmox-ais` carrying an `answer.toml`. Rendering the document
//! is pure; packaging it into an ISO goes through an injected subprocess
//! strategy so hosts without an ISO tool degrade instead of failing.

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::{ProxnestError, ProxnestResult};

/// Volume label the automated installer searches for at boot.
pub const ANSWER_VOLUME_LABEL: &str = "proxmox-ais";

/// Fixed answer image filename.
///
/// Re-running always finds and reuses the previous upload under this name,
/// so a changed password or hostname never reaches an existing image.
pub const ANSWER_ISO_FILENAME: &str = "proxnest-answer.iso";

/// Unattended-install settings rendered into `answer.toml`.
#[derive(Debug, Clone)]
pub struct AnswerSettings {
    pub fqdn: String,
    pub root_password: String,
    pub keyboard: String,
    pub country: String,
    pub timezone: String,
    pub mailto: String,
    pub filesystem: String,
    /// Installation target disk, e.g. `sda`.
    pub disk: String,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            fqdn: "nested-proxmox.local".to_string(),
            root_password: "proxnest".to_string(),
            keyboard: "en-us".to_string(),
            country: "us".to_string(),
            timezone: "UTC".to_string(),
            mailto: "root@localhost".to_string(),
            filesystem: "ext4".to_string(),
            disk: "sda".to_string(),
        }
    }
}

#[derive(Serialize)]
struct AnswerDocument<'a> {
    global: GlobalSection<'a>,
    network: NetworkSection<'a>,
    #[serde(rename = "disk-setup")]
    disk_setup: DiskSetupSection<'a>,
}

#[derive(Serialize)]
struct GlobalSection<'a> {
    keyboard: &'a str,
    country: &'a str,
    fqdn: &'a str,
    mailto: &'a str,
    timezone: &'a str,
    #[serde(rename = "root-password")]
    root_password: &'a str,
}

#[derive(Serialize)]
struct NetworkSection<'a> {
    source: &'a str,
}

#[derive(Serialize)]
struct DiskSetupSection<'a> {
    filesystem: &'a str,
    #[serde(rename = "disk-list")]
    disk_list: Vec<&'a str>,
}

/// Render the answer document as TOML.
pub fn render_answer(settings: &AnswerSettings) -> ProxnestResult<String> {
    let document = AnswerDocument {
        global: GlobalSection {
            keyboard: &settings.keyboard,
            country: &settings.country,
            fqdn: &settings.fqdn,
            mailto: &settings.mailto,
            timezone: &settings.timezone,
            root_password: &settings.root_password,
        },
        network: NetworkSection {
            source: "from-dhcp",
        },
        disk_setup: DiskSetupSection {
            filesystem: &settings.filesystem,
            disk_list: vec![&settings.disk],
        },
    };

    toml::to_string_pretty(&document)
        .map_err(|e| ProxnestError::Internal(format!("failed to render answer document: {}", e)))
}

/// Strategy for packaging a directory into a labeled filesystem image.
#[async_trait]
pub trait AnswerImageAuthoring: Send + Sync {
    /// Produce `output` from `source_dir` with the given volume label.
    async fn author(
        &self,
        output: &Path,
        volume_label: &str,
        source_dir: &Path,
    ) -> ProxnestResult<()>;
}

/// Authoring via an external ISO tool, trying well-known binaries in order.
pub struct IsoToolAuthoring {
    candidates: Vec<&'static str>,
}

impl Default for IsoToolAuthoring {
    fn default() -> Self {
        Self {
            candidates: vec!["genisoimage", "mkisofs", "xorriso"],
        }
    }
}

impl IsoToolAuthoring {
    #[cfg(test)]
    fn with_candidates(candidates: Vec<&'static str>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl AnswerImageAuthoring for IsoToolAuthoring {
    async fn author(
        &self,
        output: &Path,
        volume_label: &str,
        source_dir: &Path,
    ) -> ProxnestResult<()> {
        for tool in &self.candidates {
            let mut cmd = tokio::process::Command::new(tool);
            // xorriso only emits ISO9660 in mkisofs emulation mode.
            if *tool == "xorriso" {
                cmd.arg("-as").arg("mkisofs");
            }
            cmd.arg("-o")
                .arg(output)
                .arg("-V")
                .arg(volume_label)
                .arg("-r")
                .arg("-J")
                .arg(source_dir);

            let result = cmd.output().await;
            match result {
                Ok(out) if out.status.success() => {
                    tracing::debug!(tool, output = %output.display(), "answer image authored");
                    return Ok(());
                }
                Ok(out) => {
                    return Err(ProxnestError::Storage(format!(
                        "{} failed with {}: {}",
                        tool,
                        out.status,
                        String::from_utf8_lossy(&out.stderr).trim()
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::trace!(tool, "ISO tool not found, trying next candidate");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProxnestError::AuthoringToolUnavailable(format!(
            "none of {:?} found on this host",
            self.candidates
        )))
    }
}

/// Authoring variant for hosts known to lack an ISO tool.
///
/// Always reports `AuthoringToolUnavailable`, which the resolver maps to
/// degraded mode (no answer image, manual installation).
pub struct UnavailableAuthoring;

#[async_trait]
impl AnswerImageAuthoring for UnavailableAuthoring {
    async fn author(
        &self,
        _output: &Path,
        _volume_label: &str,
        _source_dir: &Path,
    ) -> ProxnestResult<()> {
        Err(ProxnestError::AuthoringToolUnavailable(
            "authoring disabled".to_string(),
        ))
    }
}
