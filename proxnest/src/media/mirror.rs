//! Installer image discovery against the public Proxmox mirror.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{ProxnestError, ProxnestResult};

/// Default mirror serving `proxmox-ve_*.iso` images.
pub const DEFAULT_MIRROR_URL: &str = "https://enterprise.proxmox.com/iso";

/// Versioned installer filenames: `proxmox-ve_<major>.<minor>-<release>.iso`.
static INSTALLER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"proxmox-ve_(\d+)\.(\d+)-(\d+)\.iso").expect("valid pattern"));

/// A resolved installer image on the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerImage {
    pub filename: String,
    pub url: String,
    /// (major, minor, release), the selection key.
    pub version: (u32, u32, u32),
}

/// Fetch the mirror's directory listing and pick the latest installer.
pub async fn discover_latest(
    http: &reqwest::Client,
    mirror_url: &str,
) -> ProxnestResult<InstallerImage> {
    let listing = http
        .get(mirror_url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    parse_latest(&listing, mirror_url)
}

/// Pick the highest-versioned installer filename out of a directory listing.
///
/// The listing is plain HTML; only the filename pattern matters, so no HTML
/// parsing beyond the regex scan.
pub fn parse_latest(listing: &str, mirror_url: &str) -> ProxnestResult<InstallerImage> {
    let mut best: Option<InstallerImage> = None;

    for caps in INSTALLER_PATTERN.captures_iter(listing) {
        let version = (
            caps[1].parse::<u32>().unwrap_or(0),
            caps[2].parse::<u32>().unwrap_or(0),
            caps[3].parse::<u32>().unwrap_or(0),
        );

        if best.as_ref().is_none_or(|b| version > b.version) {
            let filename = caps[0].to_string();
            best = Some(InstallerImage {
                url: format!("{}/{}", mirror_url.trim_end_matches('/'), filename),
                filename,
                version,
            });
        }
    }

    best.ok_or_else(|| {
        ProxnestError::NoCandidateFound(format!(
            "mirror listing at {} has no proxmox-ve installer images",
            mirror_url
        ))
    })
}
