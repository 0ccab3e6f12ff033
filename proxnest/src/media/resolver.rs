//! Idempotent ensure-or-create-or-reuse logic for boot media.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::client::HypervisorClient;
use crate::errors::{ProxnestError, ProxnestResult};
use crate::logsink::LogSink;
use crate::media::answer::{
    render_answer, AnswerImageAuthoring, AnswerSettings, ANSWER_ISO_FILENAME, ANSWER_VOLUME_LABEL,
};
use crate::media::mirror;

/// Log a download progress line every this many bytes.
const PROGRESS_INTERVAL: u64 = 256 * 1024 * 1024;

/// What a media asset boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Installer,
    AnswerFile,
}

/// A boot image resolved onto cluster storage.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    /// Volume identifier, e.g. `local:iso/proxmox-ve_8.1-2.iso`.
    pub volid: String,
    pub kind: MediaKind,
}

/// Materializes installer and answer images onto a storage pool.
///
/// Network and storage interactions are idempotent: an asset already present
/// on the pool is reused, and all local temporary files live in scoped
/// directories released on every exit path.
pub struct MediaResolver {
    http: reqwest::Client,
    mirror_url: String,
    log: LogSink,
    authoring: Arc<dyn AnswerImageAuthoring>,
}

impl MediaResolver {
    pub fn new(
        mirror_url: String,
        log: LogSink,
        authoring: Arc<dyn AnswerImageAuthoring>,
    ) -> ProxnestResult<Self> {
        // Hypervisor endpoints ship self-signed certificates; the direct
        // upload path talks to them without verification, matching the
        // RPC client's behavior.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            http,
            mirror_url,
            log,
            authoring,
        })
    }

    /// Ensure the latest installer ISO from the mirror exists on `storage`.
    pub async fn ensure_installer(
        &self,
        client: &dyn HypervisorClient,
        node: &str,
        storage: &str,
    ) -> ProxnestResult<MediaAsset> {
        let image = mirror::discover_latest(&self.http, &self.mirror_url).await?;
        self.log
            .push(format!("Latest installer image: {}", image.filename));

        if let Some(volid) = find_existing(client, node, storage, &image.filename).await? {
            self.log
                .push(format!("Installer already present as {}, reusing", volid));
            return Ok(MediaAsset {
                volid,
                kind: MediaKind::Installer,
            });
        }

        // Scoped temp dir: deleted when this function returns, on any path.
        let scratch = tempfile::tempdir()?;
        let local = scratch.path().join(&image.filename);

        self.log
            .push(format!("Downloading {} from mirror...", image.filename));
        let bytes = self.download(&image.url, &local).await?;
        self.log.push(format!(
            "Download complete ({} MiB), uploading to {}:{}...",
            bytes / (1024 * 1024),
            node,
            storage
        ));

        self.upload(client, node, storage, &local).await?;
        self.log.push(format!("Installer uploaded to {}", storage));

        Ok(MediaAsset {
            volid: format!("{}:iso/{}", storage, image.filename),
            kind: MediaKind::Installer,
        })
    }

    /// Ensure an automated-install answer image exists on `storage`.
    ///
    /// Returns `Ok(None)` in degraded mode (no ISO authoring tool on this
    /// host); the caller falls back to manual installation. The fixed
    /// filename means a previously uploaded image is always reused, even if
    /// `settings` changed since it was built.
    pub async fn ensure_answer_image(
        &self,
        client: &dyn HypervisorClient,
        node: &str,
        storage: &str,
        settings: &AnswerSettings,
    ) -> ProxnestResult<Option<MediaAsset>> {
        if let Some(volid) = find_existing(client, node, storage, ANSWER_ISO_FILENAME).await? {
            self.log
                .push(format!("Answer image already present as {}, reusing", volid));
            return Ok(Some(MediaAsset {
                volid,
                kind: MediaKind::AnswerFile,
            }));
        }

        let scratch = tempfile::tempdir()?;
        let source_dir = scratch.path().join("answer");
        tokio::fs::create_dir(&source_dir).await?;
        tokio::fs::write(source_dir.join("answer.toml"), render_answer(settings)?).await?;

        let output = scratch.path().join(ANSWER_ISO_FILENAME);
        match self
            .authoring
            .author(&output, ANSWER_VOLUME_LABEL, &source_dir)
            .await
        {
            Ok(()) => {}
            Err(ProxnestError::AuthoringToolUnavailable(msg)) => {
                self.log.push(format!(
                    "Warning: no ISO authoring tool ({}); skipping answer image, installer will need manual input",
                    msg
                ));
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        self.log.push("Answer image built, uploading...".to_string());
        self.upload(client, node, storage, &output).await?;

        Ok(Some(MediaAsset {
            volid: format!("{}:iso/{}", storage, ANSWER_ISO_FILENAME),
            kind: MediaKind::AnswerFile,
        }))
    }

    /// Stream a remote file to `dest`, logging progress at coarse intervals.
    async fn download(&self, url: &str, dest: &Path) -> ProxnestResult<u64> {
        let response = self.http.get(url).send().await?.error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        let mut next_mark = PROGRESS_INTERVAL;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
            if total >= next_mark {
                self.log
                    .push(format!("Downloaded {} MiB...", total / (1024 * 1024)));
                next_mark += PROGRESS_INTERVAL;
            }
        }
        file.flush().await?;

        Ok(total)
    }

    /// Direct HTTPS multipart upload to the storage pool.
    ///
    /// Goes around the RPC client because ISO uploads use the raw storage
    /// upload endpoint, authenticated with the session's ticket pair.
    async fn upload(
        &self,
        client: &dyn HypervisorClient,
        node: &str,
        storage: &str,
        path: &Path,
    ) -> ProxnestResult<()> {
        let ticket = client.auth_ticket().ok_or_else(|| {
            ProxnestError::Internal("session exposes no auth ticket for direct upload".to_string())
        })?;

        let url = format!(
            "https://{}/api2/json/nodes/{}/storage/{}/upload",
            client.endpoint(),
            node,
            storage
        );

        let form = reqwest::multipart::Form::new()
            .text("content", "iso")
            .file("filename", path)
            .await?;

        let response = self
            .http
            .post(&url)
            .header("Cookie", format!("PVEAuthCookie={}", ticket.ticket))
            .header("CSRFPreventionToken", ticket.csrf_token)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProxnestError::Storage(format!(
                "upload to {} failed with status {}",
                url,
                response.status()
            )));
        }

        Ok(())
    }
}

/// Look up `filename` in the pool's content listing.
///
/// Present means any entry's volume identifier *contains* the filename.
/// This is a substring match, not an exact one: a release-number prefix
/// collision can false-positive. Preserved as-is; see the tests.
pub(crate) async fn find_existing(
    client: &dyn HypervisorClient,
    node: &str,
    storage: &str,
    filename: &str,
) -> ProxnestResult<Option<String>> {
    let content = client.list_storage_content(node, storage).await?;
    Ok(content
        .into_iter()
        .find(|entry| entry.volid.contains(filename))
        .map(|entry| entry.volid))
}
