//! Firmware archives on the flashing device.
//!
//! One archive often supplies both the AP and the EC image, and several steps
//! read from it. Each remote path is downloaded and listed once per run; the
//! result is kept in an `ArchiveCache` owned by the firmware service.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::transport::DeviceConnection;

/// Checkout of flash_ec with access to its config files.
const PREFERRED_FLASH_EC: &str = "~/chromiumos/src/platform/ec/util/flash_ec";
const EC_REPO_URL: &str = "https://chromium.googlesource.com/chromiumos/platform/ec";

/// A downloaded archive and the names of its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub archive_path: String,
    pub archive_dir: String,
    pub members: BTreeSet<String>,
}

impl ArchiveMetadata {
    pub fn includes(&self, member: &str) -> bool {
        self.members.contains(member)
    }
}

/// Name of the temporary directory for `remote`.
///
/// Build archives are all called `firmware_from_source.tar.bz2`, so for those
/// the version directory above the file is used instead.
pub fn archive_subfolder(remote: &str) -> String {
    let mut parts = remote.rsplit('/');
    let base = parts.next().unwrap_or(remote);
    if base.starts_with("firmware_from_source") {
        if let Some(parent) = parts.next().filter(|p| !p.is_empty()) {
            return parent.to_string();
        }
    }
    base.to_string()
}

fn file_name(remote: &str) -> &str {
    remote.rsplit('/').next().unwrap_or(remote)
}

/// Download `remote` into a fresh temporary directory and list it.
pub async fn download_and_list(conn: &dyn DeviceConnection, remote: &str) -> Result<ArchiveMetadata> {
    let download_failed = |reason: String| ProvisionError::ArchiveDownloadFailed {
        path: remote.to_string(),
        reason,
    };

    let template = format!("fw-provision.XXXXXXXXX.{}", archive_subfolder(remote));
    let archive_dir = conn
        .run_cmd("mktemp", &["-d", "--tmpdir", template.as_str()])
        .await
        .map_err(|e| download_failed(format!("remote mktemp failed: {}", e)))?
        .trim_end_matches('\n')
        .to_string();
    let archive_path = format!("{}/{}", archive_dir, file_name(remote));

    if let Err(e) = conn.copy_data(remote, &archive_path).await {
        discard(conn, &archive_dir).await;
        return Err(download_failed(format!("copy failed: {}", e)));
    }

    let listing = match conn.run_cmd("tar", &["-tf", archive_path.as_str()]).await {
        Ok(listing) => listing,
        Err(e) => {
            discard(conn, &archive_dir).await;
            return Err(download_failed(format!("failed to list archive contents: {}", e)));
        }
    };
    let members = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    Ok(ArchiveMetadata {
        archive_path,
        archive_dir,
        members,
    })
}

async fn discard(conn: &dyn DeviceConnection, dir: &str) {
    if let Err(e) = conn.delete_directory(dir).await {
        warn!("[firmware] failed to delete {}: {}", dir, e);
    }
}

/// Downloaded archives of one run, keyed by remote path.
///
/// Owned by one service and only touched by its step chain, so it has no
/// lock. Entries live until the run ends.
#[derive(Debug, Default)]
pub struct ArchiveCache {
    entries: HashMap<String, ArchiveMetadata>,
}

impl ArchiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata of `remote`, downloading and listing it on first use.
    pub async fn get_or_download(
        &mut self,
        conn: &dyn DeviceConnection,
        remote: &str,
    ) -> Result<&ArchiveMetadata> {
        match self.entries.entry(remote.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let metadata = download_and_list(conn, remote).await?;
                info!(
                    "[firmware] downloaded {} to {}, {} files in archive",
                    remote,
                    metadata.archive_path,
                    metadata.members.len()
                );
                Ok(entry.insert(metadata))
            }
        }
    }

    pub fn remove(&mut self, remote: &str) -> Option<ArchiveMetadata> {
        self.entries.remove(remote)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete every archive directory, reporting all failures together.
    pub async fn delete_all(&mut self, conn: &dyn DeviceConnection) -> Result<()> {
        let mut failures = Vec::new();
        for (_, metadata) in self.entries.drain() {
            if let Err(e) = conn.delete_directory(&metadata.archive_dir).await {
                failures.push(format!("failed to delete {}: {}", metadata.archive_dir, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::UpdateFirmwareFailed(failures.join(". ")))
        }
    }
}

// ============================================================================
// Image candidates
// ============================================================================

/// AP image names, most specific first.
pub fn main_image_candidates(board: &str, model: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if !model.is_empty() {
        candidates.push(format!("image-{}.bin", model));
    }
    if !board.is_empty() {
        candidates.push(format!("image-{}.bin", board));
    }
    candidates.push("image.bin".to_string());
    candidates.push("bios.bin".to_string());
    candidates
}

pub fn ec_image_candidates(board: &str, model: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if !model.is_empty() {
        candidates.push(format!("{}/ec.bin", model));
    }
    if !board.is_empty() {
        candidates.push(format!("{}/ec.bin", board));
    }
    candidates.push("ec.bin".to_string());
    candidates
}

pub fn pd_image_candidates() -> Vec<String> {
    vec!["pd.bin".to_string()]
}

/// First of `candidates` present in the archive.
pub fn pick_candidate(
    metadata: &ArchiveMetadata,
    image: &'static str,
    candidates: Vec<String>,
) -> Result<String> {
    match candidates.iter().find(|c| metadata.includes(c)) {
        Some(found) => Ok(found.clone()),
        None => Err(ProvisionError::ImageCandidateNotFound {
            image,
            candidates,
            members: metadata.members.iter().cloned().collect(),
        }),
    }
}

/// Extract one member next to the archive, returning its path.
pub async fn extract(
    conn: &dyn DeviceConnection,
    metadata: &ArchiveMetadata,
    member: &str,
) -> Result<String> {
    // tar fails with "Read-only file system" when given --directory, so cd.
    conn.run_cmd(
        "cd",
        &[
            metadata.archive_dir.as_str(),
            "&&",
            "tar",
            "-xvf",
            metadata.archive_path.as_str(),
            member,
        ],
    )
    .await
    .map_err(|e| {
        ProvisionError::UpdateFirmwareFailed(format!("failed to extract {}: {}", member, e))
    })?;
    Ok(format!("{}/{}", metadata.archive_dir, member))
}

/// Pick and extract the image of kind `image` from `metadata`.
pub async fn pick_and_extract(
    conn: &dyn DeviceConnection,
    metadata: &ArchiveMetadata,
    image: &'static str,
    candidates: Vec<String>,
) -> Result<String> {
    let member = pick_candidate(metadata, image, candidates)?;
    extract(conn, metadata, &member).await
}

/// Path of a usable `flash_ec`, cloning the EC repository under `prefix` if
/// none is installed.
pub async fn locate_flash_ec(conn: &dyn DeviceConnection, prefix: &str) -> Result<String> {
    if let Ok(true) = conn.path_exists(PREFERRED_FLASH_EC).await {
        return Ok(PREFERRED_FLASH_EC.to_string());
    }

    if let Ok(found) = conn.run_cmd("which", &["flash_ec"]).await {
        let found = found.trim_end();
        if !found.is_empty() {
            return Ok(found.to_string());
        }
    }

    info!("[firmware] flash_ec not found, cloning {}", EC_REPO_URL);
    conn.run_cmd("cd", &[prefix, "&&", "git", "clone", EC_REPO_URL, "ec-repo"])
        .await
        .map_err(|e| {
            ProvisionError::UpdateFirmwareFailed(format!("failed to check out platform/ec: {}", e))
        })?;
    Ok(format!("{}/ec-repo/util/flash_ec", prefix))
}
