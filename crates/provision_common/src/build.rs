//! Choosing the build to flash.
//!
//! Release builds live in `gs://chromeos-image-archive/<board>-release/<version>/`.
//! A caller either names a build directory with a `gs://` URL or asks for the
//! newest build of a board, optionally narrowed to a milestone or a version
//! prefix. The board itself can be read off the DUT.

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::blob::{Artifact, BucketIndex};
use crate::error::{ProvisionError, Result};
use crate::transport::DeviceConnection;

pub const IMAGE_ARCHIVE_BUCKET: &str = "chromeos-image-archive";
pub const LSB_RELEASE: &str = "/etc/lsb-release";

/// Pointer file naming the newest build of the main branch.
const LATEST_MAIN: &str = "LATEST-main";

// ============================================================================
// Versions
// ============================================================================

/// `R<milestone>-<build>.<branch>.<patch>`, e.g. `R109-15236.80.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub milestone: u32,
    pub build: u32,
    pub branch: u32,
    pub patch: u32,
}

impl Version {
    pub fn is_branched(&self) -> bool {
        self.branch != 0
    }
}

fn number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for Version {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProvisionError::InvalidRequest(format!("cannot parse {:?} as a version", s));
        let rest = s.strip_prefix('R').ok_or_else(invalid)?;
        let (milestone, rest) = rest.split_once('-').ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('.').collect();
        let [build, branch, patch] = parts.as_slice() else {
            return Err(invalid());
        };
        Ok(Version {
            milestone: number(milestone).ok_or_else(invalid)?,
            build: number(build).ok_or_else(invalid)?,
            branch: number(branch).ok_or_else(invalid)?,
            patch: number(patch).ok_or_else(invalid)?,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.milestone
            .cmp(&other.milestone)
            // Within a milestone any branched build is newer than trunk,
            // R109-15236.80.0 beats R109-15237.0.0.
            .then(self.is_branched().cmp(&other.is_branched()))
            .then(self.build.cmp(&other.build))
            .then(self.branch.cmp(&other.branch))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R{}-{}.{}.{}",
            self.milestone, self.build, self.branch, self.patch
        )
    }
}

// ============================================================================
// Targets
// ============================================================================

/// A build directory in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub bucket: String,
    pub directory: String,
}

impl BuildTarget {
    fn release(board: &str, version: Version) -> Self {
        Self {
            bucket: IMAGE_ARCHIVE_BUCKET.to_string(),
            directory: format!("{}-release/{}", board, version),
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.directory)
    }
}

/// Which build to flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSelector {
    /// `gs://<bucket>/<dir>`
    Url(String),
    /// Newest build whose version starts with this, e.g. `R120-15662`
    VersionPrefix(String),
    /// Newest build of a milestone
    Milestone(u32),
    /// Newest build of the main branch
    Latest,
}

impl BuildSelector {
    pub fn needs_board(&self) -> bool {
        !matches!(self, BuildSelector::Url(_))
    }
}

/// Split `gs://bucket/some/dir` into bucket and directory.
pub fn parse_gs_url(url: &str) -> Result<BuildTarget> {
    let invalid =
        |why: &str| ProvisionError::InvalidRequest(format!("bad build URL {}: {}", url, why));
    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if parsed.scheme() != "gs" {
        return Err(invalid("expected gs://<bucket>/<dir>"));
    }
    let bucket = parsed.host_str().unwrap_or_default();
    let directory = parsed.path().trim_matches('/');
    if bucket.is_empty() || directory.is_empty() {
        return Err(invalid("expected gs://<bucket>/<dir>"));
    }
    Ok(BuildTarget {
        bucket: bucket.to_string(),
        directory: directory.to_string(),
    })
}

// ============================================================================
// Lookup
// ============================================================================

fn not_found(what: String, e: io::Error) -> ProvisionError {
    ProvisionError::BuildNotFound(format!("{}: {}", what, e))
}

fn missing_artifact(index: &dyn BucketIndex, board: &str, version: Version) -> Option<String> {
    for artifact in Artifact::required() {
        let name = format!("{}-release/{}/{}", board, version, artifact.object_name());
        if let Err(e) = index.stat(&name) {
            return Some(format!("{}: {}", index.describe(&name), e));
        }
    }
    None
}

/// Newest complete build of `board` whose version starts with `prefix`.
pub fn latest_with_prefix(index: &dyn BucketIndex, board: &str, prefix: &str) -> Result<Version> {
    let full_prefix = format!("{}-release/{}", board, prefix);
    let names = index
        .list(&full_prefix)
        .map_err(|e| not_found(format!("cannot list {}*", index.describe(&full_prefix)), e))?;

    let mut versions: Vec<Version> = names
        .iter()
        .filter_map(|name| name.strip_suffix('/'))
        .filter_map(|dir| {
            let base = dir.rsplit('/').next().unwrap_or(dir);
            match base.parse() {
                Ok(version) => Some(version),
                Err(e) => {
                    debug!("[build] ignoring {}: {}", dir, e);
                    None
                }
            }
        })
        .collect();
    versions.sort_by(|a, b| b.cmp(a));

    for version in versions {
        match missing_artifact(index, board, version) {
            None => return Ok(version),
            Some(why) => warn!("[build] ignoring {}: {}", version, why),
        }
    }
    Err(ProvisionError::BuildNotFound(format!(
        "no complete builds under {}*",
        index.describe(&full_prefix)
    )))
}

/// Highest version named by the `LATEST` pointer file `pointer`, or by every
/// pointer file starting with it.
pub fn latest_from_pointers(
    index: &dyn BucketIndex,
    board: &str,
    pointer: &str,
    is_prefix: bool,
) -> Result<Version> {
    let name = format!("{}-release/{}", board, pointer);
    let files = if is_prefix {
        index
            .list(&name)
            .map_err(|e| not_found(format!("cannot list {}*", index.describe(&name)), e))?
            .into_iter()
            .filter(|n| !n.ends_with('/'))
            .collect()
    } else {
        vec![name.clone()]
    };

    let mut newest: Option<Version> = None;
    for file in files {
        let content = index
            .read_to_string(&file)
            .map_err(|e| not_found(format!("cannot read {}", index.describe(&file)), e))?;
        let version: Version = content.trim().parse().map_err(|e| {
            ProvisionError::BuildNotFound(format!("{} is not a version pointer: {}", index.describe(&file), e))
        })?;
        newest = newest.max(Some(version));
    }
    newest.ok_or_else(|| {
        ProvisionError::BuildNotFound(format!("no LATEST file under {}*", index.describe(&name)))
    })
}

/// Newest build of `milestone`. Milestones that have not branched yet have no
/// pointer file, so fall back to the directory listing.
pub fn latest_for_milestone(index: &dyn BucketIndex, board: &str, milestone: u32) -> Result<Version> {
    let pointer = format!("LATEST-release-R{}-", milestone);
    match latest_from_pointers(index, board, &pointer, true) {
        Ok(version) => Ok(version),
        Err(e) => {
            info!("[build] {}, maybe R{} has not branched yet, trying prefix match", e, milestone);
            latest_with_prefix(index, board, &format!("R{}-", milestone))
        }
    }
}

/// Resolve `selector` for `board` against the image archive.
pub fn resolve_build(
    index: &dyn BucketIndex,
    board: &str,
    selector: &BuildSelector,
) -> Result<BuildTarget> {
    let version = match selector {
        BuildSelector::Url(url) => return parse_gs_url(url),
        BuildSelector::VersionPrefix(prefix) => latest_with_prefix(index, board, prefix)?,
        BuildSelector::Milestone(milestone) => latest_for_milestone(index, board, *milestone)?,
        BuildSelector::Latest => latest_from_pointers(index, board, LATEST_MAIN, false)?,
    };
    Ok(BuildTarget::release(board, version))
}

// ============================================================================
// DUT detection
// ============================================================================

/// Board named by `/etc/lsb-release`, without any signing suffix.
pub fn parse_lsb_board(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("CHROMEOS_RELEASE_BOARD="))
        .map(|value| value.trim().trim_matches('"'))
        .map(|value| value.split_once("-signed-").map_or(value, |(board, _)| board))
        .filter(|board| !board.is_empty())
        .map(str::to_string)
}

/// Read the board of the image the DUT is running.
pub async fn detect_board(dut: &dyn DeviceConnection) -> Result<String> {
    let hint = "specify --board or --gs to skip board detection";
    let content = dut.run_cmd("cat", &[LSB_RELEASE]).await.map_err(|e| {
        ProvisionError::InvalidRequest(format!(
            "cannot detect board of {}: {}. {}",
            dut.describe(),
            e,
            hint
        ))
    })?;
    parse_lsb_board(&content).ok_or_else(|| {
        ProvisionError::InvalidRequest(format!(
            "{} has no board in {}. {}",
            dut.describe(),
            LSB_RELEASE,
            hint
        ))
    })
}

/// Work out which build to flash onto `dut`.
///
/// `board` overrides detection. A `gs://` selector needs no board at all.
pub async fn resolve_flash_target(
    dut: &dyn DeviceConnection,
    index: Arc<dyn BucketIndex>,
    board: Option<&str>,
    selector: BuildSelector,
) -> Result<BuildTarget> {
    if !selector.needs_board() {
        return resolve_build(index.as_ref(), "", &selector);
    }
    let board = match board {
        Some(board) => board.to_string(),
        None => {
            let board = detect_board(dut).await?;
            info!("[build] DUT board: {}", board);
            board
        }
    };

    let resolved =
        tokio::task::spawn_blocking(move || resolve_build(index.as_ref(), &board, &selector)).await;
    match resolved {
        Ok(result) => result,
        Err(e) => Err(ProvisionError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("build lookup did not finish: {}", e),
        ))),
    }
}
