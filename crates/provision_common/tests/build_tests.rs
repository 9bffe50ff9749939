//! Picking the build to flash from a mirrored image archive.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use provision_common::blob::{Artifact, BucketIndex, DirBucket};
use provision_common::build::{resolve_flash_target, BuildSelector, BuildTarget};
use provision_common::transport::DeviceConnection;
use provision_common::{ErrorKind, Result};

/// DUT that only knows its lsb-release.
#[derive(Default)]
struct LabDut {
    lsb_release: String,
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl DeviceConnection for LabDut {
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let mut line = vec![cmd];
        line.extend_from_slice(args);
        self.log.lock().unwrap().push(line.join(" "));
        Ok(self.lsb_release.clone())
    }

    async fn restart(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "lab-dut".to_string()
    }
}

fn add_build(root: &Path, board: &str, version: &str, complete: bool) {
    let dir = root.join(format!("{}-release", board)).join(version);
    fs::create_dir_all(&dir).unwrap();
    for artifact in Artifact::required() {
        if complete || artifact != Artifact::Stateful {
            fs::write(dir.join(artifact.object_name()), b"payload").unwrap();
        }
    }
}

fn add_pointer(root: &Path, board: &str, name: &str, version: &str) {
    let dir = root.join(format!("{}-release", board));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), version).unwrap();
}

fn archive(root: &TempDir) -> Arc<dyn BucketIndex> {
    Arc::new(DirBucket::new(root.path()))
}

fn release(board: &str, version: &str) -> BuildTarget {
    BuildTarget {
        bucket: "chromeos-image-archive".to_string(),
        directory: format!("{}-release/{}", board, version),
    }
}

#[tokio::test]
async fn test_latest_main_on_detected_board() {
    let root = TempDir::new().unwrap();
    add_build(root.path(), "brya", "R121-15700.0.0", true);
    add_pointer(root.path(), "brya", "LATEST-main", "R121-15700.0.0\n");
    let dut = LabDut {
        lsb_release: "CHROMEOS_RELEASE_BOARD=brya-signed-mp-v4keys\n".to_string(),
        ..Default::default()
    };

    let target = resolve_flash_target(&dut, archive(&root), None, BuildSelector::Latest)
        .await
        .unwrap();

    assert_eq!(target, release("brya", "R121-15700.0.0"));
    assert_eq!(*dut.log.lock().unwrap(), vec!["cat /etc/lsb-release"]);
}

#[tokio::test]
async fn test_milestone_takes_highest_pointer() {
    let root = TempDir::new().unwrap();
    add_pointer(root.path(), "brya", "LATEST-release-R120-15662.B", "R120-15662.50.0");
    add_pointer(root.path(), "brya", "LATEST-release-R120-15662.C", "R120-15662.60.0");
    add_pointer(root.path(), "brya", "LATEST-release-R119-15633.B", "R119-15633.90.0");

    let target = resolve_flash_target(
        &LabDut::default(),
        archive(&root),
        Some("brya"),
        BuildSelector::Milestone(120),
    )
    .await
    .unwrap();

    assert_eq!(target, release("brya", "R120-15662.60.0"));
}

#[tokio::test]
async fn test_unbranched_milestone_uses_newest_complete_build() {
    let root = TempDir::new().unwrap();
    add_build(root.path(), "brya", "R122-15720.0.0", true);
    add_build(root.path(), "brya", "R122-15730.0.0", false);
    add_build(root.path(), "brya", "R121-15700.0.0", true);
    fs::create_dir_all(root.path().join("brya-release").join("R122-junk")).unwrap();

    let target = resolve_flash_target(
        &LabDut::default(),
        archive(&root),
        Some("brya"),
        BuildSelector::Milestone(122),
    )
    .await
    .unwrap();

    assert_eq!(target, release("brya", "R122-15720.0.0"));
}

#[tokio::test]
async fn test_version_prefix_prefers_branched_build() {
    let root = TempDir::new().unwrap();
    add_build(root.path(), "octopus", "R109-15237.0.0", true);
    add_build(root.path(), "octopus", "R109-15236.80.0", true);

    let target = resolve_flash_target(
        &LabDut::default(),
        archive(&root),
        Some("octopus"),
        BuildSelector::VersionPrefix("R109-".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(target, release("octopus", "R109-15236.80.0"));
}

#[tokio::test]
async fn test_gs_url_skips_board_detection() {
    let root = TempDir::new().unwrap();
    let dut = LabDut::default();

    let target = resolve_flash_target(
        &dut,
        archive(&root),
        None,
        BuildSelector::Url("gs://lab-mirror/brya-postsubmit/R121-15700.0.0-1".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(target.bucket, "lab-mirror");
    assert_eq!(target.directory, "brya-postsubmit/R121-15700.0.0-1");
    assert!(dut.log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_no_build_and_no_board_are_reported() {
    let root = TempDir::new().unwrap();
    add_build(root.path(), "brya", "R121-15700.0.0", false);

    let err = resolve_flash_target(
        &LabDut::default(),
        archive(&root),
        Some("brya"),
        BuildSelector::VersionPrefix("R121".to_string()),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildNotFound);

    let err = resolve_flash_target(&LabDut::default(), archive(&root), None, BuildSelector::Latest)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(err.to_string().contains("--board"));
}
