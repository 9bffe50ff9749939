//! Firmware provisioning against scripted hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use provision_common::config::ReconnectConfig;
use provision_common::firmware::archive::ArchiveCache;
use provision_common::firmware::{
    provision, Connection, FirmwareRequest, FirmwareService, FirmwareStep,
};
use provision_common::transport::{DeviceConnection, ServoHost};
use provision_common::{ErrorKind, ProvisionError, Result};

const ARCHIVE: &str = "gs://chromeos-image-archive/foo/R120-1.0.0/firmware_from_source.tar.bz2";
const DEADLINE: Duration = Duration::from_secs(60);

/// Host answering the commands firmware provisioning sends.
#[derive(Default)]
struct ScriptedHost {
    log: Mutex<Vec<String>>,
    listing: String,
    servod: HashMap<&'static str, &'static str>,
    failing: Vec<&'static str>,
    temp_dirs: AtomicUsize,
    restarts: AtomicUsize,
}

impl ScriptedHost {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

#[async_trait]
impl DeviceConnection for ScriptedHost {
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let mut line = vec![cmd];
        line.extend_from_slice(args);
        let line = line.join(" ");
        self.log.lock().unwrap().push(line.clone());

        if self.failing.iter().any(|p| line.starts_with(p)) {
            return Err(ProvisionError::CommandFailed {
                host: "scripted".to_string(),
                command: line,
                stderr: "scripted failure".to_string(),
                code: Some(1),
            });
        }

        match cmd {
            "mktemp" => {
                let n = self.temp_dirs.fetch_add(1, Ordering::SeqCst);
                Ok(format!("/tmp/fw-provision.{}\n", n))
            }
            "tar" if args.first() == Some(&"-tf") => Ok(self.listing.clone()),
            "[" => Ok("1".to_string()),
            "dut-control" => {
                let control = args.last().copied().unwrap_or_default();
                if control.contains(':') {
                    return Ok(String::new());
                }
                match self.servod.get(control) {
                    Some(value) => Ok(format!("{}:{}\n", control, value)),
                    None => Err(ProvisionError::CommandFailed {
                        host: "servod".to_string(),
                        command: control.to_string(),
                        stderr: "no such control".to_string(),
                        code: Some(1),
                    }),
                }
            }
            _ => Ok(String::new()),
        }
    }

    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("restart".to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn quick_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        retries: 2,
        attempt_timeout_secs: 1,
        pause_secs: 0,
        servo_reboot_wait_secs: 0,
    }
}

fn micro_servod(ec_chip: &'static str) -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("servo_type", "servo_v4p1_with_servo_micro_and_ccd_cr50"),
        ("servo_micro_serialname", "MICRO1"),
        ("ccd_serialname", "CCD1"),
        ("ec_chip", ec_chip),
    ])
}

fn connection(host: &Arc<ScriptedHost>) -> Connection {
    host.clone()
}

// ============================================================================
// Archive cache
// ============================================================================

#[tokio::test]
async fn test_archive_requested_twice_is_downloaded_once() {
    let host = ScriptedHost {
        listing: "image.bin\nec.bin\n".to_string(),
        ..Default::default()
    };
    let mut cache = ArchiveCache::new();

    let first = cache.get_or_download(&host, ARCHIVE).await.unwrap().clone();
    let second = cache.get_or_download(&host, ARCHIVE).await.unwrap().clone();

    assert_eq!(first, second);
    assert_eq!(first.archive_dir, "/tmp/fw-provision.0");
    assert_eq!(first.archive_path, "/tmp/fw-provision.0/firmware_from_source.tar.bz2");
    assert!(first.includes("ec.bin"));
    assert_eq!(host.count("mktemp"), 1);
    assert_eq!(host.count("gsutil cp"), 1);
    assert_eq!(host.count("tar -tf"), 1);
    assert!(host.log()[0].ends_with("R120-1.0.0"), "{:?}", host.log());
}

#[tokio::test]
async fn test_failed_listing_removes_directory() {
    let host = ScriptedHost {
        failing: vec!["tar -tf"],
        ..Default::default()
    };
    let mut cache = ArchiveCache::new();

    let err = cache.get_or_download(&host, ARCHIVE).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ArchiveDownloadFailed);
    assert!(cache.is_empty());
    assert_eq!(host.count("rm -rf /tmp/fw-provision.0"), 1);
}

// ============================================================================
// Over SSH
// ============================================================================

#[tokio::test]
async fn test_ro_and_rw_over_ssh_share_one_archive() {
    let dut = Arc::new(ScriptedHost {
        listing: "image-foo.bin\nimage-bar.bin\nbar/ec.bin\nec.bin\n".to_string(),
        ..Default::default()
    });
    let request = FirmwareRequest {
        board: "foo".to_string(),
        model: "bar".to_string(),
        main_rw: Some(ARCHIVE.to_string()),
        main_ro: Some(ARCHIVE.to_string()),
        ec_ro: Some(ARCHIVE.to_string()),
        ..Default::default()
    };
    let mut svc =
        FirmwareService::new(request, Some(connection(&dut)), None, quick_reconnect()).unwrap();

    let steps = provision(&mut svc, DEADLINE).await.unwrap();

    assert_eq!(
        steps,
        vec![
            FirmwareStep::Prepare,
            FirmwareStep::UpdateRo,
            FirmwareStep::UpdateRw,
            FirmwareStep::PostInstall
        ]
    );
    assert_eq!(dut.count("mktemp"), 1);
    assert_eq!(dut.count("gsutil cp"), 1);

    let futility: Vec<String> = dut
        .log()
        .into_iter()
        .filter(|l| l.starts_with("futility"))
        .collect();
    assert_eq!(
        futility,
        vec![
            "futility update --mode=recovery --image=/tmp/fw-provision.0/image-bar.bin \
             --ec_image=/tmp/fw-provision.0/bar/ec.bin --wp=0",
            "futility update --mode=recovery --image=/tmp/fw-provision.0/image-bar.bin --wp=1",
        ]
    );

    let log = dut.log();
    let restart = log.iter().position(|l| l == "restart").unwrap();
    assert_eq!(log[restart + 1], "true");
    assert_eq!(log.last().unwrap(), "rm -rf /tmp/fw-provision.0");
    assert!(svc.cache().is_empty());
}

#[tokio::test]
async fn test_missing_image_cleans_up_archives() {
    let dut = Arc::new(ScriptedHost {
        listing: "README\n".to_string(),
        ..Default::default()
    });
    let request = FirmwareRequest {
        board: "foo".to_string(),
        main_ro: Some(ARCHIVE.to_string()),
        ..Default::default()
    };
    let mut svc =
        FirmwareService::new(request, Some(connection(&dut)), None, quick_reconnect()).unwrap();

    let err = provision(&mut svc, DEADLINE).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ImageCandidateNotFound);
    assert!(err.to_string().contains("image-foo.bin"));
    assert_eq!(dut.count("futility"), 0);
    assert_eq!(dut.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(dut.count("rm -rf /tmp/fw-provision.0"), 1);
}

#[tokio::test]
async fn test_unreachable_dut_fails_prepare() {
    let dut = Arc::new(ScriptedHost {
        failing: vec!["true"],
        ..Default::default()
    });
    let request = FirmwareRequest {
        main_rw: Some(ARCHIVE.to_string()),
        ..Default::default()
    };
    let mut svc =
        FirmwareService::new(request, Some(connection(&dut)), None, quick_reconnect()).unwrap();

    let err = provision(&mut svc, DEADLINE).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DutUnreachablePreUpdate);
    assert_eq!(dut.count("mktemp"), 0);
}

// ============================================================================
// Over servo
// ============================================================================

#[tokio::test]
async fn test_ec_over_servo_uses_flash_ec() {
    let servo = Arc::new(ScriptedHost {
        listing: "bar/ec.bin\nimage.bin\n".to_string(),
        servod: micro_servod("stm32"),
        ..Default::default()
    });
    let dut = Arc::new(ScriptedHost::default());
    let request = FirmwareRequest {
        board: "foo".to_string(),
        model: "bar".to_string(),
        ec_ro: Some(ARCHIVE.to_string()),
        use_servo: true,
        ..Default::default()
    };
    let mut svc = FirmwareService::new(
        request,
        Some(connection(&dut)),
        Some(ServoHost::new(connection(&servo), 9999)),
        quick_reconnect(),
    )
    .unwrap();

    provision(&mut svc, DEADLINE).await.unwrap();

    let log = servo.log();
    assert!(log.contains(&"dut-control -p 9999 ccd_serialname".to_string()));
    let flash_ec = log.iter().find(|l| l.contains("flash_ec --ro")).unwrap();
    assert!(flash_ec.contains("--chip=stm32 --board=bar"));
    assert!(flash_ec.contains("--image=/tmp/fw-provision.0/bar/ec.bin --port=9999"));
    assert!(flash_ec.contains("--bitbang_rate=57600"));
    assert_eq!(servo.count("futility"), 0);
    assert!(log.contains(&"dut-control -p 9999 power_state:reset".to_string()));
    assert_eq!(dut.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(dut.count("true"), 2);
}

#[tokio::test]
async fn test_servo_controls_wrap_failed_futility() {
    let servo = Arc::new(ScriptedHost {
        listing: "image.bin\n".to_string(),
        servod: micro_servod("npcx_uut"),
        failing: vec!["futility"],
        ..Default::default()
    });
    let request = FirmwareRequest {
        main_ro: Some(ARCHIVE.to_string()),
        use_servo: true,
        ..Default::default()
    };
    let mut svc = FirmwareService::new(
        request,
        None,
        Some(ServoHost::new(connection(&servo), 9999)),
        quick_reconnect(),
    )
    .unwrap();

    let err = provision(&mut svc, DEADLINE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpdateFirmwareFailed);

    let log = servo.log();
    let on = log.iter().position(|l| l == "dut-control -p 9999 cpu_fw_spi:on").unwrap();
    let flash = log.iter().position(|l| l.starts_with("futility")).unwrap();
    let off = log.iter().position(|l| l == "dut-control -p 9999 cpu_fw_spi:off").unwrap();
    assert!(on < flash && flash < off);
    assert!(log[flash].ends_with("--wp=0 -p raiden_debug_spi:serial=MICRO1"));
    assert_eq!(servo.count("rm -rf /tmp/fw-provision.0"), 1);
}

#[tokio::test]
async fn test_failed_servo_reset_falls_back_to_os_restart() {
    let servo = Arc::new(ScriptedHost {
        listing: "image.bin\n".to_string(),
        servod: micro_servod("it83xx"),
        failing: vec!["dut-control -p 9999 power_state:reset"],
        ..Default::default()
    });
    let dut = Arc::new(ScriptedHost::default());
    let request = FirmwareRequest {
        main_rw: Some(ARCHIVE.to_string()),
        use_servo: true,
        ..Default::default()
    };
    let mut svc = FirmwareService::new(
        request.clone(),
        Some(connection(&dut)),
        Some(ServoHost::new(connection(&servo), 9999)),
        quick_reconnect(),
    )
    .unwrap();

    provision(&mut svc, DEADLINE).await.unwrap();
    assert_eq!(dut.restarts.load(Ordering::SeqCst), 1);

    let strict = FirmwareRequest {
        require_servo_reset: true,
        ..request
    };
    let dut = Arc::new(ScriptedHost::default());
    let mut svc = FirmwareService::new(
        strict,
        Some(connection(&dut)),
        Some(ServoHost::new(connection(&servo), 9999)),
        quick_reconnect(),
    )
    .unwrap();

    let err = provision(&mut svc, DEADLINE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DutUnreachablePostUpdate);
    assert_eq!(dut.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_required_servo_reset_without_servo_host_fails() {
    let dut = Arc::new(ScriptedHost {
        listing: "image.bin\n".to_string(),
        ..Default::default()
    });
    let request = FirmwareRequest {
        main_rw: Some(ARCHIVE.to_string()),
        require_servo_reset: true,
        ..Default::default()
    };
    let mut svc =
        FirmwareService::new(request, Some(connection(&dut)), None, quick_reconnect()).unwrap();

    let err = provision(&mut svc, DEADLINE).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DutUnreachablePostUpdate);
    assert!(err.to_string().contains("servo"));
    assert_eq!(dut.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(dut.count("futility"), 1);
}
