//! Firmware provisioning.
//!
//! Flashes AP, EC and PD firmware from archives with `futility`, either on the
//! DUT itself or from its servo host. The work is a chain of steps driven by
//! the engine:
//!
//! ```text
//! Prepare -> UpdateRo? -> UpdateRw? -> PostInstall
//! ```

pub mod archive;
mod states;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ReconnectConfig;
use crate::engine::{self, Command, Service, StartFlag};
use crate::error::{ProvisionError, Result};
use crate::transport::servo::ServoSetup;
use crate::transport::{wait_for_reconnect, DeviceConnection, ServoConfig, ServoHost};
use archive::{ArchiveCache, ArchiveMetadata};

/// Shared handle to a device.
pub type Connection = Arc<dyn DeviceConnection>;

/// EC chips that need a slower bit-bang rate when flashed through servo.
const BITBANG_CHIP: &str = "stm32";
const BITBANG_RATE: &str = "57600";

// ============================================================================
// Request
// ============================================================================

/// What to flash. Each payload is the remote path of a firmware archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareRequest {
    pub board: String,
    pub model: String,
    pub main_rw: Option<String>,
    pub main_ro: Option<String>,
    pub ec_ro: Option<String>,
    pub pd_ro: Option<String>,
    /// Pass `--force` to futility
    pub force: bool,
    /// Flash from the servo host instead of the DUT
    pub use_servo: bool,
    /// Fail instead of restarting from the OS when a servo reset fails
    pub require_servo_reset: bool,
}

impl FirmwareRequest {
    pub fn validate(&self) -> Result<()> {
        if !self.update_ro() && !self.update_rw() {
            return Err(ProvisionError::InvalidRequest(
                "no firmware payload given, nothing to flash".to_string(),
            ));
        }
        if self.use_servo && self.pd_ro.is_some() {
            return Err(ProvisionError::InvalidRequest(
                "can't flash PD as a separate image over servo".to_string(),
            ));
        }
        Ok(())
    }

    pub fn update_ro(&self) -> bool {
        self.main_ro.is_some() || self.ec_ro.is_some() || self.pd_ro.is_some()
    }

    pub fn update_rw(&self) -> bool {
        self.main_rw.is_some()
    }

    /// Distinct archive paths, in request order.
    pub fn archive_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for path in [&self.main_rw, &self.main_ro, &self.ec_ro, &self.pd_ro]
            .into_iter()
            .flatten()
        {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }
}

// ============================================================================
// Tool arguments
// ============================================================================

/// Arguments of `futility update`.
///
/// `write_protect` is set for RW-only updates so the RO region is left alone.
pub fn futility_args(
    image_args: &[String],
    write_protect: bool,
    force: bool,
    servo: Option<&ServoConfig>,
) -> Result<Vec<String>> {
    if image_args.is_empty() {
        return Err(ProvisionError::UpdateFirmwareFailed(
            "futility called without any image".to_string(),
        ));
    }
    let mut args = vec!["update".to_string(), "--mode=recovery".to_string()];
    args.extend(image_args.iter().cloned());
    args.push(if write_protect { "--wp=1" } else { "--wp=0" }.to_string());
    if force {
        args.push("--force".to_string());
    }
    if let Some(config) = servo {
        args.push("-p".to_string());
        args.push(config.programmer.clone());
        args.extend(config.extra_args.iter().cloned());
    }
    Ok(args)
}

/// Arguments of `flash_ec` writing the RO EC image `image`.
pub fn flash_ec_args(ec_chip: &str, board: &str, image: &str, port: u16) -> Vec<String> {
    let mut args = vec![
        "--ro".to_string(),
        format!("--chip={}", ec_chip),
        format!("--board={}", board),
        format!("--image={}", image),
        format!("--port={}", port),
    ];
    if ec_chip == BITBANG_CHIP {
        args.push(format!("--bitbang_rate={}", BITBANG_RATE));
    }
    args.push("--verify".to_string());
    args.push("--verbose".to_string());
    args
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStep {
    Prepare,
    UpdateRo,
    UpdateRw,
    PostInstall,
}

/// State of one firmware provisioning run.
pub struct FirmwareService {
    request: FirmwareRequest,
    dut: Option<Connection>,
    servo: Option<Arc<ServoHost<Connection>>>,
    servo_setup: Option<ServoSetup>,
    cache: ArchiveCache,
    reconnect: ReconnectConfig,
}

impl FirmwareService {
    /// `dut` is needed unless flashing over servo; `servo` is needed when
    /// flashing over servo and used for resets whenever present.
    pub fn new(
        request: FirmwareRequest,
        dut: Option<Connection>,
        servo: Option<ServoHost<Connection>>,
        reconnect: ReconnectConfig,
    ) -> Result<Self> {
        request.validate()?;
        if request.use_servo && servo.is_none() {
            return Err(ProvisionError::InvalidRequest(
                "flashing over servo needs a servo host".to_string(),
            ));
        }
        if !request.use_servo && dut.is_none() {
            return Err(ProvisionError::InvalidRequest(
                "flashing without servo needs an SSH connection to the DUT".to_string(),
            ));
        }
        Ok(Self {
            request,
            dut,
            servo: servo.map(Arc::new),
            servo_setup: None,
            cache: ArchiveCache::new(),
            reconnect,
        })
    }

    pub fn request(&self) -> &FirmwareRequest {
        &self.request
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    /// Device that downloads archives and runs the flashing tools.
    fn flashing_device(&self) -> Result<Connection> {
        if self.request.use_servo {
            if let Some(servo) = &self.servo {
                let conn: Connection = servo.clone();
                return Ok(conn);
            }
        } else if let Some(dut) = &self.dut {
            return Ok(dut.clone());
        }
        Err(ProvisionError::InvalidRequest(
            "no connection to flash from".to_string(),
        ))
    }

    async fn check_dut_reachable(&self) -> Result<()> {
        let Some(dut) = &self.dut else {
            return Ok(());
        };
        dut.run_cmd("true", &[]).await.map_err(|e| {
            ProvisionError::DutUnreachablePreUpdate(format!("{}: {}", dut.describe(), e))
        })?;
        Ok(())
    }

    async fn prepare_servo(&mut self) -> Result<()> {
        let Some(servo) = &self.servo else {
            return Ok(());
        };
        let setup = servo.prepare(self.request.ec_ro.is_some()).await?;
        self.servo_setup = Some(setup);
        Ok(())
    }

    async fn download_archive(&mut self, path: &str) -> Result<()> {
        let conn = self.flashing_device()?;
        self.cache.get_or_download(conn.as_ref(), path).await?;
        Ok(())
    }

    async fn discard_archive(&mut self, path: &str) -> Result<()> {
        let conn = self.flashing_device()?;
        match self.cache.remove(path) {
            Some(metadata) => conn.delete_directory(&metadata.archive_dir).await,
            None => Ok(()),
        }
    }

    async fn archive(&mut self, conn: &Connection, path: &str) -> Result<ArchiveMetadata> {
        Ok(self.cache.get_or_download(conn.as_ref(), path).await?.clone())
    }

    async fn update_ro(&mut self) -> Result<()> {
        let request = self.request.clone();
        let conn = self.flashing_device()?;
        let mut image_args = Vec::new();
        let mut ec_flashed = false;

        if let Some(path) = &request.main_ro {
            let metadata = self.archive(&conn, path).await?;
            let candidates = archive::main_image_candidates(&request.board, &request.model);
            let image = archive::pick_and_extract(conn.as_ref(), &metadata, "AP", candidates).await?;
            image_args.push(format!("--image={}", image));
        }

        if let Some(path) = &request.ec_ro {
            let metadata = self.archive(&conn, path).await?;
            let candidates = archive::ec_image_candidates(&request.board, &request.model);
            let image = archive::pick_and_extract(conn.as_ref(), &metadata, "EC", candidates).await?;
            if request.use_servo {
                self.flash_ec(&conn, &metadata, &image).await?;
                ec_flashed = true;
            } else {
                image_args.push(format!("--ec_image={}", image));
            }
        }

        if let Some(path) = &request.pd_ro {
            if request.use_servo {
                return Err(ProvisionError::UpdateFirmwareFailed(
                    "can't flash PD as a separate image over servo".to_string(),
                ));
            }
            let metadata = self.archive(&conn, path).await?;
            let image = archive::pick_and_extract(
                conn.as_ref(),
                &metadata,
                "PD",
                archive::pd_image_candidates(),
            )
            .await?;
            image_args.push(format!("--pd_image={}", image));
        }

        if image_args.is_empty() && ec_flashed {
            info!("[firmware] EC flashed with flash_ec, no AP image to write");
            return Ok(());
        }
        self.flash_with_futility(&conn, &image_args, false).await
    }

    async fn update_rw(&mut self) -> Result<()> {
        let request = self.request.clone();
        let conn = self.flashing_device()?;
        let Some(path) = &request.main_rw else {
            return Ok(());
        };
        let metadata = self.archive(&conn, path).await?;
        let candidates = archive::main_image_candidates(&request.board, &request.model);
        let image = archive::pick_and_extract(conn.as_ref(), &metadata, "AP", candidates).await?;
        self.flash_with_futility(&conn, &[format!("--image={}", image)], true)
            .await
    }

    fn servo_setup(&self) -> Result<&ServoSetup> {
        self.servo_setup.as_ref().ok_or_else(|| {
            ProvisionError::UpdateFirmwareFailed("servo was not prepared".to_string())
        })
    }

    async fn flash_ec(&self, conn: &Connection, metadata: &ArchiveMetadata, image: &str) -> Result<()> {
        let setup = self.servo_setup()?;
        let port = self.servo.as_ref().map(|s| s.port()).unwrap_or_default();
        let flash_ec = archive::locate_flash_ec(conn.as_ref(), &metadata.archive_dir).await?;
        let board = if self.request.model.is_empty() {
            &self.request.board
        } else {
            &self.request.model
        };
        let args = flash_ec_args(&setup.ec_chip, board, image, port);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        info!("[firmware] flashing EC with {}", flash_ec);
        conn.run_cmd(&flash_ec, &args)
            .await
            .map_err(|e| ProvisionError::UpdateFirmwareFailed(format!("flash_ec failed: {}", e)))?;
        Ok(())
    }

    /// Run futility on `conn`. Over servo the DUT is switched into flashing
    /// mode first, and switched back even if flashing failed.
    async fn flash_with_futility(
        &self,
        conn: &Connection,
        image_args: &[String],
        write_protect: bool,
    ) -> Result<()> {
        let servo_config = if self.request.use_servo {
            Some(&self.servo_setup()?.config)
        } else {
            None
        };
        let args = futility_args(image_args, write_protect, self.request.force, servo_config)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let futility_failed = |e: ProvisionError| {
            ProvisionError::UpdateFirmwareFailed(format!("futility failed: {}", e))
        };

        let (Some(servo), Some(config)) = (&self.servo, servo_config) else {
            info!("[firmware] running futility on {}", conn.describe());
            conn.run_cmd("futility", &args).await.map_err(futility_failed)?;
            return Ok(());
        };

        servo
            .run_all_dut_controls(&config.dut_on)
            .await
            .map_err(|e| ProvisionError::UpdateFirmwareFailed(format!("dut-control failed: {}", e)))?;
        info!("[firmware] running futility through {}", config.servo_type);
        let flashed = conn.run_cmd("futility", &args).await;
        let restored = servo.run_all_dut_controls(&config.dut_off).await;
        flashed.map_err(futility_failed)?;
        restored.map_err(|e| {
            ProvisionError::UpdateFirmwareFailed(format!("dut-control after flashing failed: {}", e))
        })?;
        Ok(())
    }

    /// Restart the DUT and wait until it is reachable again.
    async fn restart_dut(&self) -> Result<()> {
        if self.request.require_servo_reset && self.servo.is_none() {
            return Err(ProvisionError::DutUnreachablePostUpdate(
                "servo restart is required but no servo host is configured".to_string(),
            ));
        }
        if let Some(servo) = &self.servo {
            match servo.run_dut_control(&["power_state:reset"]).await {
                Ok(_) => return self.wait_after_servo_reset(servo).await,
                Err(e) if self.request.require_servo_reset => {
                    return Err(ProvisionError::DutUnreachablePostUpdate(format!(
                        "servo reset failed: {}",
                        e
                    )));
                }
                Err(e) => warn!("[firmware] servo reset failed, restarting from the OS: {}", e),
            }
        }

        let dut = self.dut.as_ref().ok_or_else(|| {
            ProvisionError::DutUnreachablePostUpdate("no SSH connection to the DUT".to_string())
        })?;
        dut.restart()
            .await
            .map_err(|e| ProvisionError::DutUnreachablePostUpdate(format!("restart failed: {}", e)))?;
        wait_for_reconnect(dut.as_ref(), &self.reconnect).await
    }

    async fn wait_after_servo_reset(&self, servo: &ServoHost<Connection>) -> Result<()> {
        if let Some(dut) = &self.dut {
            return wait_for_reconnect(dut.as_ref(), &self.reconnect).await;
        }
        tokio::time::sleep(self.reconnect.servo_reboot_wait()).await;
        let state = servo.get_variable("ec_system_powerstate").await.map_err(|e| {
            ProvisionError::DutUnreachablePostUpdate(format!("failed to read power state: {}", e))
        })?;
        info!("[firmware] DUT power state after reset: {}", state);
        Ok(())
    }

    async fn delete_archives(&mut self) -> Result<()> {
        let conn = self.flashing_device()?;
        self.cache.delete_all(conn.as_ref()).await
    }
}

#[async_trait]
impl Service for FirmwareService {
    type Step = FirmwareStep;

    fn first_step(&self) -> FirmwareStep {
        FirmwareStep::Prepare
    }

    fn step_name(step: FirmwareStep) -> &'static str {
        match step {
            FirmwareStep::Prepare => "Firmware Prepare",
            FirmwareStep::UpdateRo => "Firmware Update RO",
            FirmwareStep::UpdateRw => "Firmware Update RW",
            FirmwareStep::PostInstall => "Firmware Post Install",
        }
    }

    fn commands(&self, step: FirmwareStep) -> Vec<Box<dyn Command<Self>>> {
        states::commands(self, step)
    }

    fn next(&self, step: FirmwareStep) -> Option<FirmwareStep> {
        match step {
            FirmwareStep::Prepare if self.request.update_ro() => Some(FirmwareStep::UpdateRo),
            FirmwareStep::Prepare | FirmwareStep::UpdateRo if self.request.update_rw() => {
                Some(FirmwareStep::UpdateRw)
            }
            FirmwareStep::Prepare | FirmwareStep::UpdateRo | FirmwareStep::UpdateRw => {
                Some(FirmwareStep::PostInstall)
            }
            FirmwareStep::PostInstall => None,
        }
    }

    async fn cleanup_on_failure(
        &mut self,
        completed: &[FirmwareStep],
        err: &ProvisionError,
    ) -> Result<()> {
        info!(
            "[firmware] cleaning up after failure ({} steps completed): {}",
            completed.len(),
            err
        );
        self.delete_archives().await
    }
}

/// Run `svc` to completion within `limit`.
pub async fn provision(svc: &mut FirmwareService, limit: Duration) -> Result<Vec<FirmwareStep>> {
    let started = StartFlag::default();
    engine::with_deadline(limit, &started, engine::run_service(svc, &started)).await
}
