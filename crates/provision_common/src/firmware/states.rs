//! Commands of each firmware step.

use async_trait::async_trait;

use super::{FirmwareService, FirmwareStep};
use crate::engine::Command;
use crate::error::Result;

pub(super) fn commands(svc: &FirmwareService, step: FirmwareStep) -> Vec<Box<dyn Command<FirmwareService>>> {
    match step {
        FirmwareStep::Prepare => {
            let mut commands: Vec<Box<dyn Command<FirmwareService>>> = vec![Box::new(CheckDutReachable)];
            if svc.request.use_servo {
                commands.push(Box::new(PrepareServo));
            }
            for path in svc.request.archive_paths() {
                commands.push(Box::new(DownloadArchive { path }));
            }
            commands
        }
        FirmwareStep::UpdateRo => vec![Box::new(FlashRo)],
        FirmwareStep::UpdateRw => vec![Box::new(FlashRw)],
        FirmwareStep::PostInstall => vec![Box::new(RestartDut), Box::new(DeleteArchives)],
    }
}

struct CheckDutReachable;

#[async_trait]
impl Command<FirmwareService> for CheckDutReachable {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.check_dut_reachable().await
    }

    async fn revert(&mut self, _svc: &mut FirmwareService) -> Result<()> {
        Ok(())
    }

    fn error_message(&self) -> String {
        "DUT is not reachable over SSH".to_string()
    }
}

struct PrepareServo;

#[async_trait]
impl Command<FirmwareService> for PrepareServo {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.prepare_servo().await
    }

    async fn revert(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.servo_setup = None;
        Ok(())
    }

    fn error_message(&self) -> String {
        "failed to prepare servo".to_string()
    }
}

/// Download and list one archive. Reverting deletes its directory.
struct DownloadArchive {
    path: String,
}

#[async_trait]
impl Command<FirmwareService> for DownloadArchive {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.download_archive(&self.path).await
    }

    async fn revert(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.discard_archive(&self.path).await
    }

    fn error_message(&self) -> String {
        format!("failed to download {}", self.path)
    }
}

// Flashed firmware cannot be unflashed; both reverts are no-ops.

struct FlashRo;

#[async_trait]
impl Command<FirmwareService> for FlashRo {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.update_ro().await
    }

    async fn revert(&mut self, _svc: &mut FirmwareService) -> Result<()> {
        Ok(())
    }

    fn error_message(&self) -> String {
        "failed to update RO firmware".to_string()
    }
}

struct FlashRw;

#[async_trait]
impl Command<FirmwareService> for FlashRw {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.update_rw().await
    }

    async fn revert(&mut self, _svc: &mut FirmwareService) -> Result<()> {
        Ok(())
    }

    fn error_message(&self) -> String {
        "failed to update RW firmware".to_string()
    }
}

struct RestartDut;

#[async_trait]
impl Command<FirmwareService> for RestartDut {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.restart_dut().await
    }

    async fn revert(&mut self, _svc: &mut FirmwareService) -> Result<()> {
        Ok(())
    }

    fn error_message(&self) -> String {
        "failed to restart DUT".to_string()
    }
}

struct DeleteArchives;

#[async_trait]
impl Command<FirmwareService> for DeleteArchives {
    async fn execute(&mut self, svc: &mut FirmwareService) -> Result<()> {
        svc.delete_archives().await
    }

    async fn revert(&mut self, _svc: &mut FirmwareService) -> Result<()> {
        Ok(())
    }

    fn error_message(&self) -> String {
        "failed to delete firmware archives".to_string()
    }
}
