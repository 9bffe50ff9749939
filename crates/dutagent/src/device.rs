//! Commands the agent runs on the DUT itself.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use provision_common::orchestrator::DevicePostInstall;
use provision_common::transport::DeviceConnection;
use provision_common::{ProvisionError, Result};

const MAKE_DEV_SSD: &str = "/usr/share/vboot/bin/make_dev_ssd.sh";

/// The local shell. Command lines go through `sh -c` so they read the same
/// as over SSH.
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

#[async_trait]
impl DeviceConnection for LocalShell {
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let mut line = String::from(cmd);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        debug!("[local] {}", line);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                host: self.describe(),
                command: line,
                stderr: output.status.to_string(),
                code: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn restart(&self) -> Result<()> {
        Err(ProvisionError::InvalidRequest(
            "the agent never restarts its own host".to_string(),
        ))
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}

/// Post-install steps run through a connection to the DUT.
pub struct PostInstaller<C> {
    conn: C,
}

impl<C: DeviceConnection> PostInstaller<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<C: DeviceConnection> DevicePostInstall for PostInstaller<C> {
    /// Mount `root` read-only and run its `postinst`.
    async fn run_postinst(&self, root: &str) -> Result<()> {
        let failed = |e: ProvisionError| ProvisionError::PostInstallFailed(e.to_string());

        let dir = self
            .conn
            .run_cmd("mktemp", &["-d", "/tmp/dutagent.XXXXXXXX"])
            .await
            .map_err(failed)?;
        let dir = dir.trim();
        self.conn
            .run_cmd("mount", &["-o", "ro", root, dir])
            .await
            .map_err(failed)?;

        let postinst = format!("{}/postinst", dir);
        let ran = self.conn.run_cmd(&postinst, &[root]).await;
        if let Err(e) = self.conn.run_cmd("umount", &[root]).await {
            warn!("[postinst] failed to unmount {}: {}", root, e);
        }
        ran.map_err(failed)?;
        Ok(())
    }

    async fn disable_rootfs_verification(&self, kernel_num: u32) -> Result<()> {
        let partitions = kernel_num.to_string();
        self.conn
            .run_cmd(
                MAKE_DEV_SSD,
                &["--remove_rootfs_verification", "--partitions", partitions.as_str()],
            )
            .await
            .map_err(|e| ProvisionError::RootfsVerificationToggleFailed(e.to_string()))?;
        Ok(())
    }

    async fn clear_tpm_owner(&self) -> Result<()> {
        self.conn
            .run_cmd("crossystem", &["clear_tpm_owner_request=1"])
            .await
            .map_err(|e| ProvisionError::SecurityModuleClearFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_common::ErrorKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl DeviceConnection for Recorder {
        async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
            let mut line = vec![cmd];
            line.extend_from_slice(args);
            let line = line.join(" ");
            self.lines.lock().unwrap().push(line.clone());
            if self.fail.is_some_and(|p| line.starts_with(p)) {
                return Err(ProvisionError::CommandFailed {
                    host: "dut".to_string(),
                    command: line,
                    stderr: "exit status: 1".to_string(),
                    code: Some(1),
                });
            }
            if cmd == "mktemp" {
                return Ok("/tmp/dutagent.a1b2c3d4\n".to_string());
            }
            Ok(String::new())
        }

        async fn restart(&self) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "dut".to_string()
        }
    }

    #[tokio::test]
    async fn test_postinst_mounts_runs_and_unmounts() {
        let device = PostInstaller::new(Recorder::default());
        device.run_postinst("/dev/nvme0n1p5").await.unwrap();
        assert_eq!(
            *device.conn.lines.lock().unwrap(),
            vec![
                "mktemp -d /tmp/dutagent.XXXXXXXX",
                "mount -o ro /dev/nvme0n1p5 /tmp/dutagent.a1b2c3d4",
                "/tmp/dutagent.a1b2c3d4/postinst /dev/nvme0n1p5",
                "umount /dev/nvme0n1p5",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_postinst_still_unmounts() {
        let device = PostInstaller::new(Recorder {
            fail: Some("/tmp/dutagent.a1b2c3d4/postinst"),
            ..Default::default()
        });
        let err = device.run_postinst("/dev/sda3").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PostInstallFailed);
        assert_eq!(
            device.conn.lines.lock().unwrap().last().unwrap(),
            "umount /dev/sda3"
        );
    }

    #[tokio::test]
    async fn test_retryable_steps_classify_failures() {
        let device = PostInstaller::new(Recorder {
            fail: Some("crossystem"),
            ..Default::default()
        });
        device.disable_rootfs_verification(4).await.unwrap();
        assert_eq!(
            device.conn.lines.lock().unwrap()[0],
            "/usr/share/vboot/bin/make_dev_ssd.sh --remove_rootfs_verification --partitions 4"
        );
        let err = device.clear_tpm_owner().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SecurityModuleClearFailed);
    }
}
