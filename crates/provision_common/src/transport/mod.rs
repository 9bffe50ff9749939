//! Device connections.
//!
//! Firmware provisioning talks to either the DUT itself (over SSH) or to the
//! servo host attached to it. Both expose the same `DeviceConnection`
//! operations, so the provisioning code is written once.

pub mod servo;
pub mod ssh;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ReconnectConfig;
use crate::error::{ProvisionError, Result};

pub use servo::{ServoConfig, ServoHost, ServoType};
pub use ssh::{SshConnection, SshTarget};

/// Command line that downloads `url` to `dest` on a lab host.
pub fn download_command(url: &str, dest: &str) -> (&'static str, Vec<String>) {
    if url.starts_with("gs://") {
        return ("gsutil", vec!["cp".into(), url.into(), dest.into()]);
    }
    (
        "curl",
        [
            "-S", "-s", "-v", "-#", "-C", "-", "--retry", "3", "--retry-delay", "60", url, "-o",
            dest,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    )
}

/// Operations a provisioner needs from a remote host.
///
/// Commands are joined with spaces and interpreted by the remote shell, so
/// arguments may carry shell syntax such as `&&`.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Run `cmd args...`, returning stdout.
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String>;

    /// Restart the host.
    async fn restart(&self) -> Result<()>;

    /// Host name for logs.
    fn describe(&self) -> String;

    /// Download `url` to `dest` on the host.
    async fn copy_data(&self, url: &str, dest: &str) -> Result<()> {
        let (cmd, args) = download_command(url, dest);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_cmd(cmd, &args).await.map(|_| ())
    }

    async fn delete_directory(&self, dir: &str) -> Result<()> {
        self.run_cmd("rm", &["-rf", dir]).await.map(|_| ())
    }

    async fn create_directories(&self, dirs: &[&str]) -> Result<()> {
        let mut args = vec!["-p"];
        args.extend_from_slice(dirs);
        self.run_cmd("mkdir", &args).await.map(|_| ())
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let out = self
            .run_cmd("[", &["-e", path, "]", "&&", "echo", "-n", "1", "||", "echo", "-n", "0"])
            .await?;
        Ok(out.trim() == "1")
    }
}

#[async_trait]
impl<T: DeviceConnection + ?Sized> DeviceConnection for std::sync::Arc<T> {
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
        (**self).run_cmd(cmd, args).await
    }

    async fn restart(&self) -> Result<()> {
        (**self).restart().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn copy_data(&self, url: &str, dest: &str) -> Result<()> {
        (**self).copy_data(url, dest).await
    }

    async fn delete_directory(&self, dir: &str) -> Result<()> {
        (**self).delete_directory(dir).await
    }

    async fn create_directories(&self, dirs: &[&str]) -> Result<()> {
        (**self).create_directories(dirs).await
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        (**self).path_exists(path).await
    }
}

/// Poll `conn` with `true` until it answers or `policy` runs out.
pub async fn wait_for_reconnect(conn: &dyn DeviceConnection, policy: &ReconnectConfig) -> Result<()> {
    let retries = policy.effective_retries();
    let mut last_error = String::from("no attempt made");
    for attempt in 1..=retries {
        match tokio::time::timeout(policy.attempt_timeout(), conn.run_cmd("true", &[])).await {
            Ok(Ok(_)) => {
                info!("[reconnect] {} is back after {} attempt(s)", conn.describe(), attempt);
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("no answer within {:?}", policy.attempt_timeout()),
        }
        debug!("[reconnect] {} attempt {}/{}: {}", conn.describe(), attempt, retries, last_error);
        if attempt < retries {
            tokio::time::sleep(policy.pause()).await;
        }
    }
    Err(ProvisionError::DutUnreachablePostUpdate(format!(
        "{} did not come back after {} attempts: {}",
        conn.describe(),
        retries,
        last_error
    )))
}
