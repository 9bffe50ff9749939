//! SSH connection to a lab host, using the system `ssh` client.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::DeviceConnection;
use crate::error::{ProvisionError, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    /// Parse `[user@]host[:port]`. The user defaults to root.
    pub fn parse(s: &str) -> Result<Self> {
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) => (user, rest),
            None => ("root", s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| {
                    ProvisionError::InvalidRequest(format!("bad port in {:?}", s))
                })?;
                (host, Some(port))
            }
            _ => (rest, None),
        };
        if host.is_empty() || user.is_empty() {
            return Err(ProvisionError::InvalidRequest(format!(
                "bad ssh target {:?}",
                s
            )));
        }
        Ok(Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            identity: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Options shared by `ssh` and `scp`.
    fn common_options(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if let Some(identity) = &self.identity {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        args
    }

    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments of `ssh` running `command_line` remotely.
    pub fn ssh_args(&self, command_line: &str) -> Vec<String> {
        let mut args = self.common_options();
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string());
        }
        args.push(self.login());
        args.push("--".into());
        args.push(command_line.to_string());
        args
    }

    /// Arguments of `scp` copying `local` to `remote`.
    pub fn scp_args(&self, local: &Path, remote: &str) -> Vec<String> {
        let mut args = self.common_options();
        if let Some(port) = self.port {
            args.push("-P".into());
            args.push(port.to_string());
        }
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.login(), remote));
        args
    }
}

fn command_line(cmd: &str, args: &[&str]) -> String {
    let mut line = String::from(cmd);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[derive(Debug, Clone)]
pub struct SshConnection {
    target: SshTarget,
}

impl SshConnection {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn failed(&self, command: &str, stderr: &[u8], status: std::process::ExitStatus) -> ProvisionError {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();
        ProvisionError::CommandFailed {
            host: self.target.host.clone(),
            command: command.to_string(),
            stderr: if stderr.is_empty() {
                status.to_string()
            } else {
                stderr
            },
            code: status.code(),
        }
    }

    /// Run a command feeding `input` on stdin. The remote stderr is passed
    /// through to ours; stdout is returned as raw bytes.
    pub async fn run_with_stdin(&self, cmd: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        let line = command_line(cmd, args);
        debug!("[ssh] {}: {} (stdin {} bytes)", self.target.host, line, input.len());
        let mut child = Command::new("ssh")
            .args(self.target.ssh_args(&line))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(self.failed(&line, b"", output.status));
        }
        Ok(output.stdout)
    }

    /// Copy a local file to `remote` with scp.
    pub async fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        debug!("[ssh] {}: push {} -> {}", self.target.host, local.display(), remote);
        let output = Command::new("scp")
            .args(self.target.scp_args(local, remote))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(self.failed(&format!("scp {}", local.display()), &output.stderr, output.status));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceConnection for SshConnection {
    async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let line = command_line(cmd, args);
        debug!("[ssh] {}: {}", self.target.host, line);
        let output = Command::new("ssh")
            .args(self.target.ssh_args(&line))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(self.failed(&line, &output.stderr, output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Schedule a reboot and return before the connection drops.
    async fn restart(&self) -> Result<()> {
        self.run_cmd(
            "nohup",
            &["sh", "-c", "'sleep 1 && reboot'", ">/dev/null", "2>&1", "&"],
        )
        .await
        .map(|_| ())
    }

    fn describe(&self) -> String {
        format!("ssh://{}", self.target.host)
    }
}
