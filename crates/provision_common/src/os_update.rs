//! Host side of an OS update.
//!
//! The host checks the DUT and the build, pushes the agent, hands it a
//! `FlashRequest`, then reboots the DUT into the freshly written slot and
//! retries any post-install step the agent could not finish.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::blob::{Artifact, BlobStore};
use crate::engine::StartFlag;
use crate::error::{ErrorKind, ProvisionError, Result};
use crate::partition::{self, PartitionState};
use crate::transport::{DeviceConnection, SshConnection};
use crate::wire::{self, FlashRequest, FlashResult};

pub const BOOT_ID_FILE: &str = "/proc/sys/kernel/random/boot_id";
pub const ROOTFS_VERIFICATION_HELPER: &str =
    "/usr/libexec/debugd/helpers/dev_features_rootfs_verification";

/// A host that can receive and run the agent.
#[async_trait]
pub trait AgentHost: DeviceConnection {
    async fn push_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Run a command with `input` on stdin, returning raw stdout.
    async fn run_with_stdin(&self, cmd: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>>;
}

#[async_trait]
impl AgentHost for SshConnection {
    async fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        SshConnection::push_file(self, local, remote).await
    }

    async fn run_with_stdin(&self, cmd: &str, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        SshConnection::run_with_stdin(self, cmd, args, input).await
    }
}

/// CPU architecture of a DUT, as named in agent build outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutArch {
    Amd64,
    Arm64,
    Arm,
}

impl DutArch {
    /// Map `uname -m` output.
    pub fn from_machine(machine: &str) -> Option<Self> {
        match machine.trim() {
            "x86_64" => Some(DutArch::Amd64),
            "aarch64" | "arm64" => Some(DutArch::Arm64),
            m if m.starts_with("armv") => Some(DutArch::Arm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DutArch::Amd64 => "amd64",
            DutArch::Arm64 => "arm64",
            DutArch::Arm => "arm",
        }
    }
}

pub async fn detect_arch(host: &dyn DeviceConnection) -> Result<DutArch> {
    let machine = host.run_cmd("uname", &["-m"]).await?;
    DutArch::from_machine(&machine).ok_or_else(|| {
        ProvisionError::InvalidRequest(format!(
            "no agent build for {} ({})",
            machine.trim(),
            host.describe()
        ))
    })
}

/// Where the local agent binary comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentBinary {
    /// One binary, used whatever the DUT runs on
    File(PathBuf),
    /// Directory of `dutagent-<arch>` builds
    PerArch(PathBuf),
}

impl AgentBinary {
    pub fn for_arch(&self, arch: DutArch) -> PathBuf {
        match self {
            AgentBinary::File(path) => path.clone(),
            AgentBinary::PerArch(dir) => dir.join(format!("dutagent-{}", arch.as_str())),
        }
    }

    /// Local path of the agent to push to `host`.
    pub async fn resolve(&self, host: &dyn DeviceConnection) -> Result<PathBuf> {
        match self {
            AgentBinary::File(path) => Ok(path.clone()),
            AgentBinary::PerArch(_) => {
                let arch = detect_arch(host).await?;
                info!("[os] DUT arch: {}", arch.as_str());
                Ok(self.for_arch(arch))
            }
        }
    }
}

/// Bounds of one checked reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootPolicy {
    /// Give up waiting for the new boot id after this long
    pub timeout: Duration,
    /// Delay between polls
    pub poll: Duration,
    /// Timeout of one poll
    pub attempt_timeout: Duration,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(12),
        }
    }
}

/// What to install and where the agent binary lives locally.
#[derive(Debug, Clone)]
pub struct OsUpdateOptions {
    pub bucket: String,
    pub directory: String,
    pub token: String,
    pub clobber_stateful: bool,
    pub clear_tpm_owner: bool,
    pub update_minios: bool,
    pub agent: AgentBinary,
    pub reboot: RebootPolicy,
}

/// Everything the run learned, for the caller's report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsUpdateReport {
    pub partitions: PartitionState,
    pub result: FlashResult,
    pub reboots: u32,
}

/// Stat every artifact the agent will read, failing fast on a bad build.
pub async fn check_artifacts(store: Arc<dyn BlobStore>, update_minios: bool) -> Result<()> {
    let checked = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut artifacts = Artifact::required().to_vec();
        if update_minios {
            artifacts.push(Artifact::MiniOs);
        }
        for artifact in artifacts {
            let name = artifact.object_name();
            let size = store.stat(name).map_err(|source| ProvisionError::SourceOpenFailed {
                artifact: store.describe(name),
                source,
            })?;
            debug!("[os] {} is {} bytes", store.describe(name), size);
        }
        Ok(())
    })
    .await;
    match checked {
        Ok(result) => result,
        Err(e) => Err(ProvisionError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("artifact check did not finish: {}", e),
        ))),
    }
}

/// Current partition layout of the DUT.
pub async fn detect_partitions(host: &dyn DeviceConnection) -> Result<PartitionState> {
    let root = host.run_cmd("rootdev", &["-s"]).await?;
    partition::resolve(root.trim())
}

async fn push_agent<H: AgentHost>(host: &H, local: &Path) -> Result<String> {
    let remote = host.run_cmd("mktemp", &["-t", "dutagent.XXXXXXXX"]).await?;
    let remote = remote.trim().to_string();
    host.push_file(local, &remote).await?;
    host.run_cmd("chmod", &["+x", remote.as_str()]).await?;
    Ok(remote)
}

async fn read_boot_id(host: &dyn DeviceConnection) -> Result<String> {
    Ok(host.run_cmd("cat", &[BOOT_ID_FILE]).await?.trim().to_string())
}

/// Reboot and wait until the boot id changes.
async fn reboot(host: &dyn DeviceConnection, policy: &RebootPolicy) -> Result<()> {
    let old = read_boot_id(host).await?;
    info!("[os] rebooting {}", host.describe());
    host.restart().await?;

    let wait = async {
        loop {
            tokio::time::sleep(policy.poll).await;
            match tokio::time::timeout(policy.attempt_timeout, read_boot_id(host)).await {
                Ok(Ok(id)) if !id.is_empty() && id != old => return,
                Ok(Ok(_)) => debug!("[os] {} has not rebooted yet", host.describe()),
                Ok(Err(e)) => debug!("[os] {} not reachable yet: {}", host.describe(), e),
                Err(_) => debug!("[os] {} did not answer within {:?}", host.describe(), policy.attempt_timeout),
            }
        }
    };
    tokio::time::timeout(policy.timeout, wait).await.map_err(|_| {
        ProvisionError::DutUnreachablePostUpdate(format!(
            "{} did not come back within {:?}",
            host.describe(),
            policy.timeout
        ))
    })
}

/// Reboot and verify the DUT came up on `expected_root`.
pub async fn checked_reboot(
    host: &dyn DeviceConnection,
    expected_root: &str,
    policy: &RebootPolicy,
) -> Result<()> {
    reboot(host, policy).await?;
    let now = detect_partitions(host).await?;
    info!("[os] DUT rebooted to {}", now.active_root());
    if now.active_root() != expected_root {
        return Err(ProvisionError::PostInstallFailed(format!(
            "DUT booted from {} instead of {}",
            now.active_root(),
            expected_root
        )));
    }
    Ok(())
}

/// Retry the post-install steps the agent flagged. Returns whether any ran.
pub async fn remediate(host: &dyn DeviceConnection, result: &FlashResult) -> Result<bool> {
    if result.retry_disable_rootfs_verification {
        info!("[os] retrying disable rootfs verification");
        host.run_cmd(ROOTFS_VERIFICATION_HELPER, &[])
            .await
            .map_err(|e| ProvisionError::RootfsVerificationToggleFailed(e.to_string()))?;
    }
    if result.retry_clear_tpm_owner {
        info!("[os] retrying clear TPM owner");
        host.run_cmd("crossystem", &["clear_tpm_owner_request=1"])
            .await
            .map_err(|e| ProvisionError::SecurityModuleClearFailed(e.to_string()))?;
    }
    Ok(result.needs_remediation())
}

/// Reclassify a failed agent run by the kind its exit code encodes.
///
/// Exit codes outside the taxonomy (ssh's own 255, an agent crash) stay
/// `CommandFailed`.
pub fn agent_error(host: &str, err: ProvisionError) -> ProvisionError {
    let kind = match &err {
        ProvisionError::CommandFailed { code: Some(code), .. } => ErrorKind::from_exit_code(*code),
        _ => None,
    };
    match kind {
        Some(kind) if kind != ErrorKind::CommandFailed => ProvisionError::AgentFailed {
            host: host.to_string(),
            kind,
            detail: err.to_string(),
        },
        _ => err,
    }
}

/// Install the build in `store` onto `host`.
///
/// `run_start` is when the whole run began; the agent's log timestamps
/// continue from it.
pub async fn update_os<H: AgentHost>(
    host: &H,
    store: Arc<dyn BlobStore>,
    options: &OsUpdateOptions,
    run_start: Instant,
    started: &StartFlag,
) -> Result<OsUpdateReport> {
    host.run_cmd("true", &[]).await.map_err(|e| {
        ProvisionError::DutUnreachablePreUpdate(format!("{}: {}", host.describe(), e))
    })?;
    started.mark();

    check_artifacts(store, options.update_minios).await?;

    let local_agent = options.agent.resolve(host).await?;
    let agent = push_agent(host, &local_agent).await?;
    info!("[os] agent pushed to {}", agent);

    let partitions = detect_partitions(host).await?;
    info!(
        "[os] DUT root is {}, flashing {}",
        partitions.active_root(),
        partitions.inactive_root()
    );

    let request = FlashRequest {
        elapsed_time_when_sent: run_start.elapsed(),
        token: options.token.clone(),
        bucket: options.bucket.clone(),
        directory: options.directory.clone(),
        clobber_stateful: options.clobber_stateful,
        clear_tpm_owner: options.clear_tpm_owner,
        update_minios: options.update_minios,
    };
    let stdout = host
        .run_with_stdin(&agent, &[], &wire::encode(&request)?)
        .await
        .map_err(|e| agent_error(&host.describe(), e))?;
    let result: FlashResult = wire::decode(&stdout)?;
    if result.needs_remediation() {
        warn!("[os] agent could not finish every post-install step: {:?}", result);
    }

    let expected_root = partitions.inactive_root();
    checked_reboot(host, &expected_root, &options.reboot).await?;
    let mut reboots = 1;

    if remediate(host, &result).await? {
        checked_reboot(host, &expected_root, &options.reboot).await?;
        reboots += 1;
    }

    host.run_cmd(ROOTFS_VERIFICATION_HELPER, &["-q"])
        .await
        .map_err(|e| ProvisionError::RootfsVerificationToggleFailed(format!("check failed: {}", e)))?;

    Ok(OsUpdateReport {
        partitions,
        result,
        reboots,
    })
}
