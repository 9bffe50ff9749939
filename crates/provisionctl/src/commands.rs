//! Subcommand implementations.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use provision_common::blob::{BlobStore, BucketIndex, GcsBlobStore, GcsBucket};
use provision_common::build::{resolve_flash_target, IMAGE_ARCHIVE_BUCKET};
use provision_common::config::ProvisionConfig;
use provision_common::engine::{with_deadline, StartFlag};
use provision_common::firmware::{self, Connection, FirmwareRequest, FirmwareService};
use provision_common::os_update::{update_os, OsUpdateOptions, RebootPolicy};
use provision_common::partition;
use provision_common::transport::{ServoHost, SshConnection, SshTarget};
use provision_common::ProvisionError;

use crate::{FirmwareArgs, FlashArgs, TOKEN_ENV};

fn ssh(target: &str, identity: Option<&std::path::PathBuf>) -> Result<SshConnection> {
    let mut target = SshTarget::parse(target)?;
    if let Some(identity) = identity {
        target = target.with_identity(identity);
    }
    Ok(SshConnection::new(target))
}

/// `provisionctl flash`
pub async fn flash(config: &ProvisionConfig, args: FlashArgs, run_start: Instant) -> Result<()> {
    let token = std::env::var(TOKEN_ENV)
        .with_context(|| format!("{} must hold a blob store access token", TOKEN_ENV))?;
    let dut = ssh(&args.target, args.identity.as_ref())?;
    let index: Arc<dyn BucketIndex> =
        Arc::new(GcsBucket::new(IMAGE_ARCHIVE_BUCKET, &token).map_err(ProvisionError::Io)?);
    let selector = args.selector();
    let agent = args.agent_binary();

    let started = StartFlag::default();
    let (target, report) = with_deadline(config.deadline.overall(), &started, async {
        let target =
            resolve_flash_target(&dut, index, args.board.as_deref(), selector).await?;
        info!("[flash] {} <- {}", args.target, target);

        let store: Arc<dyn BlobStore> = Arc::new(
            GcsBlobStore::new(&target.bucket, &target.directory, &token)
                .map_err(ProvisionError::Io)?,
        );
        let options = OsUpdateOptions {
            bucket: target.bucket.clone(),
            directory: target.directory.clone(),
            token: token.clone(),
            clobber_stateful: args.clobber_stateful,
            clear_tpm_owner: args.clear_tpm_owner,
            update_minios: args.update_minios,
            agent,
            reboot: RebootPolicy::default(),
        };
        let report = update_os(&dut, store, &options, run_start, &started).await?;
        Ok::<_, ProvisionError>((target, report))
    })
    .await?;

    println!(
        "{} now boots {} from {} ({} reboot(s), {:.1}s)",
        args.target,
        target,
        report.partitions.inactive_root(),
        report.reboots,
        run_start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// `provisionctl firmware`
pub async fn firmware(config: &ProvisionConfig, args: FirmwareArgs) -> Result<()> {
    let dut: Option<Connection> = match &args.dut {
        Some(target) => Some(Arc::new(ssh(target, args.identity.as_ref())?)),
        None => None,
    };
    let servo = match &args.servo_host {
        Some(host) => {
            let conn: Connection = Arc::new(ssh(host, args.identity.as_ref())?);
            let port = args.servo_port.unwrap_or(config.servo.port);
            Some(ServoHost::new(conn, port))
        }
        None => None,
    };

    let request = FirmwareRequest {
        board: args.board,
        model: args.model,
        main_rw: args.main_rw,
        main_ro: args.main_ro,
        ec_ro: args.ec_ro,
        pd_ro: args.pd_ro,
        force: args.force,
        use_servo: args.use_servo,
        require_servo_reset: args.require_servo_reset,
    };
    let mut svc = FirmwareService::new(request, dut, servo, config.reconnect.clone())?;
    let steps = firmware::provision(&mut svc, config.deadline.overall()).await?;

    println!("firmware updated, {} steps completed", steps.len());
    Ok(())
}

/// `provisionctl partitions`
pub fn partitions(root: &str, json: bool) -> Result<()> {
    let state = partition::resolve(root)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }
    println!("active   kernel {}  root {}", state.active_kernel(), state.active_root());
    println!(
        "inactive kernel {}  root {}  minios {}",
        state.inactive_kernel(),
        state.inactive_root(),
        state.inactive_minios()
    );
    Ok(())
}
