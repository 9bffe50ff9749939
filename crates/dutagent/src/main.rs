//! DUT Agent - flashes the inactive slot of the device it runs on.
//!
//! Reads one `FlashRequest` from stdin, streams the build onto the inactive
//! kernel/root (and optionally mini-OS) partitions and the stateful
//! partition, runs the post-install steps, and writes one `FlashResult` to
//! stdout. Logs go to stderr.

mod device;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use provision_common::blob::{BlobStore, GcsBlobStore};
use provision_common::config::ProvisionConfig;
use provision_common::engine::{with_deadline, StartFlag};
use provision_common::flash::{ImageFlasher, StatefulInstaller};
use provision_common::orchestrator::{FlashOrchestrator, FlashPlan};
use provision_common::os_update::detect_partitions;
use provision_common::wire::{self, FlashRequest};
use provision_common::{logging, ProvisionError};

use device::{LocalShell, PostInstaller};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("dutagent: {:#}", e);
        let code = e
            .downcast_ref::<ProvisionError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run() -> Result<()> {
    let request: FlashRequest =
        wire::read_from(io::stdin().lock()).context("Failed to read flash request")?;
    let config = ProvisionConfig::load()?;
    logging::init(&config.log.level, request.elapsed_time_when_sent)?;

    info!("[agent] dutagent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("[agent] request: {:?}", request);

    let state = detect_partitions(&LocalShell).await?;
    info!(
        "[agent] booted from {}, flashing {}",
        state.active_root(),
        state.inactive_root()
    );
    let plan = FlashPlan::new(
        &state,
        request.clobber_stateful,
        request.clear_tpm_owner,
        request.update_minios,
    );

    let store: Arc<dyn BlobStore> = Arc::new(
        GcsBlobStore::new(&request.bucket, &request.directory, &request.token)
            .map_err(ProvisionError::Io)?,
    );
    let flasher = ImageFlasher::new(store.clone())
        .with_chunk_size(config.flash.effective_chunk_size())
        .with_direct_io(config.flash.direct_io);
    let installer = StatefulInstaller::new(store);
    let orchestrator = FlashOrchestrator::new(config.flash.effective_progress_interval());
    let device = PostInstaller::new(LocalShell);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[agent] interrupted, cancelling transfers");
            on_signal.cancel();
        }
    });

    let started = StartFlag::default();
    let result = with_deadline(config.deadline.overall(), &started, async {
        started.mark();
        orchestrator
            .flash_device(&plan, &flasher, &installer, &device, &cancel)
            .await
    })
    .await?;

    if result.needs_remediation() {
        warn!("[agent] handing back post-install steps to retry: {:?}", result);
    }
    info!("[agent] done");

    let mut stdout = io::stdout().lock();
    wire::write_to(&mut stdout, &result)?;
    stdout.flush().context("Failed to write flash result")?;
    Ok(())
}
