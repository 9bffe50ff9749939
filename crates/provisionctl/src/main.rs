//! Provision Control - CLI for provisioning lab DUTs.
//!
//! Flashes ChromeOS builds through the on-device agent and firmware through
//! the DUT or its servo host.

mod commands;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use provision_common::build::BuildSelector;
use provision_common::config::{config_path, ProvisionConfig};
use provision_common::os_update::AgentBinary;
use provision_common::{logging, ProvisionError};

/// Environment variable holding the blob store bearer token
pub const TOKEN_ENV: &str = "PROVISION_ACCESS_TOKEN";

#[derive(Parser)]
#[command(name = "provisionctl")]
#[command(about = "Provision lab DUTs with OS images and firmware", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: /etc/provision/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the config file (RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash an OS build onto the inactive slot of a DUT
    ///
    /// Without --gs, flashes the newest build for the DUT's board.
    Flash(FlashArgs),

    /// Flash firmware from archives
    Firmware(FirmwareArgs),

    /// Show the A/B layout for a root partition
    Partitions {
        /// Active root partition, e.g. /dev/nvme0n1p3
        root: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
pub struct FlashArgs {
    /// DUT as [user@]host[:port]
    pub target: String,

    /// Build directory to flash, e.g. gs://chromeos-image-archive/brya-release/R120-15662.0.0
    #[arg(long, conflicts_with_all = ["board", "release", "milestone"])]
    pub gs: Option<String>,

    /// Board to pick a build for (default: detected from the DUT)
    #[arg(long)]
    pub board: Option<String>,

    /// Newest build whose version starts with this, e.g. R120-15662
    #[arg(long, conflicts_with = "milestone")]
    pub release: Option<String>,

    /// Newest build of this milestone, e.g. 120
    #[arg(long)]
    pub milestone: Option<u32>,

    /// Wipe the stateful partition on next boot
    #[arg(long)]
    pub clobber_stateful: bool,

    #[arg(long)]
    pub clear_tpm_owner: bool,

    /// Also flash the inactive mini-OS partition
    #[arg(long)]
    pub update_minios: bool,

    /// Agent binary to push, whatever the DUT architecture
    #[arg(long, conflicts_with = "agent_dir")]
    pub agent: Option<PathBuf>,

    /// Directory of dutagent-<arch> builds, picked by the DUT's architecture
    #[arg(long, default_value = "/usr/lib/provision")]
    pub agent_dir: PathBuf,

    /// SSH private key
    #[arg(long)]
    pub identity: Option<PathBuf>,
}

impl FlashArgs {
    pub fn selector(&self) -> BuildSelector {
        if let Some(url) = &self.gs {
            BuildSelector::Url(url.clone())
        } else if let Some(prefix) = &self.release {
            BuildSelector::VersionPrefix(prefix.clone())
        } else if let Some(milestone) = self.milestone {
            BuildSelector::Milestone(milestone)
        } else {
            BuildSelector::Latest
        }
    }

    pub fn agent_binary(&self) -> AgentBinary {
        match &self.agent {
            Some(path) => AgentBinary::File(path.clone()),
            None => AgentBinary::PerArch(self.agent_dir.clone()),
        }
    }
}

#[derive(Args)]
pub struct FirmwareArgs {
    /// DUT as [user@]host[:port]; needed unless flashing over servo
    #[arg(long)]
    pub dut: Option<String>,

    /// Servo host as [user@]host[:port]
    #[arg(long)]
    pub servo_host: Option<String>,

    /// servod port (default from config)
    #[arg(long)]
    pub servo_port: Option<u16>,

    #[arg(long, default_value = "")]
    pub board: String,

    #[arg(long, default_value = "")]
    pub model: String,

    /// Archive with the AP image for the RW region
    #[arg(long)]
    pub main_rw: Option<String>,

    /// Archive with the AP image for the RO region
    #[arg(long)]
    pub main_ro: Option<String>,

    /// Archive with the EC image
    #[arg(long)]
    pub ec_ro: Option<String>,

    /// Archive with the PD image
    #[arg(long)]
    pub pd_ro: Option<String>,

    /// Pass --force to futility
    #[arg(long)]
    pub force: bool,

    /// Flash from the servo host
    #[arg(long)]
    pub use_servo: bool,

    /// Fail instead of restarting from the OS when the servo reset fails
    #[arg(long)]
    pub require_servo_reset: bool,

    /// SSH private key
    #[arg(long)]
    pub identity: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let run_start = Instant::now();
    if let Err(e) = run(run_start).await {
        eprintln!("provisionctl: {:#}", e);
        let code = e
            .downcast_ref::<ProvisionError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(run_start: Instant) -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(config_path);
    let config = ProvisionConfig::load_from(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    logging::init(level, Duration::ZERO)?;

    match cli.command {
        Commands::Flash(args) => commands::flash(&config, args, run_start).await,
        Commands::Firmware(args) => commands::firmware(&config, args).await,
        Commands::Partitions { root, json } => commands::partitions(&root, json),
    }
}
