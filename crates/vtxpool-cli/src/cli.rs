use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vtxpool::types::DeviceType;

#[derive(Parser)]
#[command(name = "vtxpoolctl", about = "Manage the shared transcoder device pool", version)]
pub struct Cli {
    #[arg(
        long,
        help = "Pool namespace, the prefix of all shared memory and lock names",
        env = "VTXPOOL_NAMESPACE",
        default_value = "vtx"
    )]
    pub namespace: String,

    #[arg(
        long,
        help = "Device directory to scan",
        env = "VTXPOOL_DEV_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/dev"
    )]
    pub dev_dir: PathBuf,

    #[arg(long, help = "Device name prefix", default_value = "nvme")]
    pub dev_prefix: String,

    #[arg(
        long,
        help = "JSON fixture of simulated cards; device scans and queries run against it",
        env = "VTXPOOL_SIM_FIXTURE"
    )]
    pub sim_fixture: Option<PathBuf>,

    #[arg(
        long,
        help = "Default log directive when RUST_LOG is unset",
        default_value = "info"
    )]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the pool from a device scan
    Init(InitArgs),
    /// Reconcile the pool against a fresh device scan
    Refresh(RefreshArgs),
    /// Register one device
    Add(AddArgs),
    /// Unregister one device
    Remove(RemoveArgs),
    /// Tear down every record and the pool index
    #[command(name = "remove-all")]
    RemoveAll,
    /// Print a snapshot of the pool
    List(ListArgs),
    /// Print pool snapshots periodically
    Monitor(MonitorArgs),
}

#[derive(Parser)]
pub struct InitArgs {
    #[arg(
        long,
        help = "Seconds to keep waiting for the first compatible device, 0 waits forever",
        default_value = "0"
    )]
    pub timeout_secs: u64,

    #[arg(long, help = "Skip the firmware compatibility check")]
    pub skip_fw_check: bool,
}

#[derive(Parser)]
pub struct RefreshArgs {
    #[arg(long, help = "Skip the firmware compatibility check")]
    pub skip_fw_check: bool,
}

#[derive(Parser)]
pub struct AddArgs {
    #[arg(long, help = "Device node path, e.g. /dev/nvme0")]
    pub device: PathBuf,

    #[arg(long, help = "Skip the firmware compatibility check")]
    pub skip_fw_check: bool,
}

#[derive(Parser)]
pub struct RemoveArgs {
    #[arg(long, help = "Device node path, e.g. /dev/nvme0")]
    pub device: PathBuf,
}

#[derive(Parser)]
pub struct ListArgs {
    #[arg(long, value_enum, help = "Limit the listing to one engine type")]
    pub device_type: Option<DeviceTypeArg>,

    #[arg(long, help = "Emit JSON instead of a table")]
    pub json: bool,
}

#[derive(Parser)]
pub struct MonitorArgs {
    #[arg(long, help = "Refresh interval in seconds", default_value = "1")]
    pub interval_secs: u64,

    #[arg(long, help = "Emit JSON instead of a table")]
    pub json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DeviceTypeArg {
    Decoder,
    Encoder,
}

impl From<DeviceTypeArg> for DeviceType {
    fn from(arg: DeviceTypeArg) -> Self {
        match arg {
            DeviceTypeArg::Decoder => DeviceType::Decoder,
            DeviceTypeArg::Encoder => DeviceType::Encoder,
        }
    }
}
