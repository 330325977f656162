use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sriov_cni::affinity::{cores_to_mask, Affinity};
use sriov_cni::config::{NetConf, SriovConfig};
use sriov_cni::sysfs::{VfSlot, VfTable};

/// A command line tool to inspect SR-IOV devices and tune VF affinity
#[derive(Parser)]
#[clap(name = "sriov-ctl", author, version, about)]
struct Cli {
    /// Root of the sysfs network class directory
    #[clap(long, default_value = "/sys/class/net")]
    sysfs: PathBuf,

    /// Root of procfs
    #[clap(long, default_value = "/proc")]
    procfs: PathBuf,

    /// Enable verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the virtual functions of a device
    Vfs {
        /// Physical device
        #[clap(long)]
        master: String,
    },

    /// Spread a VF's MSI interrupts across CPU cores
    Affinity {
        /// Physical device
        #[clap(long)]
        master: String,

        /// VF index
        #[clap(long)]
        vf: u32,

        /// Comma-separated CPU cores
        #[clap(long)]
        cores: String,
    },

    /// Steer received packets of an interface to CPU cores
    Rps {
        /// Interface whose rx queues are tuned
        #[clap(long)]
        nic: String,

        /// Comma-separated CPU cores
        #[clap(long)]
        cores: String,
    },

    /// Print the hex CPU mask of a core list
    Mask {
        /// Comma-separated CPU cores
        #[clap(long)]
        cores: String,
    },

    /// Generate an SR-IOV network configuration
    Generate {
        /// Physical device
        #[clap(long)]
        master: String,

        /// Network name
        #[clap(long, default_value = "sriov-network")]
        name: String,

        /// Output file path
        #[clap(long, conflicts_with = "install")]
        output: Option<PathBuf>,

        /// Write the configuration into the CNI config directory
        #[clap(long)]
        install: bool,

        /// IPAM subnet (CIDR notation)
        #[clap(long)]
        subnet: Option<String>,

        /// IPAM gateway
        #[clap(long)]
        gateway: Option<String>,
    },
}

fn describe(slot: &VfSlot) -> String {
    match slot {
        VfSlot::Free { index, ifname } => format!("  vf {index}: free ({ifname})"),
        VfSlot::Bound { index } => format!("  vf {index}: in use"),
        VfSlot::Inconsistent { index, entries } if entries.is_empty() => {
            format!("  vf {index}: inconsistent (no interface)")
        }
        VfSlot::Inconsistent { index, entries } => {
            format!("  vf {index}: inconsistent ({})", entries.iter().join(", "))
        }
        VfSlot::Unreadable { index, reason } => format!("  vf {index}: unreadable ({reason})"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    match cli.command {
        Commands::Vfs { master } => {
            let slots = VfTable::new(&cli.sysfs).list_vfs(&master)?;
            let free = slots
                .iter()
                .filter(|slot| matches!(slot, VfSlot::Free { .. }))
                .count();

            println!("{} has {} VFs, {} free:", master, slots.len(), free);
            for slot in &slots {
                println!("{}", describe(slot));
            }
        },

        Commands::Affinity { master, vf, cores } => {
            let pinned = Affinity::new(&cli.sysfs, &cli.procfs).pin_vf_irqs(&master, vf, &cores)?;
            for (irq, core) in pinned {
                println!("irq {} -> cpu {}", irq, core);
            }
        },

        Commands::Rps { nic, cores } => {
            let queues = Affinity::new(&cli.sysfs, &cli.procfs).set_rps_affinity(&nic, &cores)?;
            println!(
                "rps_cpus set to {} on {}",
                cores_to_mask(&cores)?,
                queues.iter().join(", ")
            );
        },

        Commands::Mask { cores } => {
            println!("{}", cores_to_mask(&cores)?);
        },

        Commands::Generate { master, name, output, install, subnet, gateway } => {
            let config = NetConf::new_default(&name, &master, subnet.as_deref(), gateway.as_deref());

            let output = if install {
                Some(SriovConfig::default().cni_conf_dir.join(format!("10-{}.conf", name)))
            } else {
                output
            };

            if let Some(path) = output {
                config.save(&path)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}
