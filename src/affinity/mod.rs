//! IRQ and RPS CPU affinity for VF interfaces.
//!
//! Not part of attach/detach. `sriov-ctl` uses this to pin a VF's MSI
//! interrupts and receive packet steering to the cores named by `CORES`.

use std::fs;
use std::path::PathBuf;

use itertools::Itertools;
use tracing::info;

use crate::error::{Result, SriovError};

/// Cores at or above this index cannot be expressed in a single mask word
pub const MAX_CORES: u32 = 64;

/// Parse a comma-separated core list into sorted, unique core indices
pub fn parse_cores(cores: &str) -> Result<Vec<u32>> {
    let invalid = |reason: String| SriovError::InvalidCores {
        cores: cores.to_string(),
        reason,
    };

    let parsed = cores
        .split(',')
        .map(|core| {
            let core = core.trim();
            let index: u32 = core
                .parse()
                .map_err(|e| invalid(format!("{core:?} is not a core index: {e}")))?;
            if index >= MAX_CORES {
                return Err(invalid(format!(
                    "core {index} is out of range, must be smaller than {MAX_CORES}"
                )));
            }
            Ok(index)
        })
        .collect::<Result<Vec<u32>>>()?;

    Ok(parsed.into_iter().sorted().dedup().collect())
}

/// Hex CPU mask for a core list, e.g. `"1,2,3,4"` is `"1e"`
pub fn cores_to_mask(cores: &str) -> Result<String> {
    let mask = parse_cores(cores)?
        .into_iter()
        .fold(0u64, |mask, core| mask | (1u64 << core));
    Ok(format!("{mask:x}"))
}

/// Affinity control rooted at a sysfs net class directory and a procfs root
#[derive(Debug, Clone)]
pub struct Affinity {
    sysfs_net_dir: PathBuf,
    proc_dir: PathBuf,
}

impl Affinity {
    pub fn new(sysfs_net_dir: impl Into<PathBuf>, proc_dir: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_net_dir: sysfs_net_dir.into(),
            proc_dir: proc_dir.into(),
        }
    }

    /// MSI interrupt numbers of VF `vf` of `master`
    pub fn vf_irqs(&self, master: &str, vf: u32) -> Result<Vec<u32>> {
        let dir = self
            .sysfs_net_dir
            .join(master)
            .join("device")
            .join(format!("virtfn{vf}"))
            .join("msi_irqs");

        let entries = fs::read_dir(&dir)
            .map_err(|e| SriovError::io(format!("failed to read {}", dir.display()), e))?;

        let mut irqs = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| SriovError::io(format!("failed to read {}", dir.display()), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let irq = name.parse::<u32>().map_err(|e| {
                SriovError::Affinity(format!("unexpected entry {name:?} in {}: {e}", dir.display()))
            })?;
            irqs.push(irq);
        }

        if irqs.is_empty() {
            return Err(SriovError::Affinity(format!(
                "vf {vf} of {master:?} has no MSI interrupts"
            )));
        }
        irqs.sort_unstable();
        Ok(irqs)
    }

    /// Pin `irq` to the single CPU `core`
    pub fn set_irq_affinity(&self, irq: u32, core: u32) -> Result<()> {
        let path = self
            .proc_dir
            .join("irq")
            .join(irq.to_string())
            .join("smp_affinity");
        if !path.exists() {
            return Err(SriovError::Affinity(format!("{} does not exist", path.display())));
        }
        if core >= MAX_CORES {
            return Err(SriovError::InvalidCores {
                cores: core.to_string(),
                reason: format!("CPU core value must be smaller than {MAX_CORES}"),
            });
        }

        let mask = format!("{:x}", 1u64 << core);
        fs::write(&path, &mask)
            .map_err(|e| SriovError::io(format!("failed to write affinity {}", path.display()), e))
    }

    /// Spread the MSI interrupts of a VF round-robin across `cores`
    pub fn pin_vf_irqs(&self, master: &str, vf: u32, cores: &str) -> Result<Vec<(u32, u32)>> {
        let cores = parse_cores(cores)?;
        let irqs = self.vf_irqs(master, vf)?;

        let pinned: Vec<(u32, u32)> = irqs.into_iter().zip(cores.into_iter().cycle()).collect();
        for (irq, core) in &pinned {
            self.set_irq_affinity(*irq, *core)?;
        }
        info!(master, vf, ?pinned, "pinned vf interrupts");
        Ok(pinned)
    }

    /// Write the mask of `cores` to the `rps_cpus` of every receive queue of
    /// `nic`, returning the queues touched
    pub fn set_rps_affinity(&self, nic: &str, cores: &str) -> Result<Vec<String>> {
        let queues_dir = self.sysfs_net_dir.join(nic).join("queues");
        let entries = fs::read_dir(&queues_dir)
            .map_err(|e| SriovError::io(format!("failed to read {}", queues_dir.display()), e))?;

        let mask = cores_to_mask(cores)?;
        let mut queues = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                SriovError::io(format!("failed to read {}", queues_dir.display()), e)
            })?;
            let queue = entry.file_name().to_string_lossy().into_owned();
            if !queue.starts_with("rx-") {
                continue;
            }
            let rps_cpus = entry.path().join("rps_cpus");
            fs::write(&rps_cpus, &mask).map_err(|e| {
                SriovError::io(format!("failed to write {}", rps_cpus.display()), e)
            })?;
            queues.push(queue);
        }

        queues.sort();
        info!(nic, %mask, ?queues, "set rps affinity");
        Ok(queues)
    }
}
