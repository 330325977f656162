//! Virtual function discovery through the kernel's network device class.
//!
//! A physical device `<master>` exposes its VF count in
//! `<root>/<master>/device/sriov_numvfs` and, for every VF `i`, a directory
//! `<root>/<master>/device/virtfn<i>/net` listing the VF's network interface
//! as long as that interface lives in the host namespace. Once a VF has been
//! moved into a container its listing disappears from the host's view, which
//! is what makes it "bound".

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SriovError};

/// State of one VF slot as seen from the host namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfSlot {
    /// The VF's interface is in the host namespace and can be claimed
    Free { index: u32, ifname: String },
    /// No interface is visible, the VF belongs to another namespace
    Bound { index: u32 },
    /// The listing exists but does not hold exactly one interface
    Inconsistent { index: u32, entries: Vec<String> },
    /// The listing exists but could not be read
    Unreadable { index: u32, reason: String },
}

impl VfSlot {
    pub fn index(&self) -> u32 {
        match self {
            VfSlot::Free { index, .. }
            | VfSlot::Bound { index }
            | VfSlot::Inconsistent { index, .. }
            | VfSlot::Unreadable { index, .. } => *index,
        }
    }
}

/// Read-only view of the VF tables under a sysfs net class root
#[derive(Debug, Clone)]
pub struct VfTable {
    root: PathBuf,
}

impl VfTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_dir(&self, master: &str) -> PathBuf {
        self.root.join(master).join("device")
    }

    /// Directory of VF `index` of `master`
    pub fn vf_dir(&self, master: &str, index: u32) -> PathBuf {
        self.device_dir(master).join(format!("virtfn{index}"))
    }

    /// Number of VFs configured on `master`
    pub fn num_vfs(&self, master: &str) -> Result<u32> {
        let path = self.device_dir(master).join("sriov_numvfs");
        let no_vfs = |reason: String| SriovError::NoVfsConfigured {
            master: master.to_string(),
            reason,
        };

        let data = fs::read_to_string(&path)
            .map_err(|e| no_vfs(format!("failed to read {}: {e}", path.display())))?;
        let data = data.trim();
        if data.is_empty() {
            return Err(no_vfs(format!("no data in {}", path.display())));
        }

        let total: i64 = data
            .parse()
            .map_err(|e| no_vfs(format!("invalid sriov_numvfs {data:?}: {e}")))?;
        if total <= 0 {
            return Err(no_vfs(format!("sriov_numvfs is {total}")));
        }

        u32::try_from(total).map_err(|_| no_vfs(format!("sriov_numvfs {total} is out of range")))
    }

    /// Inspect a single VF slot
    pub fn slot(&self, master: &str, index: u32) -> VfSlot {
        let net_dir = self.vf_dir(master, index).join("net");
        let entries = match fs::read_dir(&net_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return VfSlot::Bound { index },
            Err(e) => {
                return VfSlot::Unreadable {
                    index,
                    reason: format!("failed to read {}: {e}", net_dir.display()),
                }
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Err(e) => {
                    return VfSlot::Unreadable {
                        index,
                        reason: format!("failed to read {}: {e}", net_dir.display()),
                    }
                }
            }
        }

        if names.len() == 1 {
            VfSlot::Free {
                index,
                ifname: names.remove(0),
            }
        } else {
            names.sort();
            VfSlot::Inconsistent {
                index,
                entries: names,
            }
        }
    }

    /// Every VF slot of `master`, in index order
    pub fn list_vfs(&self, master: &str) -> Result<Vec<VfSlot>> {
        let total = self.num_vfs(master)?;
        Ok((0..total).map(|index| self.slot(master, index)).collect())
    }

    /// Find the lowest-indexed VF whose interface is still in the host namespace
    pub fn find_free_vf(&self, master: &str) -> Result<(u32, String)> {
        let total = self.num_vfs(master)?;

        for index in 0..total {
            match self.slot(master, index) {
                VfSlot::Free { index, ifname } => {
                    debug!(master, vf = index, %ifname, "found free vf");
                    return Ok((index, ifname));
                }
                VfSlot::Bound { .. } => {}
                VfSlot::Inconsistent { entries, .. } => {
                    warn!(master, vf = index, ?entries, "skipping vf without a single interface");
                }
                VfSlot::Unreadable { reason, .. } => {
                    warn!(master, vf = index, %reason, "skipping unreadable vf");
                }
            }
        }

        Err(SriovError::NoFreeVf {
            master: master.to_string(),
            total,
        })
    }

    /// Interface name of an explicitly requested VF
    pub fn vf_interface(&self, master: &str, index: u32) -> Result<String> {
        let unavailable = |reason: String| SriovError::VfUnavailable {
            master: master.to_string(),
            vf: index,
            reason,
        };

        match self.slot(master, index) {
            VfSlot::Free { ifname, .. } => Ok(ifname),
            VfSlot::Bound { .. } => Err(unavailable(
                "no interface in the host namespace, it may already be in use".to_string(),
            )),
            VfSlot::Inconsistent { entries, .. } => Err(unavailable(format!(
                "expected one interface, found {entries:?}"
            ))),
            VfSlot::Unreadable { reason, .. } => Err(unavailable(reason)),
        }
    }
}
