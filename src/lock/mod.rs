//! Per-master advisory locking.
//!
//! One lock file per physical device under the configured lock directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{Result, SriovError};

/// Exclusive advisory lock over the VF pool of one master device.
///
/// Held from before discovery until the chosen VF has left the host
/// namespace, so two concurrent invocations cannot claim the same free VF.
/// The kernel drops the lock when the guard is dropped or the process exits.
pub struct MasterLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl MasterLock {
    /// Block until the lock for `master` under `dir` is held
    pub fn acquire(dir: &Path, master: &str) -> Result<Self> {
        let lock_error = |reason: String| SriovError::Lock {
            master: master.to_string(),
            reason,
        };

        fs::create_dir_all(dir)
            .map_err(|e| lock_error(format!("failed to create {}: {e}", dir.display())))?;

        let path = dir.join(format!("{master}.lock"));
        let file = File::options()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| lock_error(format!("failed to open {}: {e}", path.display())))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| lock_error(format!("flock {}: {errno}", path.display())))?;

        debug!(master, path = %path.display(), "acquired master lock");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
