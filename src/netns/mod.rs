//! Network namespace handles and VF migration between namespaces.
//!
//! Namespace membership is a per-thread kernel property. Work that has to
//! happen "inside" a container namespace therefore runs on a dedicated,
//! scoped thread that enters the namespace through an [`NsGuard`] and leaves
//! it again before the thread exits. The calling thread never changes
//! namespace, so the host namespace stays reachable for the rest of the
//! invocation.

use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error, info};

use crate::error::{Result, SriovError};
use crate::link::{LinkControl, Scope};

/// An open handle on a network namespace
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    /// Open the namespace bound at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| SriovError::Namespace {
            path: path.clone(),
            reason: format!("failed to open: {e}"),
        })?;
        Ok(Self { path, file })
    }

    /// The namespace of the process, which is the host namespace for a
    /// plugin started by the runtime
    pub fn host() -> Result<Self> {
        Self::open("/proc/self/ns/net")
    }

    /// The namespace the calling thread is currently in
    pub fn current_thread() -> Result<Self> {
        Self::open("/proc/thread-self/ns/net")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A path other processes can open to reach this namespace, valid for as
    /// long as this handle is open
    pub fn fd_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            self.file.as_raw_fd()
        ))
    }

    /// Switch the calling thread into this namespace until the guard drops
    pub fn enter(&self) -> Result<NsGuard> {
        let previous = Self::current_thread()?;
        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(|e| SriovError::Namespace {
            path: self.path.clone(),
            reason: format!("setns failed: {e}"),
        })?;
        debug!(netns = %self.path.display(), "entered network namespace");
        Ok(NsGuard {
            previous,
            _not_send: PhantomData,
        })
    }

    /// Run `f` on a dedicated thread inside this namespace
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        thread::scope(|scope| {
            let worker = scope.spawn(|| {
                let _guard = self.enter()?;
                f()
            });
            worker.join().unwrap_or_else(|_| {
                Err(SriovError::Namespace {
                    path: self.path.clone(),
                    reason: "namespace worker thread panicked".to_string(),
                })
            })
        })
    }
}

/// Restores the previous namespace of the current thread on drop
#[must_use = "the namespace is left as soon as the guard is dropped"]
pub struct NsGuard {
    previous: NetNs,
    // Namespace membership belongs to the thread that entered it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.previous.file, CloneFlags::CLONE_NEWNET) {
            error!(
                netns = %self.previous.path.display(),
                "failed to restore network namespace: {e}"
            );
        }
    }
}

/// Name a released VF gets in the host namespace.
///
/// Kernel interface indices are unique host-wide, so concurrent releases
/// never pick the same name.
pub fn host_name(ifindex: u32) -> String {
    format!("dev{ifindex}")
}

/// Move `ifname` from the host into `target`, then rename it there to
/// `new_name`
pub fn move_to_namespace<L>(links: &L, ifname: &str, target: &NetNs, new_name: &str) -> Result<()>
where
    L: LinkControl + ?Sized,
{
    links.move_link(Scope::Host, ifname, Scope::Netns(target))?;
    links.rename_link(Scope::Netns(target), ifname, new_name)?;
    info!(
        ifname,
        new_name,
        netns = %target.path().display(),
        "moved interface into namespace"
    );
    Ok(())
}

/// Bring `ifname` back from `container` into the host namespace.
///
/// The interface is downed, renamed to [`host_name`] of its kernel index and
/// only then moved, so it never carries traffic half-migrated and never
/// collides with a host name. Returns the host-side name.
pub fn move_to_host<L>(links: &L, container: &NetNs, ifname: &str) -> Result<String>
where
    L: LinkControl + ?Sized,
{
    let scope = Scope::Netns(container);
    let ifindex = links
        .link_index(scope, ifname)?
        .ok_or_else(|| SriovError::InterfaceNotFound {
            ifname: ifname.to_string(),
            netns: container.path().display().to_string(),
        })?;
    let dev_name = host_name(ifindex);

    links.set_link_down(scope, ifname)?;
    links.rename_link(scope, ifname, &dev_name)?;
    links.move_link(scope, &dev_name, Scope::Host)?;

    info!(
        ifname,
        host_name = %dev_name,
        netns = %container.path().display(),
        "returned interface to host namespace"
    );
    Ok(dev_name)
}
