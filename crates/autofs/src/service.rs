//! Serve the autofs mount points of an automounter.

use crate::{
    control::{Control, IoctlControl},
    dirs,
    fdset::FdSet,
    handle::Handle,
    mount::MountOptions,
    nix,
    packet::Packet,
    pending::Insertion,
    registry::{fd_ceiling, Registry},
    tree::{Lookup, MountStatus, MountTree},
};
use autofs_kernel::{autofs_wqt_t, AUTOFS_MAX_PROTO_VERSION};
use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt,
    hash::Hash,
    io,
    os::fd::{AsRawFd, RawFd},
    path::Path,
};

/// Configuration of an autofs service.
#[derive(Debug, Clone)]
pub struct Config {
    fd_limit: Option<usize>,
    background: bool,
    bind_mounts: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fd_limit: None,
            background: false,
            bind_mounts: None,
        }
    }
}

impl Config {
    /// Set the number of descriptors available for kernel pipes.
    ///
    /// By default it is derived from `RLIMIT_NOFILE`.
    pub fn fd_limit(&mut self, limit: usize) -> &mut Self {
        self.fd_limit = Some(limit);
        self
    }

    /// Declare that the process runs as a background worker outside of the
    /// main process group.
    ///
    /// The default value is `false`.
    pub fn background(&mut self, enabled: bool) -> &mut Self {
        self.background = enabled;
        self
    }

    /// Force bind mounts on or off instead of probing the kernel version.
    pub fn bind_mounts(&mut self, enabled: bool) -> &mut Self {
        self.bind_mounts = Some(enabled);
        self
    }

    pub(crate) fn is_background(&self) -> bool {
        self.background
    }

    pub(crate) fn bind_mounts_override(&self) -> Option<bool> {
        self.bind_mounts
    }
}

/// Counters maintained by the service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Missing requests dropped because the same mount was already pending.
    pub drops: u64,
    /// Lookups started on behalf of the kernel.
    pub lookups: u64,
    /// Packets with an unrecognized type.
    pub unknown_packets: u64,
    /// Reads that ended before a whole packet arrived.
    pub short_reads: u64,
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Ready,
    Fail,
}

/// The autofs side of an automounter.
///
/// A service owns the kernel pipes of every autofs mount point along with
/// their pending requests. It is driven from a single control loop: the
/// loop fills a readiness set with [`fill_fdset`](Self::fill_fdset), waits,
/// then hands the result to [`dispatch_ready`](Self::dispatch_ready).
pub struct Service<N, C = IoctlControl> {
    registry: Registry<N>,
    handles: HashMap<N, Handle<C>>,
    stats: Stats,
}

impl<N, C> fmt::Debug for Service<N, C>
where
    N: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("registry", &self.registry)
            .field("handles", &self.handles)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<N, C> Service<N, C>
where
    N: Copy + Eq + Hash + fmt::Debug,
    C: Control,
{
    pub fn new(config: &Config) -> Self {
        let limit = config.fd_limit.unwrap_or_else(fd_ceiling);
        Self {
            registry: Registry::with_capacity(limit),
            handles: HashMap::new(),
            stats: Stats::default(),
        }
    }

    #[inline]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    #[inline]
    pub fn registry(&self) -> &Registry<N> {
        &self.registry
    }

    pub fn handle(&self, node: N) -> Option<&Handle<C>> {
        self.handles.get(&node)
    }

    // ---- handle lifecycle ----

    /// Allocate the kernel pipe of an autofs mount point.
    ///
    /// Fails with `EMFILE` when the read end does not fit into the registry;
    /// the node cannot be served by autofs in that case.
    pub fn acquire(&mut self, node: N) -> io::Result<()> {
        tracing::debug!("autofs_get_fh for {:?}", node);
        let (kernel_read, kernel_write) = nix::pipe()?;

        let fd = kernel_read.as_raw_fd();
        if usize::try_from(fd).map_or(true, |fd| fd >= self.registry.capacity()) {
            tracing::error!("autofs: kernel pipe {} exceeds the descriptor ceiling", fd);
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }

        if self.handles.contains_key(&node) {
            tracing::warn!("autofs: {:?} already has a kernel pipe, replacing it", node);
            self.release(node);
        }

        self.registry.insert(fd, node);
        self.handles
            .insert(node, Handle::new(kernel_read, kernel_write));
        Ok(())
    }

    /// Return the options for mounting the autofs of `node`.
    pub fn mount_options(&self, node: N) -> Option<MountOptions> {
        self.handles.get(&node).and_then(Handle::mount_options)
    }

    /// Finish the setup once the autofs of `node` is mounted at `mountpoint`.
    ///
    /// Returns the negotiated protocol version.
    pub fn on_mounted<T>(&mut self, tree: &mut T, node: N, mountpoint: &Path) -> io::Result<u32>
    where
        T: MountTree<Node = N>,
    {
        let handle = self.handles.get_mut(&node).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no kernel pipe for this node")
        })?;

        let version = handle.mounted(mountpoint)?;
        if version < AUTOFS_MAX_PROTO_VERSION {
            tracing::info!("Turning off autofs support for subdirectory mounts");
            tree.disable_subdirectory_support();
        }
        Ok(version)
    }

    /// Tear down the autofs channel of `node`.
    pub fn release(&mut self, node: N) {
        let Some(handle) = self.handles.remove(&node) else {
            tracing::warn!("autofs: no kernel pipe to release for {:?}", node);
            return;
        };
        self.registry.remove(handle.as_raw_fd());
        handle.release();
    }

    // ---- readiness ----

    /// Add the kernel pipes to `set`, returning the highest descriptor.
    pub fn fill_fdset(&self, set: &mut FdSet) -> Option<RawFd> {
        self.registry.fill(set)
    }

    /// Serve the kernel pipes reported ready in `set`.
    ///
    /// `nready` is the number of ready descriptors across the whole set.
    /// Served descriptors are cleared from `set`, and the count of ready
    /// descriptors that were not consumed here is returned.
    pub fn dispatch_ready<T>(&mut self, tree: &mut T, set: &mut FdSet, mut nready: usize) -> usize
    where
        T: MountTree<Node = N>,
    {
        let mut i = 0;
        while nready > 0 && i < self.registry.active().len() {
            let fd = self.registry.active()[i];
            i += 1;

            if !set.contains(fd) {
                continue;
            }
            nready -= 1;
            set.remove(fd);

            if let Some(node) = self.registry.get(fd) {
                self.dispatch(tree, node);
            }
        }
        nready
    }

    fn dispatch<T>(&mut self, tree: &mut T, node: N)
    where
        T: MountTree<Node = N>,
    {
        let Some(handle) = self.handles.get(&node) else {
            tracing::error!("autofs: {:?} is registered without a kernel pipe", node);
            return;
        };

        let raw = match handle.read_packet() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.stats.short_reads += 1;
                tracing::warn!("autofs: short read from the kernel pipe of {:?}", node);
                return;
            }
            Err(err) => {
                self.stats.short_reads += 1;
                tracing::warn!("autofs: cannot read the kernel pipe of {:?}: {}", node, err);
                return;
            }
        };

        match raw.decode() {
            Ok(Packet::Missing { token, name }) => self.handle_missing(tree, node, token, &name),
            Ok(Packet::Expire { name }) => self.handle_expire(tree, node, &name),
            Ok(Packet::Unknown { kind }) => {
                self.stats.unknown_packets += 1;
                tracing::error!("Unknown autofs packet type {}", kind);
            }
            Err(err) => tracing::error!("autofs: malformed packet: {}", err),
        }
    }

    fn handle_missing<T>(&mut self, tree: &mut T, parent: N, token: autofs_wqt_t, name: &OsStr)
    where
        T: MountTree<Node = N>,
    {
        let Some(handle) = self.handles.get_mut(&parent) else {
            return;
        };

        if handle.pending_mut().insert_if_absent(token, name) == Insertion::AlreadyPending {
            tracing::debug!(
                "Mounting of {}/{} already pending",
                tree.path(parent).display(),
                name.to_string_lossy()
            );
            self.stats.drops += 1;
            return;
        }

        tracing::trace!("lookup({}, {:?})", tree.path(parent).display(), name);
        self.stats.lookups += 1;

        let status = match tree.lookup_child(parent, name, true) {
            Lookup::Found(child) => tree.mount_child(child),
            Lookup::Mounted(_) => MountStatus::Mounted,
            Lookup::InProgress => MountStatus::InProgress,
            Lookup::Missing => MountStatus::Failed,
        };

        match status {
            MountStatus::Mounted => {
                tracing::info!(
                    "autofs: mounting {} succeeded",
                    tree.path(parent).join(name).display()
                );
                self.reply(parent, name, Reply::Ready);
            }
            MountStatus::InProgress => {
                tracing::debug!("Mount still pending, not sending autofs reply yet");
            }
            MountStatus::Failed => {
                tracing::info!("autofs: lookup of {} failed", name.to_string_lossy());
                self.reply(parent, name, Reply::Fail);
            }
        }
    }

    fn handle_expire<T>(&mut self, tree: &T, parent: N, name: &OsStr)
    where
        T: MountTree<Node = N>,
    {
        // Expiry is not implemented; the request is logged and dropped.
        tracing::debug!(
            "autofs: ignoring expire request for {}/{}",
            tree.path(parent).display(),
            name.to_string_lossy()
        );
    }

    /// Answer the request pending on `name` below `parent`, if there is one.
    ///
    /// Returns whether a request was found.
    fn reply(&mut self, parent: N, name: &OsStr, reply: Reply) -> bool {
        let Some(handle) = self.handles.get_mut(&parent) else {
            return false;
        };
        let Some(pending) = handle.pending_mut().remove_by_name(name) else {
            return false;
        };

        let Some(control) = handle.control() else {
            tracing::error!(
                "autofs: no control channel to answer token {}",
                pending.token()
            );
            return true;
        };

        let (res, command) = match reply {
            Reply::Ready => (control.ready(pending.token()), "AUTOFS_IOC_READY"),
            Reply::Fail => (control.fail(pending.token()), "AUTOFS_IOC_FAIL"),
        };
        if let Err(err) = res {
            tracing::error!("{}: {}", command, err);
        }
        true
    }

    // ---- mount lifecycle ----

    /// Called when a mount started for `node` completed.
    pub fn mount_succeeded<T>(&mut self, tree: &T, node: N)
    where
        T: MountTree<Node = N>,
    {
        let Some(parent) = tree.parent(node) else {
            return;
        };
        if self.reply(parent, tree.name(node), Reply::Ready) {
            tracing::info!("autofs: mounting {} succeeded", tree.path(node).display());
        }
    }

    /// Called when a mount started for `node` failed.
    pub fn mount_failed<T>(&mut self, tree: &T, node: N)
    where
        T: MountTree<Node = N>,
    {
        let Some(parent) = tree.parent(node) else {
            return;
        };
        let waiting = self
            .handles
            .get(&parent)
            .map_or(false, |h| h.pending().find_by_name(tree.name(node)).is_some());
        if !waiting {
            return;
        }

        dirs::rmdirs(tree.path(node), Some(tree.path(parent)));
        tracing::info!("autofs: mounting {} failed", tree.path(node).display());
        self.reply(parent, tree.name(node), Reply::Fail);
    }

    /// Called when `node` was unmounted.
    ///
    /// The mount point directory is kept when the node is remounted, since
    /// removing it would fail any access queued on it.
    pub fn unmount_succeeded<T>(&self, tree: &T, node: N)
    where
        T: MountTree<Node = N>,
    {
        if tree.will_be_remounted(node) {
            return;
        }
        let path = tree.path(node);
        tracing::info!("autofs: removing mountpoint directory {}", path.display());
        let stop_at = tree.parent(node).map(|parent| tree.path(parent));
        dirs::rmdirs(path, stop_at);
    }

    /// Called when unmounting `node` failed. The mount point stays as is.
    pub fn unmount_failed<T>(&self, _tree: &T, _node: N)
    where
        T: MountTree<Node = N>,
    {
    }
}
