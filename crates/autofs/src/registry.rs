//! Association between kernel pipes and the mount points they serve.

use crate::{fdset::FdSet, nix};
use std::{fmt, os::fd::RawFd};

/// The upper bound of descriptors tracked by a registry.
///
/// It matches `FD_SETSIZE` so that every registered pipe fits into the
/// readiness set.
pub const MAX_FDS: usize = 1024;

const FALLBACK_FDS: usize = 256;

/// Compute the number of descriptors available for autofs pipes.
///
/// This is the soft `RLIMIT_NOFILE` clamped to [`MAX_FDS`].
pub fn fd_ceiling() -> usize {
    match nix::nofile_soft_limit() {
        Ok(limit) => {
            let limit = usize::try_from(limit).unwrap_or(MAX_FDS).min(MAX_FDS);
            tracing::info!("{} fd's available for autofs", limit);
            limit
        }
        Err(err) => {
            tracing::error!("getrlimit failed, defaulting to {} fd's: {}", FALLBACK_FDS, err);
            FALLBACK_FDS
        }
    }
}

/// A table from kernel pipe descriptors to mount nodes.
///
/// The registry stores node keys only and never owns the nodes.
pub struct Registry<N> {
    slots: Vec<Option<N>>,
    active: Vec<RawFd>,
}

impl<N: fmt::Debug> fmt::Debug for Registry<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.active.iter().map(|&fd| (fd, &self.slots[fd as usize])))
            .finish()
    }
}

impl<N> Registry<N>
where
    N: Copy + fmt::Debug,
{
    /// Create a registry sized by [`fd_ceiling`].
    pub fn new() -> Self {
        Self::with_capacity(fd_ceiling())
    }

    /// Create a registry accepting descriptors in `0..capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_FDS);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            active: Vec::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, fd: RawFd) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.slots.len())
    }

    /// Associate `fd` with `node`.
    ///
    /// An occupied slot is reported and overwritten. Returns `false` when
    /// `fd` does not fit into the table.
    pub fn insert(&mut self, fd: RawFd, node: N) -> bool {
        let Some(i) = self.slot(fd) else {
            tracing::error!("file descriptor {} exceeds the registry capacity", fd);
            return false;
        };
        match self.slots[i].replace(node) {
            Some(old) => {
                tracing::error!("file descriptor {} already in the hash (was {:?})", fd, old);
            }
            None => self.active.push(fd),
        }
        true
    }

    /// Drop the association of `fd`, returning the node it pointed to.
    pub fn remove(&mut self, fd: RawFd) -> Option<N> {
        let node = self.slot(fd).and_then(|i| self.slots[i].take());
        match node {
            Some(_) => {
                if let Some(pos) = self.active.iter().position(|&a| a == fd) {
                    self.active.swap_remove(pos);
                }
            }
            None => tracing::warn!("file descriptor {} not in the hash", fd),
        }
        node
    }

    pub fn get(&self, fd: RawFd) -> Option<N> {
        self.slot(fd).and_then(|i| self.slots[i])
    }

    /// Return the registered descriptors, in no particular order.
    #[inline]
    pub fn active(&self) -> &[RawFd] {
        &self.active[..]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Add every registered descriptor to `set`, returning the highest one.
    pub fn fill(&self, set: &mut FdSet) -> Option<RawFd> {
        for &fd in &self.active {
            set.insert(fd);
        }
        self.active.iter().copied().max()
    }
}

impl<N> Default for Registry<N>
where
    N: Copy + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
