//! Readiness sets handed to `select(2)`.

use std::{fmt, mem::MaybeUninit, os::fd::RawFd};

/// A safe wrapper of `fd_set`.
///
/// Descriptors outside `0..FD_SETSIZE` are never members.
#[derive(Clone)]
pub struct FdSet {
    raw: libc::fd_set,
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[inline]
fn in_range(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
}

impl FdSet {
    pub fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            Self {
                raw: raw.assume_init(),
            }
        }
    }

    pub fn insert(&mut self, fd: RawFd) {
        if in_range(fd) {
            unsafe { libc::FD_SET(fd, &mut self.raw) };
        } else {
            tracing::warn!(fd, "descriptor does not fit into fd_set");
        }
    }

    pub fn remove(&mut self, fd: RawFd) {
        if in_range(fd) {
            unsafe { libc::FD_CLR(fd, &mut self.raw) };
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        in_range(fd) && unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    pub fn clear(&mut self) {
        unsafe { libc::FD_ZERO(&mut self.raw) };
    }

    /// Iterate over the member descriptors in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        (0..libc::FD_SETSIZE as RawFd).filter(move |&fd| self.contains(fd))
    }

    /// Return the raw pointer passed to `select(2)`.
    pub fn as_raw_mut(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}
