//! Mount syscalls used around the autofs channel.

use crate::nix;
use autofs_kernel::{AUTOFS_MAX_PROTO_VERSION, AUTOFS_MIN_PROTO_VERSION};
use std::{
    ffi::OsStr,
    fmt, io,
    os::fd::RawFd,
    path::Path,
};

/// The option string passed to the autofs mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    fd: RawFd,
    min_proto: u32,
    max_proto: u32,
}

impl MountOptions {
    /// Create the options handing `fd` over to the kernel.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            min_proto: AUTOFS_MIN_PROTO_VERSION,
            max_proto: AUTOFS_MAX_PROTO_VERSION,
        }
    }

    /// Return the descriptor the kernel writes packets to.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fd={},minproto={},maxproto={}",
            self.fd, self.min_proto, self.max_proto
        )
    }
}

/// Mount an autofs on `mountpoint`.
///
/// `fsname` shows up as the source in the mount table.
pub fn mount_autofs(fsname: &OsStr, mountpoint: &Path, opts: &MountOptions) -> io::Result<()> {
    let opts = opts.to_string();
    tracing::debug!("mount -t autofs -o {} {:?} {}", opts, fsname, mountpoint.display());
    nix::mount(
        fsname,
        mountpoint,
        OsStr::new("autofs"),
        0,
        Some(OsStr::new(&opts)),
    )
}

/// Unmount the filesystem mounted on `mountpoint`.
pub fn unmount(mountpoint: &Path) -> io::Result<()> {
    nix::umount(mountpoint)
}

/// The mount operations needed by the link strategy.
pub trait Mounter {
    /// Make the directory `source` visible at `target`.
    fn bind(&mut self, source: &Path, target: &Path) -> io::Result<()>;

    /// Undo a bind mount at `target`.
    fn unmount(&mut self, target: &Path) -> io::Result<()>;
}

impl<M: ?Sized> Mounter for &mut M
where
    M: Mounter,
{
    #[inline]
    fn bind(&mut self, source: &Path, target: &Path) -> io::Result<()> {
        (**self).bind(source, target)
    }

    #[inline]
    fn unmount(&mut self, target: &Path) -> io::Result<()> {
        (**self).unmount(target)
    }
}

/// A `Mounter` issuing the syscalls directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind(&mut self, source: &Path, target: &Path) -> io::Result<()> {
        nix::mount(
            source.as_os_str(),
            target,
            OsStr::new("bind"),
            libc::MS_BIND,
            None,
        )
    }

    fn unmount(&mut self, target: &Path) -> io::Result<()> {
        unmount(target)
    }
}

/// A kernel version triple, comparable in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion(pub u32, pub u32, pub u32);

impl KernelVersion {
    /// The first release with working bind mounts.
    pub const BIND_MOUNTS: Self = Self(2, 4, 0);

    /// Parse the leading `major.minor.patch` of a release string.
    ///
    /// Missing components are read as zero, e.g. `6.9-rc1` is `6.9.0`.
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let mut next = || parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let minor = next();
        let patch = next();
        Some(Self(major, minor, patch))
    }

    /// Return the version of the running kernel.
    pub fn current() -> io::Result<Self> {
        let release = nix::kernel_release()?;
        Self::parse(&release).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized kernel release: {}", release),
            )
        })
    }
}

/// Return whether the running kernel supports bind mounts.
pub fn bind_mounts_supported() -> bool {
    match KernelVersion::current() {
        Ok(version) => version >= KernelVersion::BIND_MOUNTS,
        Err(err) => {
            tracing::warn!("cannot determine the kernel version, not using bind mounts: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_opts_encode() {
        assert_eq!(MountOptions::new(5).to_string(), "fd=5,minproto=3,maxproto=4");
        assert_eq!(MountOptions::new(17).fd(), 17);
    }

    #[test]
    fn kernel_version_parse() {
        assert_eq!(
            KernelVersion::parse("6.1.0-13-amd64"),
            Some(KernelVersion(6, 1, 0))
        );
        assert_eq!(KernelVersion::parse("2.4.20"), Some(KernelVersion(2, 4, 20)));
        assert_eq!(KernelVersion::parse("6.9-rc1"), Some(KernelVersion(6, 9, 0)));
        assert_eq!(KernelVersion::parse("5"), Some(KernelVersion(5, 0, 0)));
        assert_eq!(KernelVersion::parse("linux"), None);
    }

    #[test]
    fn kernel_version_order() {
        assert!(KernelVersion(2, 2, 19) < KernelVersion::BIND_MOUNTS);
        assert!(KernelVersion(2, 4, 0) >= KernelVersion::BIND_MOUNTS);
        assert!(KernelVersion(6, 1, 0) > KernelVersion(2, 6, 39));
    }

    #[test]
    fn running_kernel_supports_bind_mounts() {
        assert!(KernelVersion::current().is_ok());
        assert!(bind_mounts_supported());
    }
}
