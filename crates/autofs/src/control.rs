//! Control commands sent to a mounted autofs.

use crate::nix;
use autofs_kernel::*;
use libc::c_ulong;
use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    path::Path,
};

/// The control channel of a mounted autofs.
///
/// The kernel answers these commands synchronously, so none of them
/// waits on anything but the command itself.
pub trait Control: Sized {
    /// Open the control channel on the root of the mounted autofs.
    fn open(mountpoint: &Path) -> io::Result<Self>;

    /// Ask the kernel for the protocol version of this mount.
    fn protocol_version(&self) -> io::Result<u32>;

    /// Tell the kernel that no more requests will be served.
    fn set_catatonic(&self) -> io::Result<()>;

    /// Wake up the lookup waiting on `token`; the entry is now mounted.
    fn ready(&self, token: autofs_wqt_t) -> io::Result<()>;

    /// Fail the lookup waiting on `token`.
    fn fail(&self, token: autofs_wqt_t) -> io::Result<()>;
}

/// The control channel backed by ioctls on the mount root.
#[derive(Debug)]
pub struct IoctlControl {
    fd: OwnedFd,
}

impl From<OwnedFd> for IoctlControl {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for IoctlControl {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for IoctlControl {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Control for IoctlControl {
    fn open(mountpoint: &Path) -> io::Result<Self> {
        nix::open_dir(mountpoint).map(Self::from)
    }

    fn protocol_version(&self) -> io::Result<u32> {
        let version = nix::ioctl_read_int(&self.fd, AUTOFS_IOC_PROTOVER)?;
        u32::try_from(version).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "kernel reported a negative protocol version",
            )
        })
    }

    fn set_catatonic(&self) -> io::Result<()> {
        nix::ioctl_arg(&self.fd, AUTOFS_IOC_CATATONIC, 0)
    }

    fn ready(&self, token: autofs_wqt_t) -> io::Result<()> {
        nix::ioctl_arg(&self.fd, AUTOFS_IOC_READY, token as c_ulong)
    }

    fn fail(&self, token: autofs_wqt_t) -> io::Result<()> {
        nix::ioctl_arg(&self.fd, AUTOFS_IOC_FAIL, token as c_ulong)
    }
}
