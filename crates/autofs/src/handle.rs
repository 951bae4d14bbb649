//! Per mount point state of the autofs channel.

use crate::{
    control::Control,
    mount::MountOptions,
    nix,
    packet::{read_packet, RawPacket},
    pending::PendingMounts,
};
use autofs_kernel::{AUTOFS_MAX_PROTO_VERSION, AUTOFS_MIN_PROTO_VERSION};
use std::{
    fmt, io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    path::Path,
};

/// The descriptors and outstanding requests of one autofs mount point.
pub struct Handle<C> {
    kernel_read: OwnedFd,
    kernel_write: Option<OwnedFd>,
    control: Option<C>,
    version: u32,
    pending: PendingMounts,
}

impl<C> fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kernel_read", &self.kernel_read)
            .field("kernel_write", &self.kernel_write)
            .field("control", &self.control.is_some())
            .field("version", &self.version)
            .field("pending", &self.pending)
            .finish()
    }
}

impl<C> Handle<C>
where
    C: Control,
{
    pub(crate) fn new(kernel_read: OwnedFd, kernel_write: OwnedFd) -> Self {
        Self {
            kernel_read,
            kernel_write: Some(kernel_write),
            control: None,
            version: AUTOFS_MIN_PROTO_VERSION,
            pending: PendingMounts::new(),
        }
    }

    /// Return the pipe end the kernel requests are read from.
    #[inline]
    pub fn kernel_read(&self) -> BorrowedFd<'_> {
        self.kernel_read.as_fd()
    }

    /// Return the pipe end handed to the kernel, until the mount consumed it.
    #[inline]
    pub fn kernel_write(&self) -> Option<BorrowedFd<'_>> {
        self.kernel_write.as_ref().map(|fd| fd.as_fd())
    }

    #[inline]
    pub fn control(&self) -> Option<&C> {
        self.control.as_ref()
    }

    /// Return the negotiated protocol version.
    #[inline]
    pub fn protocol_version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn pending(&self) -> &PendingMounts {
        &self.pending
    }

    #[inline]
    pub(crate) fn pending_mut(&mut self) -> &mut PendingMounts {
        &mut self.pending
    }

    /// Build the mount options, or `None` once the kernel end was closed.
    pub fn mount_options(&self) -> Option<MountOptions> {
        self.kernel_write
            .as_ref()
            .map(|fd| MountOptions::new(fd.as_raw_fd()))
    }

    pub(crate) fn read_packet(&self) -> io::Result<Option<RawPacket>> {
        read_packet(KernelPipe(self.kernel_read.as_fd()))
    }

    /// Switch to the mounted state and negotiate the protocol version.
    ///
    /// A control channel that cannot be opened is treated like a failed
    /// version query: the handle stays registered at version 3.
    pub(crate) fn mounted(&mut self, mountpoint: &Path) -> io::Result<u32> {
        // The descriptor number may be reused once closed; forget it here.
        drop(self.kernel_write.take());

        let control = match C::open(mountpoint) {
            Ok(control) => control,
            Err(err) => {
                // The mount stands; its requests cannot be answered.
                tracing::error!("cannot open {}: {}", mountpoint.display(), err);
                tracing::error!(
                    "autofs: assuming protocol version {}",
                    AUTOFS_MIN_PROTO_VERSION
                );
                self.control = None;
                self.version = AUTOFS_MIN_PROTO_VERSION;
                return Ok(self.version);
            }
        };

        self.version = match control.protocol_version() {
            Ok(version) => {
                let clamped = version.clamp(AUTOFS_MIN_PROTO_VERSION, AUTOFS_MAX_PROTO_VERSION);
                if clamped != version {
                    tracing::warn!("autofs: kernel reported protocol version {}", version);
                }
                tracing::info!("autofs: using protocol version {}", clamped);
                clamped
            }
            Err(err) => {
                tracing::error!("AUTOFS_IOC_PROTOVER: {}", err);
                tracing::error!(
                    "autofs: assuming protocol version {}",
                    AUTOFS_MIN_PROTO_VERSION
                );
                AUTOFS_MIN_PROTO_VERSION
            }
        };
        self.control = Some(control);

        Ok(self.version)
    }

    /// Tear the channel down.
    ///
    /// Every descriptor is owned, so each one is closed exactly once when
    /// the handle is dropped.
    pub(crate) fn release(mut self) {
        if let Some(control) = self.control.take() {
            if let Err(err) = control.set_catatonic() {
                tracing::error!("AUTOFS_IOC_CATATONIC: {}", err);
            }
        }
        if !self.pending.is_empty() {
            tracing::debug!(
                "dropping {} pending request(s) on release",
                self.pending.len()
            );
            self.pending.clear();
        }
    }
}

struct KernelPipe<'a>(BorrowedFd<'a>);

impl io::Read for KernelPipe<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        nix::read(&self.0, buf)
    }
}

impl<C> AsRawFd for Handle<C> {
    fn as_raw_fd(&self) -> RawFd {
        self.kernel_read.as_raw_fd()
    }
}
