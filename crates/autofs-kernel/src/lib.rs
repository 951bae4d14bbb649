//! autofs application binary interface for `autofs`.
//!
//! The binding covers the version 3 and 4 packets from `linux/auto_fs.h`.

#![allow(nonstandard_style)]

use libc::{c_int, c_ulong};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The lowest protocol version spoken by this side of the channel.
pub const AUTOFS_MIN_PROTO_VERSION: u32 = 3;

/// The highest protocol version spoken by this side of the channel.
pub const AUTOFS_MAX_PROTO_VERSION: u32 = 4;

/// The maximum length of a path component carried by a packet.
pub const NAME_MAX: usize = 255;

// Packet types.
pub const autofs_ptype_missing: c_int = 0;
pub const autofs_ptype_expire: c_int = 1;
pub const autofs_ptype_expire_multi: c_int = 2;

/// Wait queue token.
///
/// The kernel uses `unsigned long` only on ia64 and alpha, neither of which
/// is a Rust target.
pub type autofs_wqt_t = u32;

// Ioctls issued against the root of a mounted autofs.
pub const AUTOFS_IOCTL: u32 = 0x93;
pub const AUTOFS_IOC_READY: c_ulong = libc::_IO(AUTOFS_IOCTL, 0x60);
pub const AUTOFS_IOC_FAIL: c_ulong = libc::_IO(AUTOFS_IOCTL, 0x61);
pub const AUTOFS_IOC_CATATONIC: c_ulong = libc::_IO(AUTOFS_IOCTL, 0x62);
pub const AUTOFS_IOC_PROTOVER: c_ulong = libc::_IOR::<c_int>(AUTOFS_IOCTL, 0x63);
pub const AUTOFS_IOC_SETTIMEOUT: c_ulong = libc::_IOWR::<c_ulong>(AUTOFS_IOCTL, 0x64);
pub const AUTOFS_IOC_EXPIRE: c_ulong = libc::_IOR::<autofs_packet_expire>(AUTOFS_IOCTL, 0x65);

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct autofs_packet_hdr {
    pub proto_version: c_int,
    pub type_: c_int,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct autofs_packet_missing {
    pub hdr: autofs_packet_hdr,
    pub wait_queue_token: autofs_wqt_t,
    pub len: c_int,
    pub name: [u8; NAME_MAX + 1],
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct autofs_packet_expire {
    pub hdr: autofs_packet_hdr,
    pub len: c_int,
    pub name: [u8; NAME_MAX + 1],
}

// v4 only
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct autofs_packet_expire_multi {
    pub hdr: autofs_packet_hdr,
    pub wait_queue_token: autofs_wqt_t,
    pub len: c_int,
    pub name: [u8; NAME_MAX + 1],
}

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// The size of `union autofs_packet_union`, i.e. the length of a single read
/// from the kernel pipe.
pub const AUTOFS_PACKET_SIZE: usize = max(
    core::mem::size_of::<autofs_packet_missing>(),
    max(
        core::mem::size_of::<autofs_packet_expire>(),
        core::mem::size_of::<autofs_packet_expire_multi>(),
    ),
);
