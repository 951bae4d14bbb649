//! The kernel channel of an automounter speaking the Linux autofs protocol.
//!
//! The kernel blocks lookups in an unmounted autofs directory and sends a
//! *missing* packet over a pipe. A [`Service`] reads those packets, asks the
//! automounter's [`MountTree`] to look up and mount the entry, and answers
//! the kernel once the mount resolved, either inline or later through the
//! mount lifecycle callbacks.
//!
//! ```no_run
//! # use autofs::{FdSet, MountTree, Service, Config};
//! # fn serve<T: MountTree<Node = u32>>(tree: &mut T, root: u32) -> std::io::Result<()> {
//! let mut service: Service<u32> = Service::new(&Config::default());
//! service.acquire(root)?;
//! let opts = service.mount_options(root).expect("kernel pipe is open");
//! autofs::mount::mount_autofs("amd".as_ref(), "/net".as_ref(), &opts)?;
//! service.on_mounted(tree, root, "/net".as_ref())?;
//!
//! loop {
//!     let mut set = FdSet::new();
//!     let nfds = service.fill_fdset(&mut set).map_or(0, |fd| fd + 1);
//!     let n = unsafe {
//!         libc::select(
//!             nfds,
//!             set.as_raw_mut(),
//!             std::ptr::null_mut(),
//!             std::ptr::null_mut(),
//!             std::ptr::null_mut(),
//!         )
//!     };
//!     if n > 0 {
//!         service.dispatch_ready(tree, &mut set, n as usize);
//!     }
//! }
//! # }
//! ```

#![forbid(clippy::todo, clippy::unimplemented)]

#[macro_use]
mod nix;

mod decoder;
mod service;

pub mod control;
pub mod dirs;
pub mod fdset;
pub mod handle;
pub mod link;
pub mod mount;
pub mod packet;
pub mod pending;
pub mod registry;
pub mod tree;

pub use crate::{
    control::{Control, IoctlControl},
    decoder::DecodeError,
    fdset::FdSet,
    handle::Handle,
    link::{LinkKind, LinkMount},
    packet::Packet,
    pending::{PendingMount, PendingMounts},
    registry::Registry,
    service::{Config, Service, Stats},
    tree::{Lookup, MountStatus, MountTree},
};
