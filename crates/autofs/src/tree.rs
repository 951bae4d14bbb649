//! The automounter's view of its mount points.

use std::{ffi::OsStr, fmt, hash::Hash, path::Path};

/// The result of looking up a child of an autofs mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<N> {
    /// The child exists and must be mounted before it can be used.
    Found(N),

    /// The child exists and is already usable.
    Mounted(N),

    /// The lookup continues in the background and will end with a call to
    /// `Service::mount_succeeded` or `Service::mount_failed`.
    InProgress,

    /// There is no such child.
    Missing,
}

/// The result of mounting a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Mounted,

    /// See [`Lookup::InProgress`].
    InProgress,

    Failed,
}

/// The mount point tree the autofs channel serves.
pub trait MountTree {
    /// A cheap handle to a node of the tree.
    type Node: Copy + Eq + Hash + fmt::Debug;

    /// Look up `name` below `parent`, creating the node when `create` is
    /// set and the name is known to the map.
    fn lookup_child(&mut self, parent: Self::Node, name: &OsStr, create: bool)
        -> Lookup<Self::Node>;

    /// Mount a node returned by [`Lookup::Found`].
    fn mount_child(&mut self, node: Self::Node) -> MountStatus;

    /// Return the last path component of `node`.
    fn name(&self, node: Self::Node) -> &OsStr;

    /// Return the absolute mount path of `node`.
    fn path(&self, node: Self::Node) -> &Path;

    fn parent(&self, node: Self::Node) -> Option<Self::Node>;

    /// Return whether `node` is about to be mounted again after being
    /// unmounted.
    fn will_be_remounted(&self, node: Self::Node) -> bool;

    /// Called when the kernel speaks a protocol older than version 4, which
    /// cannot trigger mounts in subdirectories of an autofs.
    fn disable_subdirectory_support(&mut self) {}
}
