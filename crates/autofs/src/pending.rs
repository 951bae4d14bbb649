//! Mount requests waiting for a reply to the kernel.

use autofs_kernel::autofs_wqt_t;
use std::{
    collections::VecDeque,
    ffi::{OsStr, OsString},
};

/// A missing-entry request that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMount {
    token: autofs_wqt_t,
    name: OsString,
}

impl PendingMount {
    /// Return the wait queue token assigned by the kernel.
    #[inline]
    pub fn token(&self) -> autofs_wqt_t {
        self.token
    }

    /// Return the name of the requested entry.
    #[inline]
    pub fn name(&self) -> &OsStr {
        &self.name
    }
}

/// The outcome of [`PendingMounts::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    AlreadyPending,
}

/// The set of outstanding requests of one autofs mount point.
///
/// Each token and each name appears at most once.
#[derive(Debug, Default)]
pub struct PendingMounts {
    entries: VecDeque<PendingMount>,
}

impl PendingMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request unless one with the same token or name is
    /// already waiting.
    pub fn insert_if_absent(&mut self, token: autofs_wqt_t, name: &OsStr) -> Insertion {
        if self
            .entries
            .iter()
            .any(|p| p.token == token || p.name == name)
        {
            return Insertion::AlreadyPending;
        }
        self.entries.push_front(PendingMount {
            token,
            name: name.to_owned(),
        });
        Insertion::Inserted
    }

    pub fn find_by_token(&self, token: autofs_wqt_t) -> Option<&PendingMount> {
        self.entries.iter().find(|p| p.token == token)
    }

    pub fn find_by_name(&self, name: &OsStr) -> Option<&PendingMount> {
        self.entries.iter().find(|p| p.name == name)
    }

    pub fn remove_by_token(&mut self, token: autofs_wqt_t) -> Option<PendingMount> {
        let i = self.entries.iter().position(|p| p.token == token)?;
        self.entries.remove(i)
    }

    pub fn remove_by_name(&mut self, name: &OsStr) -> Option<PendingMount> {
        let i = self.entries.iter().position(|p| p.name == name)?;
        self.entries.remove(i)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the requests, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingMount> + '_ {
        self.entries.iter()
    }
}
