//! Mount point directory helpers.

use std::{
    fs::{self, DirBuilder},
    io,
    os::unix::fs::DirBuilderExt as _,
    path::Path,
};

/// Create `path` and its missing ancestors with `mode`.
pub fn mkdirs(path: &Path, mode: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// Remove `path` and then each of its ancestors that became empty.
///
/// The walk stops at the first directory that cannot be removed, at
/// `stop_at` (which is kept), or at the filesystem root. Returns the
/// number of removed directories.
pub fn rmdirs(path: &Path, stop_at: Option<&Path>) -> usize {
    let mut removed = 0;
    let mut dir = Some(path);
    while let Some(d) = dir {
        if Some(d) == stop_at || d.parent().is_none() || d.as_os_str().is_empty() {
            break;
        }
        if let Err(err) = fs::remove_dir(d) {
            if removed == 0 && err.kind() != io::ErrorKind::NotFound {
                tracing::debug!("rmdir {}: {}", d.display(), err);
            }
            break;
        }
        removed += 1;
        dir = d.parent();
    }
    removed
}
