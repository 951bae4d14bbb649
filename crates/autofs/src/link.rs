//! Materialize a mount point as a bind mount or a symbolic link.

use crate::{
    dirs,
    mount::{bind_mounts_supported, Mounter, SysMounter},
    nix,
    service::Config,
};
use std::{fs, io, os::unix::fs::symlink, path::Path};

/// How a link mount was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bind,
    Symlink,
}

/// Run `f` in a process group of its own.
///
/// A `stat` issued from the automounter's process group is not answered by
/// the kernel with a mount request, so probes that have to trigger nested
/// automounts run here.
///
/// When the process cannot leave its group (a session leader, for one) the
/// probe runs in place and nothing is restored. Failing to return to the
/// original group is an error, since the process is then left in an
/// unknown group.
pub fn with_own_process_group<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> R,
{
    let saved = nix::getpgrp();
    if let Err(err) = nix::setpgid(0, 0) {
        tracing::warn!("autofs: cannot leave process group {}: {}", saved, err);
        return Ok(f());
    }

    let ret = f();

    if nix::getpgrp() == saved {
        // already the leader of its own group.
        return Ok(ret);
    }
    if let Err(err) = nix::setpgid(0, saved) {
        tracing::error!("autofs: cannot restore pgrp: {}", err);
        tracing::error!("autofs: aborting the mount");
        return Err(err);
    }
    Ok(ret)
}

/// The bind-or-symlink mount strategy.
#[derive(Debug)]
pub struct LinkMount<M = SysMounter> {
    mounter: M,
    bind_works: bool,
    background: bool,
}

impl LinkMount<SysMounter> {
    pub fn new(config: &Config) -> Self {
        Self::with_mounter(config, SysMounter)
    }
}

impl<M> LinkMount<M>
where
    M: Mounter,
{
    pub fn with_mounter(config: &Config, mounter: M) -> Self {
        let bind_works = config
            .bind_mounts_override()
            .unwrap_or_else(bind_mounts_supported);
        Self {
            mounter,
            bind_works,
            background: config.is_background(),
        }
    }

    #[inline]
    pub fn bind_works(&self) -> bool {
        self.bind_works
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Make `target` reachable at `path`.
    ///
    /// A bind mount is preferred; a symbolic link is created when the
    /// kernel cannot bind mount, the target cannot be probed, the target is
    /// a symbolic link itself, or the bind mount fails.
    pub fn mount(&mut self, path: &Path, target: &Path) -> io::Result<LinkKind> {
        if self.bind_works && self.try_bind(path, target)? {
            return Ok(LinkKind::Bind);
        }

        tracing::info!(
            "autofs: symlinking {} -> {}",
            path.display(),
            target.display()
        );
        symlink(target, path)?;
        Ok(LinkKind::Symlink)
    }

    /// Returns `Ok(false)` when the caller should fall back to a symlink.
    fn try_bind(&mut self, path: &Path, target: &Path) -> io::Result<bool> {
        // Bind mounts neither follow symlinks nor accept missing targets, so
        // the target is resolved first. This also triggers any automount the
        // target depends on.
        let probe = if self.background {
            fs::metadata(target)
        } else {
            with_own_process_group(|| fs::metadata(target))?
        };
        if let Err(err) = probe {
            tracing::debug!("autofs: cannot stat {}: {}", target.display(), err);
            return Ok(false);
        }

        match fs::symlink_metadata(target) {
            Ok(meta) if !meta.file_type().is_symlink() => (),
            _ => return Ok(false),
        }

        tracing::info!(
            "autofs: bind-mounting {} -> {}",
            path.display(),
            target.display()
        );
        let res = dirs::mkdirs(path, 0o555).and_then(|()| self.mounter.bind(target, path));
        if let Err(err) = res {
            tracing::warn!("autofs: bind mount of {} failed: {}", path.display(), err);
            let _ = fs::remove_dir(path);
            return Ok(false);
        }
        Ok(true)
    }

    /// Undo [`mount`](Self::mount), choosing by the current type of `path`.
    pub fn unmount(&mut self, path: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        if meta.is_dir() {
            tracing::info!("autofs: un-bind-mounting {}", path.display());
            self.mounter.unmount(path)
        } else {
            tracing::info!("autofs: deleting symlink {}", path.display());
            fs::remove_file(path)
        }
    }
}
