//! Serve a flat map of `name=target` pairs below an autofs mount point.
//!
//! Accessing `<mountpoint>/<name>` bind-mounts (or symlinks) `target` there.

#![deny(clippy::unimplemented)]

use autofs::{
    mount, Config, FdSet, LinkKind, LinkMount, Lookup, MountStatus, MountTree, Service,
};

use anyhow::{ensure, Context as _, Result};
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    io,
    os::unix::prelude::*,
    path::{Component, Path, PathBuf},
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const ROOT: usize = 0;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = pico_args::Arguments::from_env();

    let background = args.contains("--background");
    let mountpoint: PathBuf = args.opt_free_from_str()?.context("missing mountpoint")?;
    ensure!(mountpoint.is_dir(), "mountpoint must be a directory");
    let mountpoint = mountpoint.canonicalize()?;
    let cwd = std::env::current_dir()?;

    let mut map = HashMap::new();
    for entry in args.finish() {
        let (name, target) = parse_entry(&entry)
            .with_context(|| format!("invalid map entry {:?}", entry))?;
        // Probing such a target would wait on this very process.
        ensure!(
            !lies_below(&cwd.join(&target), &mountpoint),
            "map target {} lies below the autofs mount point",
            target.display()
        );
        map.insert(name, target);
    }

    let mut config = Config::default();
    config.background(background);

    let mut tree = LinkMap::new(&mountpoint, map, LinkMount::new(&config));
    let mut service: Service<usize> = Service::new(&config);

    service.acquire(ROOT)?;
    let opts = service
        .mount_options(ROOT)
        .context("kernel pipe is already closed")?;
    mount::mount_autofs(OsStr::new("linkmap"), &mountpoint, &opts)?;
    if let Err(err) = service.on_mounted(&mut tree, ROOT, &mountpoint) {
        service.release(ROOT);
        mount::unmount(&mountpoint)?;
        return Err(err.into());
    }

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let res = serve(&mut service, &mut tree, &term);

    tree.unlink_all(&mut service);
    service.release(ROOT);
    mount::unmount(&mountpoint)?;

    res
}

fn serve(service: &mut Service<usize>, tree: &mut LinkMap, term: &AtomicBool) -> Result<()> {
    while !term.load(Ordering::Relaxed) {
        let mut set = FdSet::new();
        let nfds = service.fill_fdset(&mut set).map_or(0, |fd| fd + 1);

        let mut timeout = libc::timeval {
            tv_sec: 1,
            tv_usec: 0,
        };
        let n = unsafe {
            libc::select(
                nfds,
                set.as_raw_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                &mut timeout,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("select");
        }

        if n > 0 {
            let rest = service.dispatch_ready(tree, &mut set, n as usize);
            if rest > 0 {
                tracing::debug!("{} ready descriptor(s) left unserved", rest);
            }
        }
    }

    tracing::info!("terminating");
    Ok(())
}

fn parse_entry(entry: &OsStr) -> Option<(OsString, PathBuf)> {
    let bytes = entry.as_bytes();
    let pos = bytes.iter().position(|&b| b == b'=')?;
    let (name, target) = (&bytes[..pos], &bytes[pos + 1..]);
    if name.is_empty() || name.contains(&b'/') || target.is_empty() {
        return None;
    }
    Some((
        OsStr::from_bytes(name).to_owned(),
        PathBuf::from(OsStr::from_bytes(target)),
    ))
}

/// Check whether `path` is `dir` or lies below it, without touching the
/// filesystem.
fn lies_below(path: &Path, dir: &Path) -> bool {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => {
                normalized.pop();
            }
            c => normalized.push(c),
        }
    }
    normalized.starts_with(dir)
}

struct Entry {
    name: OsString,
    path: PathBuf,
    parent: Option<usize>,
    target: Option<PathBuf>,
    linked: Option<LinkKind>,
}

struct LinkMap {
    entries: Vec<Entry>,
    map: HashMap<OsString, PathBuf>,
    link: LinkMount,
}

impl LinkMap {
    fn new(mountpoint: &Path, map: HashMap<OsString, PathBuf>, link: LinkMount) -> Self {
        Self {
            entries: vec![Entry {
                name: OsString::new(),
                path: mountpoint.to_owned(),
                parent: None,
                target: None,
                linked: None,
            }],
            map,
            link,
        }
    }

    fn child(&self, parent: usize, name: &OsStr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.parent == Some(parent) && e.name == name)
    }

    fn unlink_all(&mut self, service: &mut Service<usize>) {
        for node in 0..self.entries.len() {
            if self.entries[node].linked.is_none() {
                continue;
            }
            match self.link.unmount(&self.entries[node].path) {
                Ok(()) => {
                    self.entries[node].linked = None;
                    service.unmount_succeeded(&*self, node);
                }
                Err(err) => {
                    tracing::error!(
                        "cannot unmount {}: {}",
                        self.entries[node].path.display(),
                        err
                    );
                    service.unmount_failed(&*self, node);
                }
            }
        }
    }
}

impl MountTree for LinkMap {
    type Node = usize;

    fn lookup_child(&mut self, parent: usize, name: &OsStr, create: bool) -> Lookup<usize> {
        if parent != ROOT {
            return Lookup::Missing;
        }

        if let Some(node) = self.child(parent, name) {
            return match self.entries[node].linked {
                Some(..) => Lookup::Mounted(node),
                None => Lookup::Found(node),
            };
        }

        let Some(target) = self.map.get(name).cloned() else {
            return Lookup::Missing;
        };
        if !create {
            return Lookup::Missing;
        }

        let path = self.entries[parent].path.join(name);
        self.entries.push(Entry {
            name: name.to_owned(),
            path,
            parent: Some(parent),
            target: Some(target),
            linked: None,
        });
        Lookup::Found(self.entries.len() - 1)
    }

    fn mount_child(&mut self, node: usize) -> MountStatus {
        let Some(target) = self.entries[node].target.clone() else {
            return MountStatus::Failed;
        };
        match self.link.mount(&self.entries[node].path, &target) {
            Ok(kind) => {
                tracing::info!("{:?}: {}", kind, self.entries[node].path.display());
                self.entries[node].linked = Some(kind);
                MountStatus::Mounted
            }
            Err(err) => {
                tracing::error!("{}: {}", self.entries[node].path.display(), err);
                MountStatus::Failed
            }
        }
    }

    fn name(&self, node: usize) -> &OsStr {
        &self.entries[node].name
    }

    fn path(&self, node: usize) -> &Path {
        &self.entries[node].path
    }

    fn parent(&self, node: usize) -> Option<usize> {
        self.entries[node].parent
    }

    fn will_be_remounted(&self, _node: usize) -> bool {
        false
    }

    fn disable_subdirectory_support(&mut self) {
        tracing::info!("the kernel cannot trigger mounts below map entries");
    }
}
