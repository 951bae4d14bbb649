use autofs::{Config, Control, FdSet, Lookup, MountStatus, MountTree, Service};
use autofs_kernel::*;
use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::{OsStr, OsString},
    fs::{self, File},
    io::{self, Write as _},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};
use zerocopy::{FromZeros as _, IntoBytes as _};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Catatonic,
    Ready(autofs_wqt_t),
    Fail(autofs_wqt_t),
}

thread_local! {
    static COMMANDS: RefCell<Vec<Command>> = const { RefCell::new(Vec::new()) };
}

fn commands() -> Vec<Command> {
    COMMANDS.with(|c| c.borrow().clone())
}

fn record(command: Command) -> io::Result<()> {
    COMMANDS.with(|c| c.borrow_mut().push(command));
    Ok(())
}

/// A control channel that records the commands instead of issuing ioctls.
///
/// The protocol version is chosen by the name of the mount point, and a mount
/// point named `noopen` cannot be opened at all.
#[derive(Debug)]
struct FakeControl {
    version: Option<u32>,
}

impl Control for FakeControl {
    fn open(mountpoint: &Path) -> io::Result<Self> {
        let version = match mountpoint.file_name().and_then(OsStr::to_str) {
            Some("noopen") => return Err(io::Error::from_raw_os_error(libc::EACCES)),
            Some("proto3") => Some(3),
            Some("noproto") => None,
            _ => Some(4),
        };
        Ok(Self { version })
    }

    fn protocol_version(&self) -> io::Result<u32> {
        self.version
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTTY))
    }

    fn set_catatonic(&self) -> io::Result<()> {
        record(Command::Catatonic)
    }

    fn ready(&self, token: autofs_wqt_t) -> io::Result<()> {
        record(Command::Ready(token))
    }

    fn fail(&self, token: autofs_wqt_t) -> io::Result<()> {
        record(Command::Fail(token))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Mounted synchronously by `mount_child`.
    Sync,
    /// `mount_child` starts a background mount.
    Async,
    /// The lookup itself continues in the background.
    LookupPending,
    /// Already mounted.
    Mounted,
    /// `mount_child` fails.
    MountFails,
}

struct Node {
    name: OsString,
    path: PathBuf,
    parent: Option<usize>,
    remount: bool,
}

struct Tree {
    nodes: Vec<Node>,
    map: HashMap<OsString, Behavior>,
    subdirs: bool,
}

const ROOT: usize = 0;

impl Tree {
    fn new(root: &Path) -> Self {
        Self {
            nodes: vec![Node {
                name: OsString::new(),
                path: root.to_owned(),
                parent: None,
                remount: false,
            }],
            map: HashMap::new(),
            subdirs: true,
        }
    }

    fn with(mut self, name: &str, behavior: Behavior) -> Self {
        self.map.insert(name.into(), behavior);
        self
    }

    fn add_child(&mut self, parent: usize, name: &OsStr) -> usize {
        let path = self.nodes[parent].path.join(name);
        self.nodes.push(Node {
            name: name.to_owned(),
            path,
            parent: Some(parent),
            remount: false,
        });
        self.nodes.len() - 1
    }

    fn find(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .expect("no such node")
    }
}

impl MountTree for Tree {
    type Node = usize;

    fn lookup_child(&mut self, parent: usize, name: &OsStr, create: bool) -> Lookup<usize> {
        assert!(create);
        let Some(&behavior) = self.map.get(name) else {
            return Lookup::Missing;
        };
        let child = self.add_child(parent, name);
        match behavior {
            Behavior::LookupPending => Lookup::InProgress,
            Behavior::Mounted => Lookup::Mounted(child),
            _ => Lookup::Found(child),
        }
    }

    fn mount_child(&mut self, node: usize) -> MountStatus {
        let path = self.nodes[node].path.clone();
        match self.map[&self.nodes[node].name] {
            Behavior::Sync => {
                fs::create_dir_all(&path).unwrap();
                MountStatus::Mounted
            }
            Behavior::Async => {
                fs::create_dir_all(&path).unwrap();
                MountStatus::InProgress
            }
            Behavior::MountFails => MountStatus::Failed,
            Behavior::LookupPending | Behavior::Mounted => unreachable!(),
        }
    }

    fn name(&self, node: usize) -> &OsStr {
        &self.nodes[node].name
    }

    fn path(&self, node: usize) -> &Path {
        &self.nodes[node].path
    }

    fn parent(&self, node: usize) -> Option<usize> {
        self.nodes[node].parent
    }

    fn will_be_remounted(&self, node: usize) -> bool {
        self.nodes[node].remount
    }

    fn disable_subdirectory_support(&mut self) {
        self.subdirs = false;
    }
}

fn missing(token: autofs_wqt_t, name: &str) -> Vec<u8> {
    let mut pkt = autofs_packet_missing::new_zeroed();
    pkt.hdr.proto_version = 4;
    pkt.hdr.type_ = autofs_ptype_missing;
    pkt.wait_queue_token = token;
    pkt.len = name.len() as i32;
    pkt.name[..name.len()].copy_from_slice(name.as_bytes());
    pkt.as_bytes().to_vec()
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    tree: Tree,
    service: Service<usize, FakeControl>,
    kernel: Option<File>,
}

impl Fixture {
    fn new(configure: impl FnOnce(Tree) -> Tree) -> Self {
        Self::with_mountpoint("auto", configure)
    }

    fn with_mountpoint(name: &str, configure: impl FnOnce(Tree) -> Tree) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(name);
        fs::create_dir(&root).unwrap();

        let mut tree = configure(Tree::new(&root));
        let mut service = Service::new(&Config::default());
        service.acquire(ROOT).unwrap();

        // Keep a copy of the kernel end, as the kernel would after mounting.
        let kernel = service
            .handle(ROOT)
            .unwrap()
            .kernel_write()
            .expect("kernel end is open before mounting")
            .try_clone_to_owned()
            .map(File::from)
            .unwrap();

        service.on_mounted(&mut tree, ROOT, &root).unwrap();

        Self {
            _dir: dir,
            root,
            tree,
            service,
            kernel: Some(kernel),
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.kernel.as_mut().unwrap().write_all(bytes).unwrap();
    }

    /// Report the autofs pipe as ready and dispatch it.
    fn pump(&mut self) -> usize {
        let mut set = FdSet::new();
        self.service.fill_fdset(&mut set);
        self.service.dispatch_ready(&mut self.tree, &mut set, 1)
    }

    fn pending_tokens(&self) -> Vec<autofs_wqt_t> {
        self.service
            .handle(ROOT)
            .unwrap()
            .pending()
            .iter()
            .map(|p| p.token())
            .collect()
    }
}

#[test]
fn synchronous_mount_replies_ready() {
    let mut fx = Fixture::new(|t| t.with("home", Behavior::Sync));
    fx.send(&missing(7, "home"));
    assert_eq!(fx.pump(), 0);

    assert_eq!(commands(), [Command::Ready(7)]);
    assert!(fx.pending_tokens().is_empty());
    assert_eq!(fx.service.stats().lookups, 1);
}

#[test]
fn already_mounted_entry_replies_ready() {
    let mut fx = Fixture::new(|t| t.with("data", Behavior::Mounted));
    fx.send(&missing(2, "data"));
    fx.pump();

    assert_eq!(commands(), [Command::Ready(2)]);
    assert!(fx.pending_tokens().is_empty());
}

#[test]
fn asynchronous_mount_failure_replies_fail() {
    let mut fx = Fixture::new(|t| t.with("proj", Behavior::Async));
    fx.send(&missing(9, "proj"));
    fx.pump();

    assert!(commands().is_empty());
    assert_eq!(fx.pending_tokens(), [9]);
    let proj = fx.tree.find("proj");
    assert!(fx.root.join("proj").is_dir());

    fx.service.mount_failed(&fx.tree, proj);
    assert_eq!(commands(), [Command::Fail(9)]);
    assert!(!fx.root.join("proj").exists());
    assert!(fx.root.is_dir());
    assert!(fx.pending_tokens().is_empty());

    // a second completion finds nothing to answer.
    fx.service.mount_failed(&fx.tree, proj);
    assert_eq!(commands(), [Command::Fail(9)]);
}

#[test]
fn asynchronous_mount_success_replies_ready() {
    let mut fx = Fixture::new(|t| t.with("proj", Behavior::Async));
    fx.send(&missing(11, "proj"));
    fx.pump();

    let proj = fx.tree.find("proj");
    fx.service.mount_succeeded(&fx.tree, proj);
    assert_eq!(commands(), [Command::Ready(11)]);
    assert!(fx.pending_tokens().is_empty());
    assert!(fx.root.join("proj").is_dir());
}

#[test]
fn pending_lookup_completes_later() {
    let mut fx = Fixture::new(|t| t.with("slow", Behavior::LookupPending));
    fx.send(&missing(21, "slow"));
    fx.pump();
    assert_eq!(fx.pending_tokens(), [21]);

    let slow = fx.tree.find("slow");
    fx.service.mount_succeeded(&fx.tree, slow);
    assert_eq!(commands(), [Command::Ready(21)]);
}

#[test]
fn duplicate_missing_is_dropped() {
    let mut fx = Fixture::new(|t| t.with("x", Behavior::Async));
    fx.send(&missing(3, "x"));
    fx.send(&missing(4, "x"));
    let mut set = FdSet::new();
    fx.service.fill_fdset(&mut set);
    fx.service.dispatch_ready(&mut fx.tree, &mut set, 1);
    fx.pump();

    assert_eq!(fx.pending_tokens(), [3]);
    assert_eq!(fx.service.stats().drops, 1);
    assert_eq!(fx.service.stats().lookups, 1);
    assert!(commands().is_empty());
}

#[test]
fn inline_lookup_failure_replies_fail() {
    let mut fx = Fixture::new(|t| t);
    fx.send(&missing(5, "nope"));
    fx.pump();

    assert_eq!(commands(), [Command::Fail(5)]);
    assert!(fx.pending_tokens().is_empty());
}

#[test]
fn inline_mount_failure_replies_fail() {
    let mut fx = Fixture::new(|t| t.with("broken", Behavior::MountFails));
    fx.send(&missing(6, "broken"));
    fx.pump();

    assert_eq!(commands(), [Command::Fail(6)]);
    assert!(fx.pending_tokens().is_empty());
}

#[test]
fn completion_without_request_is_ignored() {
    let mut fx = Fixture::new(|t| t);
    let node = fx.tree.add_child(ROOT, OsStr::new("manual"));
    fx.service.mount_succeeded(&fx.tree, node);
    fx.service.mount_failed(&fx.tree, node);
    fx.service.mount_succeeded(&fx.tree, ROOT);
    assert!(commands().is_empty());
}

#[test]
fn unmount_removes_mountpoint_unless_remounted() {
    let mut fx = Fixture::new(|t| t);
    let gone = fx.tree.add_child(ROOT, OsStr::new("gone"));
    let kept = fx.tree.add_child(ROOT, OsStr::new("kept"));
    fx.tree.nodes[kept].remount = true;
    fs::create_dir_all(fx.root.join("gone/inner")).unwrap();
    fs::create_dir(fx.root.join("kept")).unwrap();

    fx.service.unmount_succeeded(&fx.tree, gone);
    fx.service.unmount_succeeded(&fx.tree, kept);
    fx.service.unmount_failed(&fx.tree, kept);

    // only empty directories are removed.
    assert!(fx.root.join("gone/inner").is_dir());
    assert!(fx.root.join("kept").is_dir());
    assert!(fx.root.is_dir());
    assert!(commands().is_empty());
}

#[test]
fn unmount_removes_empty_mountpoint() {
    let mut fx = Fixture::new(|t| t);
    let node = fx.tree.add_child(ROOT, OsStr::new("gone"));
    fs::create_dir(fx.root.join("gone")).unwrap();

    fx.service.unmount_succeeded(&fx.tree, node);
    assert!(!fx.root.join("gone").exists());
    assert!(fx.root.is_dir());
}

#[test]
fn unknown_packets_are_dropped() {
    let mut fx = Fixture::new(|t| t.with("home", Behavior::Sync));
    let mut bytes = missing(1, "home");
    bytes[4..8].copy_from_slice(&17i32.to_ne_bytes());
    fx.send(&bytes);
    fx.pump();

    assert_eq!(fx.service.stats().unknown_packets, 1);
    assert_eq!(fx.service.stats().lookups, 0);
    assert!(commands().is_empty());
}

#[test]
fn expire_packets_change_nothing() {
    let mut fx = Fixture::new(|t| t.with("home", Behavior::Async));
    fx.send(&missing(1, "home"));
    fx.pump();

    let mut pkt = autofs_packet_expire::new_zeroed();
    pkt.hdr.type_ = autofs_ptype_expire;
    pkt.len = 4;
    pkt.name[..4].copy_from_slice(b"home");
    let mut bytes = pkt.as_bytes().to_vec();
    bytes.resize(AUTOFS_PACKET_SIZE, 0);
    fx.send(&bytes);
    fx.pump();

    assert!(commands().is_empty());
    assert_eq!(fx.pending_tokens(), [1]);
    assert_eq!(fx.service.stats().unknown_packets, 0);
}

#[test]
fn short_read_is_not_fatal() {
    let mut fx = Fixture::new(|t| t.with("home", Behavior::Sync));
    let bytes = missing(1, "home");
    fx.send(&bytes[..100]);
    drop(fx.kernel.take());
    fx.pump();

    assert_eq!(fx.service.stats().short_reads, 1);
    assert_eq!(fx.service.stats().lookups, 0);
    assert!(commands().is_empty());
    assert_eq!(fx.service.registry().len(), 1);
}

#[test]
fn dispatch_returns_unconsumed_count() {
    let mut fx = Fixture::new(|t| t.with("home", Behavior::Sync));
    fx.send(&missing(7, "home"));

    let foreign = 1000;
    let mut set = FdSet::new();
    let highest = fx.service.fill_fdset(&mut set).unwrap();
    set.insert(foreign);
    assert_eq!(fx.service.dispatch_ready(&mut fx.tree, &mut set, 2), 1);
    assert!(!set.contains(highest));
    assert!(set.contains(foreign));
    assert_eq!(commands(), [Command::Ready(7)]);

    // nothing is read once the count is exhausted.
    fx.send(&missing(8, "home"));
    let mut set = FdSet::new();
    fx.service.fill_fdset(&mut set);
    assert_eq!(fx.service.dispatch_ready(&mut fx.tree, &mut set, 0), 0);
    assert_eq!(fx.service.stats().lookups, 1);
}

#[test]
fn release_sends_catatonic_and_unregisters() {
    let mut fx = Fixture::new(|t| t);
    let fd = fx.service.handle(ROOT).unwrap().kernel_read().as_raw_fd();
    assert_eq!(fx.service.registry().get(fd), Some(ROOT));

    fx.service.release(ROOT);
    assert_eq!(commands(), [Command::Catatonic]);
    assert!(fx.service.registry().is_empty());
    assert!(fx.service.handle(ROOT).is_none());

    // releasing twice does nothing.
    fx.service.release(ROOT);
    assert_eq!(commands(), [Command::Catatonic]);
}

#[test]
fn release_before_mount_skips_catatonic() {
    let mut service: Service<usize, FakeControl> = Service::new(&Config::default());
    service.acquire(ROOT).unwrap();
    assert!(service.handle(ROOT).unwrap().kernel_write().is_some());

    service.release(ROOT);
    assert!(commands().is_empty());
    assert!(service.registry().is_empty());
}

#[test]
fn mount_options_until_mounted() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = Tree::new(dir.path());
    let mut service: Service<usize, FakeControl> = Service::new(&Config::default());
    service.acquire(ROOT).unwrap();

    let opts = service.mount_options(ROOT).unwrap();
    let write_fd = service.handle(ROOT).unwrap().kernel_write().unwrap().as_raw_fd();
    assert_eq!(
        opts.to_string(),
        format!("fd={},minproto=3,maxproto=4", write_fd)
    );

    assert_eq!(service.on_mounted(&mut tree, ROOT, dir.path()).unwrap(), 4);
    assert!(service.mount_options(ROOT).is_none());
    assert!(service.handle(ROOT).unwrap().kernel_write().is_none());
    assert!(tree.subdirs);
}

#[test]
fn old_protocol_disables_subdirectories() {
    let fx = Fixture::with_mountpoint("proto3", |t| t);
    assert_eq!(fx.service.handle(ROOT).unwrap().protocol_version(), 3);
    assert!(!fx.tree.subdirs);
}

#[test]
fn failed_version_query_assumes_minimum() {
    let fx = Fixture::with_mountpoint("noproto", |t| t);
    assert_eq!(
        fx.service.handle(ROOT).unwrap().protocol_version(),
        AUTOFS_MIN_PROTO_VERSION
    );
    assert!(!fx.tree.subdirs);
}

#[test]
fn unopenable_control_assumes_minimum() {
    let mut fx = Fixture::with_mountpoint("noopen", |t| t.with("home", Behavior::Sync));
    let handle = fx.service.handle(ROOT).unwrap();
    assert_eq!(handle.protocol_version(), AUTOFS_MIN_PROTO_VERSION);
    assert!(handle.control().is_none());
    assert!(handle.kernel_write().is_none());
    assert!(!fx.tree.subdirs);

    // requests are still consumed, even though no reply can be sent.
    fx.send(&missing(7, "home"));
    fx.pump();
    assert_eq!(fx.service.stats().lookups, 1);
    assert!(fx.pending_tokens().is_empty());
    assert!(commands().is_empty());

    fx.service.release(ROOT);
    assert!(commands().is_empty());
    assert!(fx.service.registry().is_empty());
}

#[test]
fn on_mounted_requires_a_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = Tree::new(dir.path());
    let mut service: Service<usize, FakeControl> = Service::new(&Config::default());
    let err = service.on_mounted(&mut tree, ROOT, dir.path()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[test]
fn acquire_beyond_the_ceiling_fails() {
    let mut config = Config::default();
    config.fd_limit(0);
    let mut service: Service<usize, FakeControl> = Service::new(&config);
    let err = service.acquire(ROOT).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
    assert!(service.handle(ROOT).is_none());
    assert!(service.registry().is_empty());
}

#[test]
fn several_mount_points() {
    let dir = tempfile::tempdir().unwrap();
    let mut tree = Tree::new(dir.path()).with("a", Behavior::Sync);
    let second = tree.add_child(ROOT, OsStr::new("second"));
    fs::create_dir(dir.path().join("second")).unwrap();

    let mut service: Service<usize, FakeControl> = Service::new(&Config::default());
    service.acquire(ROOT).unwrap();
    service.acquire(second).unwrap();
    let mut kernel = service
        .handle(second)
        .unwrap()
        .kernel_write()
        .unwrap()
        .try_clone_to_owned()
        .map(File::from)
        .unwrap();
    service.on_mounted(&mut tree, ROOT, dir.path()).unwrap();
    service
        .on_mounted(&mut tree, second, &dir.path().join("second"))
        .unwrap();
    assert_eq!(service.registry().len(), 2);

    kernel.write_all(&missing(40, "a")).unwrap();
    let mut set = FdSet::new();
    set.insert(service.handle(second).unwrap().kernel_read().as_raw_fd());
    assert_eq!(service.dispatch_ready(&mut tree, &mut set, 1), 0);

    assert_eq!(commands(), [Command::Ready(40)]);
    assert!(tree.path(tree.find("a")).starts_with(dir.path().join("second")));

    service.release(second);
    assert_eq!(service.registry().len(), 1);
    assert!(service.handle(ROOT).is_some());
}
