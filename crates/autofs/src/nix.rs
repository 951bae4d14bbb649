use libc::{c_int, c_ulong, c_void};
use std::{
    ffi::{CStr, CString, OsStr},
    io,
    mem::MaybeUninit,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::prelude::*,
    },
    path::Path,
    ptr,
};

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            return Err(std::io::Error::last_os_error());
        }
        res
    }};
}

pub(crate) fn cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains an interior nul byte",
        )
    })
}

pub(crate) fn read(fd: &impl AsRawFd, buf: &mut [u8]) -> io::Result<usize> {
    let len = syscall! {
        read(
            fd.as_raw_fd(), //
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
        )
    };
    Ok(len as usize)
}

/// Create a close-on-exec pipe, returning `(read, write)`.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];
    syscall! { pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn open_dir(path: &Path) -> io::Result<OwnedFd> {
    let path = cstring(path.as_os_str())?;
    let fd = syscall! { open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Issue an ioctl whose argument is passed by value.
pub(crate) fn ioctl_arg(fd: &impl AsRawFd, request: c_ulong, arg: c_ulong) -> io::Result<()> {
    syscall! { ioctl(fd.as_raw_fd(), request, arg) };
    Ok(())
}

/// Issue an ioctl which stores an `int` into the caller's buffer.
pub(crate) fn ioctl_read_int(fd: &impl AsRawFd, request: c_ulong) -> io::Result<c_int> {
    let mut value: c_int = 0;
    syscall! { ioctl(fd.as_raw_fd(), request, &mut value as *mut c_int) };
    Ok(value)
}

pub(crate) fn nofile_soft_limit() -> io::Result<u64> {
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    syscall! { getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) };
    let rlim = unsafe { rlim.assume_init() };
    Ok(rlim.rlim_cur as u64)
}

pub(crate) fn getpgrp() -> libc::pid_t {
    unsafe { libc::getpgrp() }
}

pub(crate) fn setpgid(pid: libc::pid_t, pgid: libc::pid_t) -> io::Result<()> {
    syscall! { setpgid(pid, pgid) };
    Ok(())
}

/// Return the release string of the running kernel, e.g. `6.1.0-13-amd64`.
pub(crate) fn kernel_release() -> io::Result<String> {
    let mut uts = MaybeUninit::<libc::utsname>::uninit();
    syscall! { uname(uts.as_mut_ptr()) };
    let uts = unsafe { uts.assume_init() };
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}

pub(crate) fn mount(
    source: &OsStr,
    target: &Path,
    fstype: &OsStr,
    flags: c_ulong,
    data: Option<&OsStr>,
) -> io::Result<()> {
    let source = cstring(source)?;
    let target = cstring(target.as_os_str())?;
    let fstype = cstring(fstype)?;
    let data = data.map(cstring).transpose()?;
    syscall! {
        mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            flags,
            data.as_ref()
                .map_or_else(ptr::null, |data| data.as_ptr() as *const c_void),
        )
    };
    Ok(())
}

pub(crate) fn umount(target: &Path) -> io::Result<()> {
    let target = cstring(target.as_os_str())?;
    syscall! { umount(target.as_ptr()) };
    Ok(())
}
