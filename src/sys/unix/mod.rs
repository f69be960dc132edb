use std::io;
use std::os::fd::RawFd;

cfg_os_poll! {
    mod selector;
    pub(crate) use self::selector::{Mux, MuxCmd, MuxEvent};

    mod waker;
}

/// Creates a non-blocking, close-on-exec pipe: `[read, write]`.
#[allow(dead_code)]
pub(crate) fn pipe() -> io::Result<[RawFd; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        target_os = "illumos",
        target_os = "solaris",
    ))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // No `pipe2(2)` on these targets; configure both ends after the
        // fact. The small race window before the fcntl calls is
        // unavoidable here.
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            if let Err(err) = set_cloexec(*fd).and_then(|()| set_nonblock(*fd)) {
                unsafe {
                    let _ = libc::close(fds[0]);
                    let _ = libc::close(fds[1]);
                }
                return Err(err);
            }
        }
    }

    Ok(fds)
}

pub(crate) fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    if flags & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    if flags & libc::FD_CLOEXEC == 0 {
        syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    }
    Ok(())
}
