use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::{MuxCmd, MuxEvent, WAKER_TOKEN};
use crate::cap::{DevCap, DevEvent};
use crate::sys::unix::waker::Waker;
use crate::time::Ntime;

const EVENTS_CAPA: usize = 256;

#[derive(Debug)]
pub(crate) struct Mux {
    ep: OwnedFd,
    waker: Waker,
}

impl Mux {
    /// kqueue needs listening sockets re-registered after `listen()`
    /// on some systems; epoll does not.
    pub(crate) const REREG_AFTER_LISTEN: bool = false;

    pub(crate) fn new() -> io::Result<Mux> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };

        let waker = Waker::new()?;
        let mut ev = libc::epoll_event {
            events: (EPOLLIN | EPOLLHUP | EPOLLERR) as u32,
            u64: WAKER_TOKEN,
        };
        syscall!(epoll_ctl(
            ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.as_raw_fd(),
            &mut ev,
        ))?;

        Ok(Mux { ep, waker })
    }

    pub(crate) fn intr(&self) {
        let _ = self.waker.wake();
    }

    pub(crate) fn clone_waker_sender(&self) -> std::io::Result<std::fs::File> {
        self.waker.try_clone_sender()
    }

    pub(crate) fn ctrl(
        &mut self,
        cmd: MuxCmd,
        hnd: RawFd,
        token: u64,
        cap: &mut DevCap,
    ) -> io::Result<()> {
        let events = cap_to_epoll(*cap);
        let mut ev = libc::epoll_event {
            events: (events | EPOLLHUP | EPOLLERR) as u32,
            u64: token,
        };
        let ep = self.ep.as_raw_fd();

        match cmd {
            MuxCmd::Insert => {
                if cap.contains(DevCap::WATCH_SUSPENDED) {
                    return Err(io::Error::from_raw_os_error(libc::EEXIST));
                }
                syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, hnd, &mut ev)).map(|_| ())
            }
            MuxCmd::Update => {
                if events == 0 {
                    if cap.contains(DevCap::WATCH_SUSPENDED) {
                        // no change, keep suspended
                        Ok(())
                    } else {
                        syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, hnd, &mut ev))?;
                        cap.insert(DevCap::WATCH_SUSPENDED);
                        Ok(())
                    }
                } else if cap.contains(DevCap::WATCH_SUSPENDED) {
                    syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, hnd, &mut ev))?;
                    cap.remove(DevCap::WATCH_SUSPENDED);
                    Ok(())
                } else {
                    syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, hnd, &mut ev)).map(|_| ())
                }
            }
            MuxCmd::Delete => {
                if cap.contains(DevCap::WATCH_SUSPENDED) {
                    // never inserted as far as epoll is concerned
                    cap.remove(DevCap::WATCH_SUSPENDED);
                    return Ok(());
                }
                syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, hnd, &mut ev)).map(|_| ())
            }
        }
    }

    pub(crate) fn wait(&mut self, tmout: Ntime, out: &mut Vec<MuxEvent>) -> io::Result<()> {
        let mut events: [libc::epoll_event; EVENTS_CAPA] = unsafe { std::mem::zeroed() };
        let ms = tmout.as_millis_ceil().min(libc::c_int::MAX as i64) as libc::c_int;

        let n = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            EVENTS_CAPA as libc::c_int,
            ms,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };

        for ev in &events[..n] {
            if ev.u64 == WAKER_TOKEN {
                self.waker.empty();
                continue;
            }

            let bits = ev.events as libc::c_int;
            let mut devev = DevEvent::EMPTY;
            let mut rdhup = false;
            if bits & EPOLLIN != 0 {
                devev |= DevEvent::IN;
            }
            if bits & EPOLLOUT != 0 {
                devev |= DevEvent::OUT;
            }
            if bits & EPOLLPRI != 0 {
                devev |= DevEvent::PRI;
            }
            if bits & EPOLLERR != 0 {
                devev |= DevEvent::ERR;
            }
            if bits & EPOLLHUP != 0 {
                devev |= DevEvent::HUP;
            } else if bits & EPOLLRDHUP != 0 {
                rdhup = true;
            }

            out.push(MuxEvent {
                token: ev.u64,
                events: devev,
                rdhup,
            });
        }
        Ok(())
    }
}

fn cap_to_epoll(cap: DevCap) -> libc::c_int {
    let mut events = 0;
    if cap.contains(DevCap::IN_WATCHED) {
        events |= EPOLLIN | EPOLLRDHUP;
        if cap.contains(DevCap::PRI_WATCHED) {
            events |= EPOLLPRI;
        }
    }
    if cap.contains(DevCap::OUT_WATCHED) {
        events |= EPOLLOUT;
    }
    events
}
