use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::{MuxCmd, MuxEvent, WAKER_TOKEN};
use crate::cap::{DevCap, DevEvent};
use crate::sys::unix::waker::Waker;
use crate::time::Ntime;

const EVENTS_CAPA: usize = 256;

// Type of the `udata` field differs across the BSDs.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

// `filter`/`flags` field widths differ as well.
type Filter = libc::c_short;
type Flags = libc::c_ushort;

fn kevent_new(ident: RawFd, filter: Filter, flags: Flags, udata: u64) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident as libc::uintptr_t;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = udata as usize as UData;
    ev
}

#[derive(Debug)]
pub(crate) struct Mux {
    kq: OwnedFd,
    waker: Waker,
}

impl Mux {
    /// After `listen()` on an already-registered socket, some systems
    /// (NetBSD at least) deliver no accept readiness until the socket
    /// is re-registered. The socket device re-registers around
    /// `listen()` when this is set.
    pub(crate) const REREG_AFTER_LISTEN: bool = true;

    pub(crate) fn new() -> io::Result<Mux> {
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;

        let waker = Waker::new()?;
        let mut ch = [kevent_new(
            waker.as_raw_fd(),
            libc::EVFILT_READ as Filter,
            (libc::EV_ADD | libc::EV_ENABLE) as Flags,
            WAKER_TOKEN,
        )];
        syscall!(kevent(
            kq.as_raw_fd(),
            ch.as_mut_ptr(),
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))?;

        Ok(Mux { kq, waker })
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
        let i_flag = if cap.contains(DevCap::IN_WATCHED) {
            libc::EV_ENABLE
        } else {
            libc::EV_DISABLE
        };
        let o_flag = if cap.contains(DevCap::OUT_WATCHED) {
            libc::EV_ENABLE
        } else {
            libc::EV_DISABLE
        };

        let mut ch: [libc::kevent; 2];
        match cmd {
            MuxCmd::Insert => {
                if cap.contains(DevCap::WATCH_SUSPENDED) {
                    return Err(io::Error::from_raw_os_error(libc::EEXIST));
                }
                ch = [
                    kevent_new(
                        hnd,
                        libc::EVFILT_READ as Filter,
                        (libc::EV_ADD | i_flag) as Flags,
                        token,
                    ),
                    kevent_new(
                        hnd,
                        libc::EVFILT_WRITE as Filter,
                        (libc::EV_ADD | o_flag) as Flags,
                        token,
                    ),
                ];
            }
            MuxCmd::Update => {
                ch = [
                    kevent_new(
                        hnd,
                        libc::EVFILT_READ as Filter,
                        (libc::EV_ADD | i_flag) as Flags,
                        token,
                    ),
                    kevent_new(
                        hnd,
                        libc::EVFILT_WRITE as Filter,
                        (libc::EV_ADD | o_flag) as Flags,
                        token,
                    ),
                ];
            }
            MuxCmd::Delete => {
                ch = [
                    kevent_new(
                        hnd,
                        libc::EVFILT_READ as Filter,
                        (libc::EV_DELETE | libc::EV_DISABLE) as Flags,
                        token,
                    ),
                    kevent_new(
                        hnd,
                        libc::EVFILT_WRITE as Filter,
                        (libc::EV_DELETE | libc::EV_DISABLE) as Flags,
                        token,
                    ),
                ];
            }
        }

        syscall!(kevent(
            self.kq.as_raw_fd(),
            ch.as_mut_ptr(),
            2,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))?;

        match cmd {
            MuxCmd::Insert => {
                cap.insert(DevCap::WATCH_REREG_REQUIRED);
            }
            MuxCmd::Update => {
                // kqueue keeps disabled filters registered, so a
                // suspended device needs no re-insertion; the bit only
                // records that no events are requested.
                if i_flag == libc::EV_DISABLE && o_flag == libc::EV_DISABLE {
                    cap.insert(DevCap::WATCH_SUSPENDED);
                } else {
                    cap.remove(DevCap::WATCH_SUSPENDED);
                }
            }
            MuxCmd::Delete => {
                cap.remove(DevCap::WATCH_SUSPENDED);
            }
        }
        Ok(())
    }

    pub(crate) fn wait(&mut self, tmout: Ntime, out: &mut Vec<MuxEvent>) -> io::Result<()> {
        let mut events: [libc::kevent; EVENTS_CAPA] = unsafe { mem::zeroed() };
        let ts = libc::timespec {
            tv_sec: tmout.sec().max(0) as libc::time_t,
            tv_nsec: tmout.nsec() as _,
        };

        let n = match syscall!(kevent(
            self.kq.as_raw_fd(),
            std::ptr::null(),
            0,
            events.as_mut_ptr(),
            EVENTS_CAPA as libc::c_int,
            &ts,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };

        for ev in &events[..n] {
            let token = ev.udata as usize as u64;
            if token == WAKER_TOKEN {
                self.waker.empty();
                continue;
            }

            let mut devev = DevEvent::EMPTY;
            if ev.flags as libc::c_int & libc::EV_ERROR as libc::c_int != 0 {
                devev |= DevEvent::ERR;
            }
            if ev.flags as libc::c_int & libc::EV_EOF as libc::c_int != 0 {
                devev |= DevEvent::HUP;
            }
            if ev.filter == libc::EVFILT_READ as _ {
                devev |= DevEvent::IN;
            } else if ev.filter == libc::EVFILT_WRITE as _ {
                devev |= DevEvent::OUT;
            }

            if !devev.is_empty() {
                out.push(MuxEvent {
                    token,
                    events: devev,
                    rdhup: false,
                });
            }
        }
        Ok(())
    }
}
