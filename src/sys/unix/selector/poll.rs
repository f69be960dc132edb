use std::io;
use std::os::fd::{AsRawFd, RawFd};

use super::{MuxCmd, MuxEvent, WAKER_TOKEN};
use crate::cap::{DevCap, DevEvent};
use crate::sys::unix::waker::Waker;
use crate::time::Ntime;

const INDEX_INVALID: usize = usize::MAX;
/// The handle is known but currently carries no event interest; it has
/// no slot in the dense poll array until interest returns.
const INDEX_SUSPENDED: usize = usize::MAX - 1;

/// `poll(2)` backend: a dense `pollfd` array plus an fd-to-index map.
#[derive(Debug)]
pub(crate) struct Mux {
    map: Vec<usize>,
    pfd: Vec<libc::pollfd>,
    tokens: Vec<u64>,
    waker: Waker,
}

impl Mux {
    pub(crate) const REREG_AFTER_LISTEN: bool = false;

    pub(crate) fn new() -> io::Result<Mux> {
        let waker = Waker::new()?;
        let mut mux = Mux {
            map: Vec::new(),
            pfd: Vec::new(),
            tokens: Vec::new(),
            waker,
        };
        let wfd = mux.waker.as_raw_fd();
        mux.reserve_map_slot(wfd);
        mux.pfd.push(libc::pollfd {
            fd: wfd,
            events: libc::POLLIN,
            revents: 0,
        });
        mux.tokens.push(WAKER_TOKEN);
        mux.map[wfd as usize] = 0;
        Ok(mux)
    }

    pub(crate) fn intr(&self) {
        let _ = self.waker.wake();
    }

    pub(crate) fn clone_waker_sender(&self) -> std::io::Result<std::fs::File> {
        self.waker.try_clone_sender()
    }

    fn reserve_map_slot(&mut self, fd: RawFd) {
        let fd = fd as usize;
        if fd >= self.map.len() {
            let new_len = (fd + 256) & !255;
            self.map.resize(new_len, INDEX_INVALID);
        }
    }

    fn events_of(cap: DevCap) -> libc::c_short {
        let mut events = 0;
        if cap.contains(DevCap::IN_WATCHED) {
            events |= libc::POLLIN;
            if cap.contains(DevCap::PRI_WATCHED) {
                events |= libc::POLLPRI;
            }
        }
        if cap.contains(DevCap::OUT_WATCHED) {
            events |= libc::POLLOUT;
        }
        events
    }

    fn insert_slot(&mut self, hnd: RawFd, token: u64, events: libc::c_short) {
        let idx = self.pfd.len();
        self.pfd.push(libc::pollfd {
            fd: hnd,
            events,
            revents: 0,
        });
        self.tokens.push(token);
        self.map[hnd as usize] = idx;
    }

    fn delete_slot(&mut self, idx: usize) {
        self.pfd.remove(idx);
        self.tokens.remove(idx);
        for i in idx..self.pfd.len() {
            self.map[self.pfd[i].fd as usize] = i;
        }
    }

    pub(crate) fn ctrl(
        &mut self,
        cmd: MuxCmd,
        hnd: RawFd,
        token: u64,
        cap: &mut DevCap,
    ) -> io::Result<()> {
        if cmd == MuxCmd::Insert {
            self.reserve_map_slot(hnd);
        } else if hnd as usize >= self.map.len() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let idx = self.map[hnd as usize];

        match cmd {
            MuxCmd::Insert => {
                if idx != INDEX_INVALID {
                    return Err(io::Error::from_raw_os_error(libc::EEXIST));
                }
                self.insert_slot(hnd, token, Self::events_of(*cap));
                Ok(())
            }
            MuxCmd::Update => {
                let events = Self::events_of(*cap);
                if idx == INDEX_INVALID {
                    return Err(io::Error::from_raw_os_error(libc::ENOENT));
                }
                if idx == INDEX_SUSPENDED {
                    if events == 0 {
                        return Ok(()); // no change, keep suspended
                    }
                    self.insert_slot(hnd, token, events);
                    return Ok(());
                }
                if events == 0 {
                    self.map[hnd as usize] = INDEX_SUSPENDED;
                    self.delete_slot(idx);
                    return Ok(());
                }
                self.pfd[idx].events = events;
                self.tokens[idx] = token;
                Ok(())
            }
            MuxCmd::Delete => {
                if idx == INDEX_INVALID {
                    return Err(io::Error::from_raw_os_error(libc::ENOENT));
                }
                self.map[hnd as usize] = INDEX_INVALID;
                if idx != INDEX_SUSPENDED {
                    self.delete_slot(idx);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn wait(&mut self, tmout: Ntime, out: &mut Vec<MuxEvent>) -> io::Result<()> {
        let ms = tmout.as_millis_ceil().min(libc::c_int::MAX as i64) as libc::c_int;
        let n = match syscall!(poll(self.pfd.as_mut_ptr(), self.pfd.len() as _, ms)) {
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(());
        }

        for i in 0..self.pfd.len() {
            let revents = self.pfd[i].revents;
            if revents == 0 {
                continue;
            }
            self.pfd[i].revents = 0;

            if self.tokens[i] == WAKER_TOKEN {
                self.waker.empty();
                continue;
            }

            let mut devev = DevEvent::EMPTY;
            if revents & libc::POLLIN != 0 {
                devev |= DevEvent::IN;
            }
            if revents & libc::POLLOUT != 0 {
                devev |= DevEvent::OUT;
            }
            if revents & libc::POLLPRI != 0 {
                devev |= DevEvent::PRI;
            }
            if revents & libc::POLLERR != 0 {
                devev |= DevEvent::ERR;
            }
            if revents & (libc::POLLHUP | libc::POLLNVAL) != 0 {
                devev |= DevEvent::HUP;
            }

            out.push(MuxEvent {
                token: self.tokens[i],
                events: devev,
                rdhup: false,
            });
        }
        Ok(())
    }
}
