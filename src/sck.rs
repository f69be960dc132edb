//! Socket devices: stateful (stream) and stateless (datagram/raw)
//! sockets living on the event loop.
//!
//! A socket tracks its own connection progress separately from the
//! generic device state: `connect` and `accept` never report success
//! synchronously; the readiness handler harvests the outcome and only
//! then invokes the user's `on_connect`, after the local and remote
//! addresses are in place. The optional TLS handshake is just another
//! progress state pumped by the same handler.

use std::any::Any;
use std::io::{self, IoSlice};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::cap::{DevCap, DevEvent};
use crate::dev::{DevId, Device, EvCb, EvGate, Rd, RdCtl, WatchCmd, WrRes};
use crate::err::{Errnum, Error, Result};
use crate::hio::Hio;
use crate::skad::Skad;
use crate::sys::Mux;
use crate::time::Ntime;
use crate::tls::{SharedTlsContext, TlsSession, TlsWant};
use crate::tmr::Tmridx;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Socket flavors. `Qx` is a loop-internal datagram pair usable as a
/// cheap inter-loop queue.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SckType {
    Qx,
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
    Icmp4,
    Icmp6,
    Arp,
    ArpDgram,
    Packet,
    Bpf,
}

struct SckTypeInfo {
    domain: libc::c_int,
    ty: libc::c_int,
    proto: libc::c_int,
    extra_cap: DevCap,
}

fn type_info(typ: SckType) -> io::Result<SckTypeInfo> {
    let info = match typ {
        SckType::Tcp4 => SckTypeInfo {
            domain: libc::AF_INET,
            ty: libc::SOCK_STREAM,
            proto: 0,
            extra_cap: DevCap::STREAM,
        },
        SckType::Tcp6 => SckTypeInfo {
            domain: libc::AF_INET6,
            ty: libc::SOCK_STREAM,
            proto: 0,
            extra_cap: DevCap::STREAM,
        },
        SckType::Udp4 => SckTypeInfo {
            domain: libc::AF_INET,
            ty: libc::SOCK_DGRAM,
            proto: 0,
            extra_cap: DevCap::EMPTY,
        },
        SckType::Udp6 => SckTypeInfo {
            domain: libc::AF_INET6,
            ty: libc::SOCK_DGRAM,
            proto: 0,
            extra_cap: DevCap::EMPTY,
        },
        SckType::Icmp4 => SckTypeInfo {
            domain: libc::AF_INET,
            ty: libc::SOCK_RAW,
            proto: libc::IPPROTO_ICMP,
            extra_cap: DevCap::EMPTY,
        },
        SckType::Icmp6 => SckTypeInfo {
            domain: libc::AF_INET6,
            ty: libc::SOCK_RAW,
            proto: libc::IPPROTO_ICMPV6,
            extra_cap: DevCap::EMPTY,
        },
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SckType::Arp => SckTypeInfo {
            domain: libc::AF_PACKET,
            ty: libc::SOCK_RAW,
            proto: (libc::ETH_P_ARP as u16).to_be() as libc::c_int,
            extra_cap: DevCap::EMPTY,
        },
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SckType::ArpDgram => SckTypeInfo {
            // link-level header removed by the kernel
            domain: libc::AF_PACKET,
            ty: libc::SOCK_DGRAM,
            proto: (libc::ETH_P_ARP as u16).to_be() as libc::c_int,
            extra_cap: DevCap::EMPTY,
        },
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SckType::Packet => SckTypeInfo {
            domain: libc::AF_PACKET,
            ty: libc::SOCK_RAW,
            proto: (libc::ETH_P_ALL as u16).to_be() as libc::c_int,
            extra_cap: DevCap::EMPTY,
        },
        _ => return Err(io::ErrorKind::Unsupported.into()),
    };
    Ok(info)
}

fn is_stateful(typ: SckType) -> bool {
    matches!(typ, SckType::Tcp4 | SckType::Tcp6)
}

/// Connection-progress and flag bits of a socket device.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SckState(u32);

impl SckState {
    pub const INITIAL: SckState = SckState(0);
    pub const CONNECTING: SckState = SckState(1 << 0);
    pub const CONNECTING_SSL: SckState = SckState(1 << 1);
    pub const CONNECTED: SckState = SckState(1 << 2);
    pub const LISTENING: SckState = SckState(1 << 3);
    pub const ACCEPTING_SSL: SckState = SckState(1 << 4);
    pub const ACCEPTED: SckState = SckState(1 << 5);
    /// Accepted local address differs from the original destination
    /// (REDIRECT/TPROXY).
    pub const INTERCEPTED: SckState = SckState(1 << 8);
    /// A listener that survives accept failures.
    pub const LENIENT: SckState = SckState(1 << 9);

    const PROGRESS_MASK: SckState = SckState(
        Self::CONNECTING.0
            | Self::CONNECTING_SSL.0
            | Self::CONNECTED.0
            | Self::LISTENING.0
            | Self::ACCEPTING_SSL.0
            | Self::ACCEPTED.0,
    );

    pub const fn contains(self, other: SckState) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: SckState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SckState) {
        self.0 &= !other.0;
    }

    pub fn progress(self) -> SckState {
        SckState(self.0 & Self::PROGRESS_MASK.0)
    }

    fn set_progress(&mut self, progress: SckState) {
        self.0 = (self.0 & !Self::PROGRESS_MASK.0) | progress.0;
    }
}

impl std::fmt::Debug for SckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut one = false;
        for (bit, name) in [
            (SckState::CONNECTING, "connecting"),
            (SckState::CONNECTING_SSL, "connecting_ssl"),
            (SckState::CONNECTED, "connected"),
            (SckState::LISTENING, "listening"),
            (SckState::ACCEPTING_SSL, "accepting_ssl"),
            (SckState::ACCEPTED, "accepted"),
            (SckState::INTERCEPTED, "intercepted"),
            (SckState::LENIENT, "lenient"),
        ] {
            if self.contains(bit) {
                if one {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(f, "initial")?;
        }
        Ok(())
    }
}

/// User callbacks of a socket device.
///
/// Callbacks run on the loop thread. A listener's `on_accept` supplies
/// the handler the accepted connection will use, which is how accepted
/// sockets inherit their behavior from the listener.
pub trait SckHandler {
    fn on_connect(&mut self, hio: &mut Hio, dev: DevId) -> Result<()> {
        let _ = (hio, dev);
        Ok(())
    }

    fn on_disconnect(&mut self, hio: &mut Hio, dev: DevId) {
        let _ = (hio, dev);
    }

    fn on_read(&mut self, hio: &mut Hio, dev: DevId, rd: Rd<'_>, src: Option<&Skad>)
        -> Result<RdCtl>;

    fn on_write(
        &mut self,
        hio: &mut Hio,
        dev: DevId,
        res: WrRes,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()>;

    /// Called for each connection a listener accepts, before
    /// `on_connect` runs on the new device. Returns the handler for
    /// the accepted socket.
    fn on_accept(&mut self, hio: &mut Hio, listener: DevId, conn: DevId)
        -> Result<Box<dyn SckHandler>> {
        let _ = (hio, listener, conn);
        Err(Error::with_msg(Errnum::Noimpl, "socket cannot accept"))
    }
}

/// Socket `bind` configuration.
#[derive(Clone)]
pub struct BindOpts {
    pub addr: SocketAddr,
    pub reuseaddr: bool,
    pub reuseport: bool,
    pub broadcast: bool,
    /// IP_TRANSPARENT, for TPROXY setups.
    pub transparent: bool,
    /// Ignore failures of the individual socket options.
    pub ignerr: bool,
    /// Serve TLS on accepted connections with this context.
    pub tls: Option<SharedTlsContext>,
}

impl BindOpts {
    pub fn new(addr: SocketAddr) -> BindOpts {
        BindOpts {
            addr,
            reuseaddr: false,
            reuseport: false,
            broadcast: false,
            transparent: false,
            ignerr: false,
            tls: None,
        }
    }
}

/// Socket `connect` configuration.
pub struct ConnectOpts {
    pub addr: SocketAddr,
    /// Connect (and TLS handshake) deadline.
    pub tmout: Option<Ntime>,
    pub tls: Option<SharedTlsContext>,
}

impl ConnectOpts {
    pub fn new(addr: SocketAddr) -> ConnectOpts {
        ConnectOpts {
            addr,
            tmout: None,
            tls: None,
        }
    }
}

/// Socket `listen` configuration.
pub struct ListenOpts {
    pub backlog: i32,
    /// Deadline for the TLS handshake of accepted connections.
    pub accept_tmout: Option<Ntime>,
    /// Keep the listener alive across accept failures.
    pub lenient: bool,
}

impl ListenOpts {
    pub fn new(backlog: i32) -> ListenOpts {
        ListenOpts {
            backlog,
            accept_tmout: None,
            lenient: false,
        }
    }
}

/// How to shut a socket down.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ShutHow {
    Read,
    Write,
    Both,
}

/// Control commands understood by the socket driver's `ioctl`.
pub enum SckIoctl {
    Bind(BindOpts),
    Shutdown(ShutHow),
}

/*
 * ===== socket creation =====
 */

fn open_async_socket(domain: libc::c_int, ty: libc::c_int, proto: libc::c_int) -> io::Result<RawFd> {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let fd = syscall!(socket(
        domain,
        ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        proto
    ))?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let fd = {
        let fd = syscall!(socket(domain, ty, proto))?;
        if let Err(err) = crate::sys::set_nonblock(fd)
            .and_then(|()| crate::sys::set_cloexec(fd))
            .and_then(|()| {
                let on: libc::c_int = 1;
                syscall!(setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_NOSIGPIPE,
                    &on as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                ))
                .map(|_| ())
            })
        {
            unsafe {
                let _ = libc::close(fd);
            }
            return Err(err);
        }
        fd
    };

    Ok(fd)
}

fn open_async_qx() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()))?;
    for fd in &fds {
        if let Err(err) =
            crate::sys::set_nonblock(*fd).and_then(|()| crate::sys::set_cloexec(*fd))
        {
            unsafe {
                let _ = libc::close(fds[0]);
                let _ = libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: libc::c_int = 0; // SO_NOSIGPIPE is set at creation

fn would_block(errno: i32) -> bool {
    errno == libc::EINPROGRESS
        || errno == libc::EWOULDBLOCK
        || errno == libc::EAGAIN
        || errno == libc::EINTR
}

fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(err)
}

fn sockname_of(fd: RawFd) -> Option<Skad> {
    let mut skad = Skad::zeroed();
    let mut len = Skad::capacity();
    let r = unsafe { libc::getsockname(fd, skad.as_mut_ptr(), &mut len) };
    if r == -1 {
        return None;
    }
    skad.set_len(len);
    Some(skad)
}

/*
 * ===== the driver =====
 */

/// A socket device driver. Create it through [`Hio::sck_make`].
pub struct SckDev {
    hnd: RawFd,
    side_chan: RawFd,
    typ: SckType,
    state: SckState,
    localaddr: Skad,
    remoteaddr: Skad,
    orgdstaddr: Skad,
    /// Progress timer: connect deadline or TLS handshake deadline.
    tmrjob_index: Tmridx,
    /// Accept-side handshake deadline, inherited by accepted sockets.
    tmout: Ntime,
    tls_ctx: Option<SharedTlsContext>,
    tls: Option<Box<dyn TlsSession>>,
    handler: Option<Box<dyn SckHandler>>,
}

impl SckDev {
    fn open(typ: SckType, handler: Box<dyn SckHandler>) -> io::Result<SckDev> {
        let (hnd, side_chan) = match typ {
            SckType::Qx => open_async_qx()?,
            SckType::Bpf => return Err(io::ErrorKind::Unsupported.into()),
            _ => {
                let info = type_info(typ)?;
                (open_async_socket(info.domain, info.ty, info.proto)?, -1)
            }
        };
        Ok(SckDev {
            hnd,
            side_chan,
            typ,
            state: SckState::INITIAL,
            localaddr: Skad::zeroed(),
            remoteaddr: Skad::zeroed(),
            orgdstaddr: Skad::zeroed(),
            tmrjob_index: Tmridx::INVALID,
            tmout: Ntime::ZERO,
            tls_ctx: None,
            tls: None,
            handler: Some(handler),
        })
    }

    /// Wraps a handle produced by `accept`. The listening device fills
    /// in addresses and state afterwards.
    fn from_accepted(hnd: RawFd, typ: SckType) -> io::Result<SckDev> {
        crate::sys::set_nonblock(hnd)?;
        crate::sys::set_cloexec(hnd)?;
        Ok(SckDev {
            hnd,
            side_chan: -1,
            typ,
            state: SckState::INITIAL,
            localaddr: Skad::zeroed(),
            remoteaddr: Skad::zeroed(),
            orgdstaddr: Skad::zeroed(),
            tmrjob_index: Tmridx::INVALID,
            tmout: Ntime::ZERO,
            tls_ctx: None,
            tls: None,
            handler: None,
        })
    }

    pub fn typ(&self) -> SckType {
        self.typ
    }

    pub fn state(&self) -> SckState {
        self.state
    }

    pub fn local_addr(&self) -> &Skad {
        &self.localaddr
    }

    pub fn peer_addr(&self) -> &Skad {
        &self.remoteaddr
    }

    /// Original destination before any REDIRECT/TPROXY rewriting.
    pub fn orig_dst_addr(&self) -> &Skad {
        &self.orgdstaddr
    }

    pub fn is_intercepted(&self) -> bool {
        self.state.contains(SckState::INTERCEPTED)
    }

    /// The far end of a `Qx` socket pair, for feeding the loop from
    /// outside.
    pub fn qx_side_channel(&self) -> RawFd {
        self.side_chan
    }

    fn do_bind(&mut self, opts: &BindOpts) -> Result<()> {
        let fd = self.hnd;
        let on: libc::c_int = 1;
        let onp = &on as *const _ as *const libc::c_void;
        let onlen = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let mut sockopt = |level: libc::c_int, name: libc::c_int, what: &str| -> Result<()> {
            match syscall!(setsockopt(fd, level, name, onp, onlen)) {
                Ok(_) => Ok(()),
                Err(_err) if opts.ignerr => Ok(()),
                Err(err) => Err(Error::with_msg(
                    Errnum::from_io(&err),
                    format!("unable to set {} - {}", what, err),
                )),
            }
        };

        if opts.reuseaddr {
            sockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, "SO_REUSEADDR")?;
        }
        if opts.reuseport {
            sockopt(libc::SOL_SOCKET, libc::SO_REUSEPORT, "SO_REUSEPORT")?;
        }
        if opts.broadcast {
            sockopt(libc::SOL_SOCKET, libc::SO_BROADCAST, "SO_BROADCAST")?;
        }
        if opts.transparent {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            sockopt(libc::SOL_IP, libc::IP_TRANSPARENT, "IP_TRANSPARENT")?;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            if !opts.ignerr {
                return Err(Error::new(Errnum::Noimpl));
            }
        }
        if opts.addr.is_ipv6() {
            sockopt(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, "IPV6_V6ONLY")?;
        }

        let skad = Skad::from(opts.addr);
        syscall!(bind(fd, skad.as_ptr(), skad.len())).map_err(Error::from_io)?;

        self.localaddr = sockname_of(fd).unwrap_or(skad);
        self.tls_ctx = opts.tls.clone();
        Ok(())
    }

    fn do_shutdown(&mut self, how: ShutHow) -> Result<()> {
        let how = match how {
            ShutHow::Read => libc::SHUT_RD,
            ShutHow::Write => libc::SHUT_WR,
            ShutHow::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.hnd, how))
            .map(|_| ())
            .map_err(Error::from_io)
    }
}

impl Device for SckDev {
    fn initial_cap(&self) -> DevCap {
        let extra = match type_info(self.typ) {
            Ok(info) => info.extra_cap,
            Err(_) => DevCap::EMPTY,
        };
        DevCap::IN | DevCap::OUT | extra
    }

    fn syshnd(&self) -> RawFd {
        self.hnd
    }

    fn is_syshnd_broken(&self) -> bool {
        self.hnd < 0
    }

    fn kill(&mut self, _force: u8) -> io::Result<()> {
        if let Some(tls) = self.tls.as_mut() {
            let _ = tls.shutdown();
        }
        self.tls = None;
        self.tls_ctx = None;

        if self.hnd >= 0 {
            syscall!(close(self.hnd))?;
            self.hnd = -1;
        }
        if self.side_chan >= 0 {
            let _ = syscall!(close(self.side_chan));
            self.side_chan = -1;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Option<Skad>)>> {
        if let Some(tls) = self.tls.as_mut() {
            return Ok(tls.read(buf)?.map(|n| (n, None)));
        }

        if is_stateful(self.typ) || self.typ == SckType::Qx {
            match syscall!(recv(
                self.hnd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0
            )) {
                Ok(n) => Ok(Some((n as usize, None))),
                Err(err) if would_block(err.raw_os_error().unwrap_or(0)) => Ok(None),
                Err(err) => Err(err),
            }
        } else {
            let mut src = Skad::zeroed();
            let mut len = Skad::capacity();
            match syscall!(recvfrom(
                self.hnd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                src.as_mut_ptr(),
                &mut len,
            )) {
                Ok(n) => {
                    src.set_len(len);
                    Ok(Some((n as usize, Some(src))))
                }
                Err(err) if would_block(err.raw_os_error().unwrap_or(0)) => Ok(None),
                Err(err) => Err(err),
            }
        }
    }

    fn write(&mut self, data: &[u8], dst: Option<&Skad>) -> io::Result<Option<usize>> {
        if let Some(tls) = self.tls.as_mut() {
            if data.is_empty() {
                // writing-finish indicator: send close-notify, leaving
                // the connection half-closed
                tls.shutdown()?;
                return Ok(Some(0));
            }
            return tls.write(data);
        }

        if data.is_empty() && is_stateful(self.typ) {
            syscall!(shutdown(self.hnd, libc::SHUT_WR))?;
            return Ok(Some(0));
        }

        let res = match dst {
            Some(dst) => syscall!(sendto(
                self.hnd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                SEND_FLAGS,
                dst.as_ptr(),
                dst.len(),
            )),
            None => syscall!(send(
                self.hnd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                SEND_FLAGS,
            )),
        };
        match res {
            Ok(n) => Ok(Some(n as usize)),
            Err(err) if would_block(err.raw_os_error().unwrap_or(0)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>], dst: Option<&Skad>) -> io::Result<Option<usize>> {
        if self.tls.is_some() {
            // scatter-gather does not cross the TLS seam; fall back to
            // the first non-empty buffer
            return match bufs.iter().find(|b| !b.is_empty()) {
                Some(b) => self.write(b, dst),
                None => self.write(&[], dst),
            };
        }
        if bufs.is_empty() {
            return self.write(&[], dst);
        }

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(dst) = dst {
            msg.msg_name = dst.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = dst.len();
        }
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;

        match syscall!(sendmsg(self.hnd, &msg, SEND_FLAGS)) {
            Ok(n) => Ok(Some(n as usize)),
            Err(err) if would_block(err.raw_os_error().unwrap_or(0)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn sendfile(&mut self, fd: RawFd, foff: u64, len: usize) -> io::Result<Option<usize>> {
        if self.tls.is_some() {
            return Err(io::ErrorKind::Unsupported.into());
        }
        let mut off = foff as libc::off_t;
        match syscall!(sendfile(self.hnd, fd, &mut off, len)) {
            Ok(n) => Ok(Some(n as usize)),
            Err(err) if would_block(err.raw_os_error().unwrap_or(0)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn ioctl(&mut self, cmd: &mut dyn Any) -> Result<()> {
        match cmd.downcast_mut::<SckIoctl>() {
            Some(SckIoctl::Bind(opts)) => {
                let opts = opts.clone();
                self.do_bind(&opts)
            }
            Some(SckIoctl::Shutdown(how)) => {
                let how = *how;
                self.do_shutdown(how)
            }
            None => Err(Error::new(Errnum::Inval)),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for SckDev {
    fn drop(&mut self) {
        if self.hnd >= 0 {
            unsafe {
                let _ = libc::close(self.hnd);
            }
        }
        if self.side_chan >= 0 {
            unsafe {
                let _ = libc::close(self.side_chan);
            }
        }
    }
}

/*
 * ===== event-callback glue =====
 *
 * The handler object lives inside the driver so any stage of progress
 * handling can reach it; it is taken out around each user call.
 */

fn with_handler<R>(
    hio: &mut Hio,
    id: DevId,
    f: impl FnOnce(&mut dyn SckHandler, &mut Hio) -> R,
) -> Option<R> {
    let mut handler = hio.dev_with::<SckDev, _>(id, |s| s.handler.take())??;
    let r = f(handler.as_mut(), hio);
    hio.dev_with::<SckDev, _>(id, |s| {
        if s.handler.is_none() {
            s.handler = Some(handler);
        }
    });
    Some(r)
}

fn run_on_connect(hio: &mut Hio, id: DevId) -> Result<()> {
    with_handler(hio, id, |h, hio| h.on_connect(hio, id)).unwrap_or(Ok(()))
}

/// Event-callback shim every socket device is registered with; the
/// real logic lives in the progress functions below.
pub(crate) struct SckEvCb;

impl EvCb for SckEvCb {
    fn ready(&mut self, hio: &mut Hio, dev: DevId, events: DevEvent) -> Result<EvGate> {
        sck_ready(hio, dev, events)
    }

    fn on_read(
        &mut self,
        hio: &mut Hio,
        dev: DevId,
        rd: Rd<'_>,
        src: Option<&Skad>,
    ) -> Result<RdCtl> {
        with_handler(hio, dev, |h, hio| h.on_read(hio, dev, rd, src))
            .unwrap_or(Ok(RdCtl::Stop))
    }

    fn on_write(
        &mut self,
        hio: &mut Hio,
        dev: DevId,
        res: WrRes,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        with_handler(hio, dev, |h, hio| h.on_write(hio, dev, res, ctx, dst)).unwrap_or(Ok(()))
    }

    fn on_kill(&mut self, hio: &mut Hio, dev: DevId) {
        let tmridx = hio
            .dev_with::<SckDev, _>(dev, |s| {
                std::mem::replace(&mut s.tmrjob_index, Tmridx::INVALID)
            })
            .unwrap_or(Tmridx::INVALID);
        if tmridx.is_valid() {
            hio.deltmrjob(tmridx);
        }
        // on_disconnect fires even when on_connect never did: a
        // connect or handshake cut short still gets a notification
        with_handler(hio, dev, |h, hio| h.on_disconnect(hio, dev));
    }
}

fn sck_ready(hio: &mut Hio, id: DevId, events: DevEvent) -> Result<EvGate> {
    let Some((fd, state, stateful)) =
        hio.dev_with::<SckDev, _>(id, |s| (s.hnd, s.state, is_stateful(s.typ)))
    else {
        return Ok(EvGate::Skip);
    };

    if events.contains(DevEvent::ERR) {
        // the real failure is on the socket, not in errno
        let err = match so_error(fd) {
            Ok(code) if code != 0 => Error::from_io(io::Error::from_raw_os_error(code)),
            Ok(_) => Error::with_msg(Errnum::Deverr, "device error with no SO_ERROR code"),
            Err(_) => Error::with_msg(Errnum::Deverr, "device error - unable to get SO_ERROR"),
        };
        return Err(hio.seterr(err));
    }

    if !stateful {
        if events.contains(DevEvent::HUP) {
            return Err(hio.seterr(Error::new(Errnum::Devhup)));
        }
        return Ok(EvGate::Proceed);
    }

    match state.progress() {
        SckState::CONNECTING => {
            if events.contains(DevEvent::HUP) {
                Err(hio.seterr(Error::new(Errnum::Devhup)))
            } else if events.intersects(DevEvent::PRI | DevEvent::IN) {
                Err(hio.seterr(Error::with_msg(Errnum::Deverr, "invalid event mask")))
            } else if events.contains(DevEvent::OUT) {
                harvest_outgoing_connection(hio, id)
            } else {
                Ok(EvGate::Skip)
            }
        }
        SckState::CONNECTING_SSL => {
            if events.contains(DevEvent::HUP) {
                Err(hio.seterr(Error::new(Errnum::Devhup)))
            } else if events.contains(DevEvent::PRI) {
                Err(hio.seterr(Error::with_msg(Errnum::Deverr, "invalid event mask")))
            } else if events.intersects(DevEvent::IN | DevEvent::OUT) {
                tls_progress(hio, id, SckState::CONNECTED)?;
                Ok(EvGate::Skip)
            } else {
                Ok(EvGate::Skip)
            }
        }
        SckState::LISTENING => {
            if events.contains(DevEvent::HUP) {
                Err(hio.seterr(Error::new(Errnum::Devhup)))
            } else if events.intersects(DevEvent::PRI | DevEvent::OUT) {
                Err(hio.seterr(Error::with_msg(Errnum::Deverr, "invalid event mask")))
            } else if events.contains(DevEvent::IN) {
                match accept_incoming_connection(hio, id) {
                    Ok(()) => Ok(EvGate::Skip),
                    Err(err) => {
                        if state.contains(SckState::LENIENT) {
                            debug!("{:?} - lenient listener ignoring accept failure - {}", id, err);
                            Ok(EvGate::Skip)
                        } else {
                            // the core kills this listening device
                            Err(err)
                        }
                    }
                }
            } else {
                Ok(EvGate::Skip)
            }
        }
        SckState::ACCEPTING_SSL => {
            if events.contains(DevEvent::HUP) {
                Err(hio.seterr(Error::new(Errnum::Devhup)))
            } else if events.contains(DevEvent::PRI) {
                Err(hio.seterr(Error::with_msg(Errnum::Deverr, "invalid event mask")))
            } else if events.intersects(DevEvent::IN | DevEvent::OUT) {
                tls_progress(hio, id, SckState::ACCEPTED)?;
                Ok(EvGate::Skip)
            } else {
                Ok(EvGate::Skip)
            }
        }
        _ => {
            if events.contains(DevEvent::HUP) {
                if events.intersects(DevEvent::PRI | DevEvent::IN | DevEvent::OUT) {
                    // probably half-open; let the read path see the EOF
                    return Ok(EvGate::Proceed);
                }
                return Err(hio.seterr(Error::new(Errnum::Devhup)));
            }
            Ok(EvGate::Proceed)
        }
    }
}

fn cancel_progress_timer(hio: &mut Hio, id: DevId) {
    let tmridx = hio
        .dev_with::<SckDev, _>(id, |s| std::mem::replace(&mut s.tmrjob_index, Tmridx::INVALID))
        .unwrap_or(Tmridx::INVALID);
    if tmridx.is_valid() {
        hio.deltmrjob(tmridx);
    }
}

fn harvest_outgoing_connection(hio: &mut Hio, id: DevId) -> Result<EvGate> {
    let Some(fd) = hio.dev_with::<SckDev, _>(id, |s| s.hnd) else {
        return Ok(EvGate::Skip);
    };

    let errcode = match so_error(fd) {
        Ok(code) => code,
        Err(err) => {
            return Err(hio.seterr(Error::with_msg(
                Errnum::Deverr,
                format!("unable to get SO_ERROR - {}", err),
            )))
        }
    };

    if errcode == 0 {
        cancel_progress_timer(hio, id);
        let has_tls = hio
            .dev_with::<SckDev, _>(id, |s| {
                s.localaddr = sockname_of(s.hnd).unwrap_or(Skad::zeroed());
                s.tls_ctx.is_some()
            })
            .unwrap_or(false);

        if has_tls {
            start_tls_session(hio, id, false, SckState::CONNECTING_SSL)?;
            // pump the handshake right away; it may complete without
            // another readiness event
            tls_progress(hio, id, SckState::CONNECTED)?;
        } else {
            hio.dev_with::<SckDev, _>(id, |s| s.state.set_progress(SckState::CONNECTED));
            if let Err(err) = run_on_connect(hio, id) {
                return Err(hio.seterr(err));
            }
        }
        Ok(EvGate::Skip)
    } else if errcode == libc::EINPROGRESS || errcode == libc::EWOULDBLOCK {
        Ok(EvGate::Skip) // still connecting
    } else {
        Err(hio.seterr(Error::from_io(io::Error::from_raw_os_error(errcode))))
    }
}

fn start_tls_session(hio: &mut Hio, id: DevId, server: bool, progress: SckState) -> Result<()> {
    let res = hio.dev_with::<SckDev, _>(id, |s| {
        if s.tls.is_none() {
            let ctx = s.tls_ctx.as_ref().expect("TLS progress without context");
            match ctx.new_session(s.hnd, server) {
                Ok(session) => s.tls = Some(session),
                Err(err) => return Err(Error::from_io(err)),
            }
        }
        s.state.set_progress(progress);
        Ok(())
    });
    match res {
        Some(Ok(())) => Ok(()),
        Some(Err(err)) => Err(hio.seterr(err)),
        None => Err(hio.seterr(Error::new(Errnum::Noent))),
    }
}

/// Pumps the TLS handshake; on completion moves to `done_progress` and
/// reports the connection.
fn tls_progress(hio: &mut Hio, id: DevId, done_progress: SckState) -> Result<()> {
    let step = hio.dev_with::<SckDev, _>(id, |s| {
        let tls = s.tls.as_mut().expect("TLS progress without session");
        tls.handshake()
    });

    match step {
        None => Ok(()),
        Some(Err(err)) => Err(hio.seterr(Error::from_io(err))),
        Some(Ok(Some(TlsWant::Read))) => hio.dev_watch(id, WatchCmd::Update, DevEvent::IN),
        Some(Ok(Some(TlsWant::Write))) => {
            hio.dev_watch(id, WatchCmd::Update, DevEvent::IN | DevEvent::OUT)
        }
        Some(Ok(None)) => {
            cancel_progress_timer(hio, id);
            hio.dev_with::<SckDev, _>(id, |s| s.state.set_progress(done_progress));
            // watch returns to plain input now that the handshake no
            // longer drives the event mask
            hio.dev_watch(id, WatchCmd::Renew, DevEvent::IN)?;
            if let Err(err) = run_on_connect(hio, id) {
                return Err(hio.seterr(err));
            }
            Ok(())
        }
    }
}

fn accept_incoming_connection(hio: &mut Hio, lid: DevId) -> Result<()> {
    let Some(lfd) = hio.dev_with::<SckDev, _>(lid, |s| s.hnd) else {
        return Ok(());
    };

    let mut remote = Skad::zeroed();
    let mut addrlen = Skad::capacity();

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let res = syscall!(accept4(
        lfd,
        remote.as_mut_ptr(),
        &mut addrlen,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ));
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    let res = syscall!(accept(lfd, remote.as_mut_ptr(), &mut addrlen));

    let clisck = match res {
        Ok(fd) => fd,
        Err(err) if would_block(err.raw_os_error().unwrap_or(0)) => return Ok(()),
        Err(err) => return Err(hio.seterr(Error::from_io(err))),
    };
    remote.set_len(addrlen);

    make_accepted_client_connection(hio, lid, clisck, remote)
}

fn make_accepted_client_connection(
    hio: &mut Hio,
    lid: DevId,
    clisck: RawFd,
    remote: Skad,
) -> Result<()> {
    let Some((ltype, ltmout, ltls, llocal)) = hio.dev_with::<SckDev, _>(lid, |s| {
        (s.typ, s.tmout, s.tls_ctx.clone(), s.localaddr)
    }) else {
        unsafe {
            let _ = libc::close(clisck);
        }
        return Ok(());
    };

    let child = match SckDev::from_accepted(clisck, ltype) {
        Ok(child) => child,
        Err(err) => {
            unsafe {
                let _ = libc::close(clisck);
            }
            return Err(hio.seterr(Error::from_io(err)));
        }
    };

    let cid = hio.dev_make(Box::new(child), Box::new(SckEvCb))?;

    hio.dev_with::<SckDev, _>(cid, |s| {
        s.remoteaddr = remote;
        s.localaddr = sockname_of(s.hnd).unwrap_or(llocal);

        // REDIRECT leaves the original destination retrievable; when
        // the rule is absent this reads back the local address
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let mut org = Skad::zeroed();
            let mut len = Skad::capacity();
            let r = unsafe {
                libc::getsockopt(
                    s.hnd,
                    libc::SOL_IP,
                    SO_ORIGINAL_DST,
                    org.as_mut_ptr() as *mut libc::c_void,
                    &mut len,
                )
            };
            if r == -1 {
                s.orgdstaddr = llocal;
            } else {
                org.set_len(len);
                s.orgdstaddr = org;
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            s.orgdstaddr = llocal;
        }

        if !s.orgdstaddr.equal(&s.localaddr, false) {
            s.state.insert(SckState::INTERCEPTED);
        } else if s.localaddr.port() != llocal.port() {
            // TPROXY keeps the address but typically rewrites the port
            s.state.insert(SckState::INTERCEPTED);
        }
        s.tmout = ltmout;
    });

    // the listener's handler decides how the child behaves
    let child_handler = match with_handler(hio, lid, |h, hio| h.on_accept(hio, lid, cid)) {
        Some(Ok(handler)) => handler,
        Some(Err(err)) => {
            debug!("{:?} - accept handler rejected connection - {}", cid, err);
            hio.dev_halt(cid);
            return Ok(());
        }
        None => {
            hio.dev_halt(cid);
            return Ok(());
        }
    };
    hio.dev_with::<SckDev, _>(cid, |s| s.handler = Some(child_handler));

    if ltls.is_some() {
        hio.dev_with::<SckDev, _>(cid, |s| s.tls_ctx = ltls.clone());
        start_tls_session(hio, cid, true, SckState::ACCEPTING_SSL)?;
        if ltmout.is_pos() {
            if arm_progress_timer(hio, cid, ltmout, SckState::ACCEPTING_SSL).is_err() {
                debug!("{:?} - ssl-accept timeout scheduling failed, halting", cid);
                hio.dev_halt(cid);
            }
        }
    } else {
        hio.dev_with::<SckDev, _>(cid, |s| s.state.set_progress(SckState::ACCEPTED));
        if let Err(err) = run_on_connect(hio, cid) {
            debug!("{:?} - on_connect failed for accepted socket - {}", cid, err);
            hio.seterr(err);
            hio.dev_halt(cid);
        }
    }

    Ok(())
}

/// Halts the device when the watched progress state is still pending
/// at the deadline.
fn arm_progress_timer(
    hio: &mut Hio,
    id: DevId,
    tmout: Ntime,
    pending: SckState,
) -> Result<()> {
    let idx = hio.schedtmrjob_after(tmout, move |hio, _now| {
        let still_pending = hio
            .dev_with::<SckDev, _>(id, |s| {
                s.tmrjob_index = Tmridx::INVALID;
                s.state.progress() == pending.progress()
            })
            .unwrap_or(false);
        if still_pending {
            debug!("{:?} - progress timed out, halting", id);
            hio.seterr(Error::new(Errnum::Tmout));
            hio.dev_halt(id);
        }
    })?;
    hio.dev_with::<SckDev, _>(id, |s| s.tmrjob_index = idx);
    Ok(())
}

/*
 * ===== public socket operations =====
 */

impl Hio {
    /// Creates a socket device of the given flavor.
    pub fn sck_make(&mut self, typ: SckType, handler: Box<dyn SckHandler>) -> Result<DevId> {
        let dev = match SckDev::open(typ, handler) {
            Ok(dev) => dev,
            Err(err) => return Err(self.seterr(Error::from_io(err))),
        };
        self.dev_make(Box::new(dev), Box::new(SckEvCb))
    }

    /// Applies socket options, binds the local address and, for a
    /// future listener, installs the TLS server context.
    pub fn sck_bind(&mut self, id: DevId, opts: &BindOpts) -> Result<()> {
        let mut cmd = SckIoctl::Bind(opts.clone());
        self.dev_ioctl(id, &mut cmd)
    }

    /// Starts a non-blocking connect. The result, including an
    /// immediate success, is delivered through the readiness handler:
    /// `on_connect` once the socket (and the optional TLS handshake)
    /// is up, or `on_disconnect` after a halt on failure or timeout.
    pub fn sck_connect(&mut self, id: DevId, opts: ConnectOpts) -> Result<()> {
        let skad = Skad::from(opts.addr);
        let tmout = opts.tmout.unwrap_or(Ntime::ZERO);

        let res = self.dev_with::<SckDev, _>(id, |s| {
            s.tls_ctx = opts.tls.clone();
            s.tmout = tmout;
            s.remoteaddr = skad;
            syscall!(connect(s.hnd, skad.as_ptr(), skad.len()))
        });
        let res = match res {
            Some(res) => res,
            None => return Err(self.seterr(Error::new(Errnum::Noent))),
        };

        match res {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => return Err(self.seterr(Error::from_io(err))),
        }

        // even an immediate success goes through the ready handler so
        // on_connect never runs inside this call
        self.dev_with::<SckDev, _>(id, |s| s.state.set_progress(SckState::CONNECTING));
        self.dev_watch(id, WatchCmd::Update, DevEvent::IN | DevEvent::OUT)?;

        if tmout.is_pos() {
            arm_progress_timer(self, id, tmout, SckState::CONNECTING)?;
        }
        Ok(())
    }

    /// Enters the listening state.
    pub fn sck_listen(&mut self, id: DevId, opts: &ListenOpts) -> Result<()> {
        let res = self.dev_with::<SckDev, _>(id, |s| syscall!(listen(s.hnd, opts.backlog)));
        match res {
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(self.seterr(Error::from_io(err))),
            None => return Err(self.seterr(Error::new(Errnum::Noent))),
        }

        self.dev_with::<SckDev, _>(id, |s| {
            s.tmout = opts.accept_tmout.unwrap_or(Ntime::ZERO);
            if opts.lenient {
                s.state.insert(SckState::LENIENT);
            }
            s.state.set_progress(SckState::LISTENING);
        });

        // some kqueue systems deliver no accept readiness on a socket
        // registered before listen(); re-register it
        let rereg = Mux::REREG_AFTER_LISTEN
            && self
                .dev_cap(id)
                .map_or(false, |cap| cap.contains(DevCap::WATCH_REREG_REQUIRED));
        if rereg {
            self.dev_watch(id, WatchCmd::Stop, DevEvent::EMPTY)?;
            self.dev_watch(id, WatchCmd::Start, DevEvent::EMPTY)?;
        }
        Ok(())
    }

    pub fn sck_shutdown(&mut self, id: DevId, how: ShutHow) -> Result<()> {
        let mut cmd = SckIoctl::Shutdown(how);
        self.dev_ioctl(id, &mut cmd)
    }

    pub fn sck_state(&mut self, id: DevId) -> Option<SckState> {
        self.dev_with::<SckDev, _>(id, |s| s.state)
    }

    pub fn sck_local_addr(&mut self, id: DevId) -> Option<Skad> {
        self.dev_with::<SckDev, _>(id, |s| s.localaddr)
    }

    pub fn sck_peer_addr(&mut self, id: DevId) -> Option<Skad> {
        self.dev_with::<SckDev, _>(id, |s| s.remoteaddr)
    }

    pub fn sck_orig_dst_addr(&mut self, id: DevId) -> Option<Skad> {
        self.dev_with::<SckDev, _>(id, |s| s.orgdstaddr)
    }
}
