//! Socket address storage shared by every socket flavor.
//!
//! `Skad` is a thin wrapper over `sockaddr_storage` so one type can
//! carry IPv4, IPv6, unix and link-level addresses through the device
//! interface and back out of `getsockname`/`accept`/`recvfrom`.

use std::fmt;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

#[derive(Clone, Copy)]
pub struct Skad {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl Skad {
    pub fn zeroed() -> Skad {
        Skad {
            storage: unsafe { mem::zeroed() },
            len: 0,
        }
    }

    pub fn family(&self) -> libc::sa_family_t {
        self.storage.ss_family
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_unspecified(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub(crate) fn capacity() -> libc::socklen_t {
        mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t
    }

    pub(crate) fn set_len(&mut self, len: libc::socklen_t) {
        self.len = len;
    }

    pub fn from_unix_path(path: &Path) -> Option<Skad> {
        use std::os::unix::ffi::OsStrExt;

        let bytes = path.as_os_str().as_bytes();
        let mut skad = Skad::zeroed();
        let sun = unsafe { &mut *(skad.as_mut_ptr() as *mut libc::sockaddr_un) };
        if bytes.len() >= sun.sun_path.len() {
            return None;
        }
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        skad.len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
        Some(skad)
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let ip = u32::from_be(sin.sin_addr.s_addr);
                Some(SocketAddr::V4(SocketAddrV4::new(
                    ip.into(),
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    sin6.sin6_addr.s6_addr.into(),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    /// The port number in host byte order, or 0 for non-inet families.
    pub fn port(&self) -> u16 {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                u16::from_be(sin.sin_port)
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                u16::from_be(sin6.sin6_port)
            }
            _ => 0,
        }
    }

    /// Address equality. With `with_port` the port numbers must match
    /// too; without it only family and host address are compared, which
    /// is what interception detection needs.
    pub fn equal(&self, other: &Skad, with_port: bool) -> bool {
        if self.storage.ss_family != other.storage.ss_family {
            return false;
        }
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let a = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in) };
                let b = unsafe { &*(other.as_ptr() as *const libc::sockaddr_in) };
                a.sin_addr.s_addr == b.sin_addr.s_addr
                    && (!with_port || a.sin_port == b.sin_port)
            }
            libc::AF_INET6 => {
                let a = unsafe { &*(self.as_ptr() as *const libc::sockaddr_in6) };
                let b = unsafe { &*(other.as_ptr() as *const libc::sockaddr_in6) };
                a.sin6_addr.s6_addr == b.sin6_addr.s6_addr
                    && a.sin6_scope_id == b.sin6_scope_id
                    && (!with_port || a.sin6_port == b.sin6_port)
            }
            _ => {
                if self.len != other.len {
                    return false;
                }
                let n = self.len as usize;
                let a = unsafe {
                    std::slice::from_raw_parts(self.as_ptr() as *const u8, n)
                };
                let b = unsafe {
                    std::slice::from_raw_parts(other.as_ptr() as *const u8, n)
                };
                a == b
            }
        }
    }
}

impl From<SocketAddr> for Skad {
    fn from(addr: SocketAddr) -> Skad {
        let mut skad = Skad::zeroed();
        match addr {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(skad.as_mut_ptr() as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                skad.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(skad.as_mut_ptr() as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                skad.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        skad
    }
}

impl PartialEq for Skad {
    fn eq(&self, other: &Skad) -> bool {
        self.equal(other, true)
    }
}

impl fmt::Debug for Skad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None if self.len == 0 => write!(f, "(unspecified)"),
            None => write!(f, "(af {})", self.storage.ss_family),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "127.0.0.1:19997".parse().unwrap();
        let skad = Skad::from(addr);
        assert_eq!(skad.to_socket_addr(), Some(addr));
        assert_eq!(skad.port(), 19997);
        assert_eq!(skad.family(), libc::AF_INET as libc::sa_family_t);
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        let skad = Skad::from(addr);
        assert_eq!(skad.to_socket_addr(), Some(addr));
    }

    #[test]
    fn equality_with_and_without_port() {
        let a = Skad::from("10.0.0.1:80".parse::<SocketAddr>().unwrap());
        let b = Skad::from("10.0.0.1:8080".parse::<SocketAddr>().unwrap());
        let c = Skad::from("10.0.0.2:80".parse::<SocketAddr>().unwrap());
        assert!(a.equal(&b, false));
        assert!(!a.equal(&b, true));
        assert!(!a.equal(&c, false));
    }
}
