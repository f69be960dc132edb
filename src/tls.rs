//! TLS integration seam.
//!
//! The runtime does not ship a TLS implementation; the socket device
//! only drives the handshake-progress protocol: start a session from a
//! context, pump `handshake` until it stops asking for socket
//! readiness, then route reads and writes through the session instead
//! of the raw socket. Any TLS library can sit behind these traits.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

/// What a partially-done handshake is waiting for. The socket device
/// narrows its event watch accordingly.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TlsWant {
    Read,
    Write,
}

/// One TLS session bound to a socket handle.
pub trait TlsSession {
    /// Advances the handshake. `Ok(None)` means it is complete;
    /// `Ok(Some(want))` means the socket must become readable or
    /// writable first.
    fn handshake(&mut self) -> io::Result<Option<TlsWant>>;

    /// Reads decrypted bytes. `Ok(None)` means the operation would
    /// block.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Writes plaintext bytes. `Ok(None)` means the operation would
    /// block.
    fn write(&mut self, data: &[u8]) -> io::Result<Option<usize>>;

    /// Sends the close-notify alert; used when the write half closes.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// A TLS configuration that can mint sessions over raw handles. A
/// listener shares one context with every socket it accepts.
pub trait TlsContext {
    fn new_session(&self, hnd: RawFd, server: bool) -> io::Result<Box<dyn TlsSession>>;
}

pub type SharedTlsContext = Rc<dyn TlsContext>;
