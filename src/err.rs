//! Error taxonomy shared by every fallible operation in the runtime.
//!
//! System call failures travel as `std::io::Error` up to the layer that
//! owns the host context, where they are translated through a single
//! errno mapping table. The host keeps the last error so callbacks can
//! inspect it the same way any direct caller can.

use std::fmt;
use std::io;

/// Error kinds reported by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Errnum {
    /// No error.
    Noerr,
    /// Generic error without a more specific kind.
    Generic,
    /// Not implemented on this platform or device.
    Noimpl,
    /// System error outside the mapped set.
    Syserr,
    /// Internal inconsistency.
    Intern,
    /// Memory allocation failure.
    Sysmem,
    /// Invalid parameter or state.
    Inval,
    /// No such entry.
    Noent,
    /// Entry already exists.
    Exist,
    /// Resource busy.
    Busy,
    /// Access denied.
    Acces,
    /// Operation not permitted.
    Perm,
    /// Not a directory.
    Notdir,
    /// Interrupted.
    Intr,
    /// Broken pipe.
    Pipe,
    /// Resource temporarily unavailable.
    Again,
    /// Bad system handle.
    Badhnd,
    /// Bad request or malformed message.
    Badre,
    /// Too many open files in the process.
    Mfile,
    /// Too many open files in the system.
    Nfile,
    /// I/O error.
    Ioerr,
    /// Character encoding conversion error.
    Ecerr,
    /// Incomplete character sequence.
    Ecmore,
    /// Buffer full.
    Buffull,
    /// Connection lost.
    Conlost,
    /// Connection refused.
    Conrf,
    /// Connection reset.
    Conrs,
    /// No capability for the requested operation.
    Nocapa,
    /// Operation timed out.
    Tmout,
    /// No response.
    Norsp,
    /// Device creation failure.
    Devmake,
    /// Device error.
    Deverr,
    /// Device hang-up.
    Devhup,
}

impl Errnum {
    /// The single errno translation table. The numeric code is kept in
    /// the formatted message by the caller.
    pub fn from_errno(errno: i32) -> Errnum {
        match errno {
            0 => Errnum::Noerr,
            libc::ENOMEM => Errnum::Sysmem,
            libc::EINVAL => Errnum::Inval,
            libc::EACCES => Errnum::Acces,
            libc::EPERM => Errnum::Perm,
            libc::ENOTDIR => Errnum::Notdir,
            libc::ENOENT => Errnum::Noent,
            libc::EEXIST => Errnum::Exist,
            libc::EBUSY => Errnum::Busy,
            libc::EINTR => Errnum::Intr,
            libc::EPIPE => Errnum::Pipe,
            libc::EAGAIN => Errnum::Again,
            #[allow(unreachable_patterns)] // EWOULDBLOCK may alias EAGAIN
            libc::EWOULDBLOCK => Errnum::Again,
            libc::EBADF => Errnum::Badhnd,
            libc::EMFILE => Errnum::Mfile,
            libc::ENFILE => Errnum::Nfile,
            libc::EIO => Errnum::Ioerr,
            libc::ECONNREFUSED => Errnum::Conrf,
            libc::ECONNRESET => Errnum::Conrs,
            libc::ETIMEDOUT => Errnum::Tmout,
            libc::ENOSYS => Errnum::Noimpl,
            libc::EOPNOTSUPP => Errnum::Noimpl,
            _ => Errnum::Syserr,
        }
    }

    pub fn from_io(err: &io::Error) -> Errnum {
        match err.raw_os_error() {
            Some(errno) => Errnum::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::WouldBlock => Errnum::Again,
                io::ErrorKind::Interrupted => Errnum::Intr,
                io::ErrorKind::InvalidInput => Errnum::Inval,
                io::ErrorKind::TimedOut => Errnum::Tmout,
                io::ErrorKind::PermissionDenied => Errnum::Acces,
                io::ErrorKind::OutOfMemory => Errnum::Sysmem,
                io::ErrorKind::Unsupported => Errnum::Noimpl,
                _ => Errnum::Syserr,
            },
        }
    }

    pub fn errstr(&self) -> &'static str {
        match self {
            Errnum::Noerr => "no error",
            Errnum::Generic => "generic error",
            Errnum::Noimpl => "not implemented",
            Errnum::Syserr => "system error",
            Errnum::Intern => "internal error",
            Errnum::Sysmem => "insufficient system memory",
            Errnum::Inval => "invalid parameter or data",
            Errnum::Noent => "data not found",
            Errnum::Exist => "existing data",
            Errnum::Busy => "busy",
            Errnum::Acces => "access denied",
            Errnum::Perm => "operation not permitted",
            Errnum::Notdir => "not a directory",
            Errnum::Intr => "interrupted",
            Errnum::Pipe => "broken pipe",
            Errnum::Again => "resource temporarily unavailable",
            Errnum::Badhnd => "bad system handle",
            Errnum::Badre => "bad request or response",
            Errnum::Mfile => "too many open files",
            Errnum::Nfile => "too many open files in the system",
            Errnum::Ioerr => "I/O error",
            Errnum::Ecerr => "encoding conversion error",
            Errnum::Ecmore => "incomplete sequence",
            Errnum::Buffull => "buffer full",
            Errnum::Conlost => "connection lost",
            Errnum::Conrf => "connection refused",
            Errnum::Conrs => "connection reset",
            Errnum::Nocapa => "no capability",
            Errnum::Tmout => "timed out",
            Errnum::Norsp => "no response",
            Errnum::Devmake => "unable to make device",
            Errnum::Deverr => "device error",
            Errnum::Devhup => "device hang-up",
        }
    }
}

/// An error kind plus its formatted message.
#[derive(Clone, Debug)]
pub struct Error {
    num: Errnum,
    msg: String,
}

impl Error {
    pub fn new(num: Errnum) -> Error {
        Error {
            num,
            msg: num.errstr().to_string(),
        }
    }

    pub fn with_msg(num: Errnum, msg: impl Into<String>) -> Error {
        Error {
            num,
            msg: msg.into(),
        }
    }

    pub fn from_io(err: io::Error) -> Error {
        let num = Errnum::from_io(&err);
        let msg = match err.raw_os_error() {
            Some(errno) => format!("{} (errno {})", err, errno),
            None => err.to_string(),
        };
        Error { num, msg }
    }

    pub fn num(&self) -> Errnum {
        self.num
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from_io(err)
    }
}

impl From<Errnum> for Error {
    fn from(num: Errnum) -> Error {
        Error::new(num)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Errnum::from_errno(libc::EAGAIN), Errnum::Again);
        assert_eq!(Errnum::from_errno(libc::ECONNREFUSED), Errnum::Conrf);
        assert_eq!(Errnum::from_errno(libc::EBADF), Errnum::Badhnd);
        assert_eq!(Errnum::from_errno(123456), Errnum::Syserr);
    }

    #[test]
    fn io_error_keeps_code_in_message() {
        let err = Error::from_io(io::Error::from_raw_os_error(libc::EPIPE));
        assert_eq!(err.num(), Errnum::Pipe);
        assert!(err.msg().contains(&libc::EPIPE.to_string()));
    }
}
