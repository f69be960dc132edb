#![allow(unused_macros)]

/// Helper macro to execute a system call that returns an `io::Result`.
#[cfg(unix)]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

macro_rules! cfg_os_poll {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "os-poll")]
            #[cfg_attr(docsrs, doc(cfg(feature = "os-poll")))]
            $item
        )*
    }
}

macro_rules! cfg_net {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "net")]
            #[cfg_attr(docsrs, doc(cfg(feature = "net")))]
            $item
        )*
    }
}

macro_rules! cfg_http {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "http")]
            #[cfg_attr(docsrs, doc(cfg(feature = "http")))]
            $item
        )*
    }
}

// Forwarders to the `log` facade; without the `log` feature they
// expand to nothing.
#[cfg(feature = "log")]
macro_rules! trace {
    ($($t:tt)*) => { log::trace!($($t)*) }
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($t:tt)*) => {{}};
}

#[cfg(feature = "log")]
macro_rules! debug {
    ($($t:tt)*) => { log::debug!($($t)*) }
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($t:tt)*) => {{}};
}

#[cfg(feature = "log")]
macro_rules! warn_log {
    ($($t:tt)*) => { log::warn!($($t)*) }
}
#[cfg(not(feature = "log"))]
macro_rules! warn_log {
    ($($t:tt)*) => {{}};
}
