use crate::cap::DevEvent;

/// Token value reserved for the wake-up pipe.
pub(crate) const WAKER_TOKEN: u64 = u64::MAX;

/// Multiplexer control commands.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum MuxCmd {
    Insert,
    Update,
    Delete,
}

/// One readiness report out of a `wait` call.
#[derive(Debug)]
pub(crate) struct MuxEvent {
    pub token: u64,
    pub events: DevEvent,
    pub rdhup: bool,
}

#[cfg(all(
    not(evio_force_poll),
    any(target_os = "linux", target_os = "android")
))]
mod epoll;
#[cfg(all(
    not(evio_force_poll),
    any(target_os = "linux", target_os = "android")
))]
pub(crate) use self::epoll::Mux;

#[cfg(all(
    not(evio_force_poll),
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
mod kqueue;
#[cfg(all(
    not(evio_force_poll),
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
pub(crate) use self::kqueue::Mux;

#[cfg(any(
    evio_force_poll,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    ))
))]
mod poll;
#[cfg(any(
    evio_force_poll,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    ))
))]
pub(crate) use self::poll::Mux;
