//! Nanosecond time values and the monotonic time source.
//!
//! All scheduling inside the runtime uses durations relative to the
//! instant the host context was created, so the values stay small and
//! directly comparable. The wall clock is only read for log timestamps.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

const NSECS_PER_SEC: i64 = 1_000_000_000;

/// A signed duration with nanosecond resolution.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ntime {
    sec: i64,
    nsec: u32,
}

impl Ntime {
    pub const ZERO: Ntime = Ntime { sec: 0, nsec: 0 };

    pub const fn new(sec: i64, nsec: u32) -> Ntime {
        Ntime { sec, nsec }
    }

    pub const fn from_secs(sec: i64) -> Ntime {
        Ntime { sec, nsec: 0 }
    }

    pub const fn from_millis(ms: i64) -> Ntime {
        Ntime {
            sec: ms / 1_000,
            nsec: ((ms % 1_000) * 1_000_000) as u32,
        }
    }

    pub const fn sec(&self) -> i64 {
        self.sec
    }

    pub const fn nsec(&self) -> u32 {
        self.nsec
    }

    /// A positive, non-zero duration. Timer arming treats anything else
    /// as "no timeout".
    pub const fn is_pos(&self) -> bool {
        self.sec > 0 || (self.sec == 0 && self.nsec > 0)
    }

    /// Whole milliseconds, rounding a sub-millisecond remainder up so a
    /// short timeout never collapses to a busy-looping zero.
    pub fn as_millis_ceil(&self) -> i64 {
        if self.sec < 0 {
            return 0;
        }
        self.sec
            .saturating_mul(1_000)
            .saturating_add((i64::from(self.nsec) + 999_999) / 1_000_000)
    }
}

impl From<Duration> for Ntime {
    fn from(d: Duration) -> Ntime {
        Ntime {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos(),
        }
    }
}

impl Add for Ntime {
    type Output = Ntime;

    fn add(self, rhs: Ntime) -> Ntime {
        let mut sec = self.sec + rhs.sec;
        let mut nsec = self.nsec + rhs.nsec;
        if nsec >= NSECS_PER_SEC as u32 {
            nsec -= NSECS_PER_SEC as u32;
            sec += 1;
        }
        Ntime { sec, nsec }
    }
}

impl AddAssign for Ntime {
    fn add_assign(&mut self, rhs: Ntime) {
        *self = *self + rhs;
    }
}

impl Sub for Ntime {
    type Output = Ntime;

    fn sub(self, rhs: Ntime) -> Ntime {
        let mut sec = self.sec - rhs.sec;
        let nsec = if self.nsec < rhs.nsec {
            sec -= 1;
            self.nsec + NSECS_PER_SEC as u32 - rhs.nsec
        } else {
            self.nsec - rhs.nsec
        };
        Ntime { sec, nsec }
    }
}

impl SubAssign for Ntime {
    fn sub_assign(&mut self, rhs: Ntime) {
        *self = *self - rhs;
    }
}

impl fmt::Debug for Ntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.sec, self.nsec)
    }
}

fn clock_gettime(clock: libc::clockid_t) -> Ntime {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC and CLOCK_REALTIME cannot fail with a valid
    // timespec pointer on the supported platforms.
    let _ = syscall!(clock_gettime(clock, &mut ts));
    Ntime {
        sec: ts.tv_sec as i64,
        nsec: ts.tv_nsec as u32,
    }
}

/// Reads the monotonic clock.
pub(crate) fn monotonic_now() -> Ntime {
    clock_gettime(libc::CLOCK_MONOTONIC)
}

/// Reads the wall clock. Only meant for log timestamps.
pub(crate) fn realtime_now() -> Ntime {
    clock_gettime(libc::CLOCK_REALTIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_carry() {
        let a = Ntime::new(1, 999_999_999);
        let b = Ntime::new(0, 2);
        assert_eq!(a + b, Ntime::new(2, 1));
        assert_eq!((a + b) - b, a);
        assert_eq!(Ntime::new(2, 0) - Ntime::new(0, 1), Ntime::new(1, 999_999_999));
    }

    #[test]
    fn millis_round_up() {
        assert_eq!(Ntime::new(0, 1).as_millis_ceil(), 1);
        assert_eq!(Ntime::new(0, 0).as_millis_ceil(), 0);
        assert_eq!(Ntime::from_millis(1500).as_millis_ceil(), 1500);
        assert_eq!(Ntime::new(-1, 0).as_millis_ceil(), 0);
    }

    #[test]
    fn ordering() {
        assert!(Ntime::new(0, 5) < Ntime::new(0, 6));
        assert!(Ntime::new(1, 0) > Ntime::new(0, 999_999_999));
        assert!(Ntime::from_millis(300).is_pos());
        assert!(!Ntime::ZERO.is_pos());
    }

    #[test]
    fn monotonic_advances() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
