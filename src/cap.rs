//! Device capability and state bits, and the readiness event set
//! delivered by the multiplexer.

use std::{fmt, ops};

/// Capability traits and transient state of a device, kept in one bit
/// set on the device header.
///
/// The low bits describe what the device can do and are settable by the
/// device constructor; everything above is runtime state owned by the
/// host.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct DevCap(u32);

impl DevCap {
    pub const EMPTY: DevCap = DevCap(0);

    // Traits.
    pub const VIRTUAL: DevCap = DevCap(1 << 0);
    pub const IN: DevCap = DevCap(1 << 1);
    pub const OUT: DevCap = DevCap(1 << 2);
    pub const PRI: DevCap = DevCap(1 << 3);
    pub const STREAM: DevCap = DevCap(1 << 4);
    pub const IN_DISABLED: DevCap = DevCap(1 << 5);
    pub const OUT_UNQUEUEABLE: DevCap = DevCap(1 << 6);

    // Transient state.
    pub const IN_CLOSED: DevCap = DevCap(1 << 8);
    pub const OUT_CLOSED: DevCap = DevCap(1 << 9);
    pub const IN_WATCHED: DevCap = DevCap(1 << 10);
    pub const OUT_WATCHED: DevCap = DevCap(1 << 11);
    pub const PRI_WATCHED: DevCap = DevCap(1 << 12);
    pub const ACTIVE: DevCap = DevCap(1 << 13);
    pub const HALTED: DevCap = DevCap(1 << 14);
    pub const ZOMBIE: DevCap = DevCap(1 << 15);
    pub const RENEW_REQUIRED: DevCap = DevCap(1 << 16);
    pub const WATCH_STARTED: DevCap = DevCap(1 << 17);
    pub const WATCH_SUSPENDED: DevCap = DevCap(1 << 18);
    pub const WATCH_REREG_REQUIRED: DevCap = DevCap(1 << 19);

    /// Bits a device constructor may legitimately leave set.
    pub const ALL_TRAITS: DevCap = DevCap(
        Self::VIRTUAL.0
            | Self::IN.0
            | Self::OUT.0
            | Self::PRI.0
            | Self::STREAM.0
            | Self::IN_DISABLED.0
            | Self::OUT_UNQUEUEABLE.0,
    );

    pub(crate) const ALL_WATCHED: DevCap =
        DevCap(Self::IN_WATCHED.0 | Self::OUT_WATCHED.0 | Self::PRI_WATCHED.0);

    pub const fn contains(self, other: DevCap) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(self, other: DevCap) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn insert(&mut self, other: DevCap) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: DevCap) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for DevCap {
    type Output = DevCap;

    fn bitor(self, rhs: DevCap) -> DevCap {
        DevCap(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for DevCap {
    fn bitor_assign(&mut self, rhs: DevCap) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for DevCap {
    type Output = DevCap;

    fn bitand(self, rhs: DevCap) -> DevCap {
        DevCap(self.0 & rhs.0)
    }
}

impl ops::Not for DevCap {
    type Output = DevCap;

    fn not(self) -> DevCap {
        DevCap(!self.0)
    }
}

impl fmt::Debug for DevCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(DevCap, &str)] = &[
            (DevCap::VIRTUAL, "virtual"),
            (DevCap::IN, "in"),
            (DevCap::OUT, "out"),
            (DevCap::PRI, "pri"),
            (DevCap::STREAM, "stream"),
            (DevCap::IN_DISABLED, "in_disabled"),
            (DevCap::OUT_UNQUEUEABLE, "out_unqueueable"),
            (DevCap::IN_CLOSED, "in_closed"),
            (DevCap::OUT_CLOSED, "out_closed"),
            (DevCap::IN_WATCHED, "in_watched"),
            (DevCap::OUT_WATCHED, "out_watched"),
            (DevCap::PRI_WATCHED, "pri_watched"),
            (DevCap::ACTIVE, "active"),
            (DevCap::HALTED, "halted"),
            (DevCap::ZOMBIE, "zombie"),
            (DevCap::RENEW_REQUIRED, "renew_required"),
            (DevCap::WATCH_STARTED, "watch_started"),
            (DevCap::WATCH_SUSPENDED, "watch_suspended"),
            (DevCap::WATCH_REREG_REQUIRED, "watch_rereg_required"),
        ];

        let mut one = false;
        for (bit, name) in NAMES {
            if self.contains(*bit) {
                if one {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// Readiness events reported by the multiplexer for one device.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct DevEvent(u8);

impl DevEvent {
    pub const EMPTY: DevEvent = DevEvent(0);
    pub const IN: DevEvent = DevEvent(1 << 0);
    pub const OUT: DevEvent = DevEvent(1 << 1);
    pub const PRI: DevEvent = DevEvent(1 << 2);
    pub const HUP: DevEvent = DevEvent(1 << 3);
    pub const ERR: DevEvent = DevEvent(1 << 4);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: DevEvent) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(self, other: DevEvent) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn insert(&mut self, other: DevEvent) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: DevEvent) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for DevEvent {
    type Output = DevEvent;

    fn bitor(self, rhs: DevEvent) -> DevEvent {
        DevEvent(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for DevEvent {
    fn bitor_assign(&mut self, rhs: DevEvent) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DevEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (bit, name) in [
            (DevEvent::IN, "IN"),
            (DevEvent::OUT, "OUT"),
            (DevEvent::PRI, "PRI"),
            (DevEvent::HUP, "HUP"),
            (DevEvent::ERR, "ERR"),
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
            write!(f, "-")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_bits() {
        let mut cap = DevCap::IN | DevCap::OUT | DevCap::STREAM;
        assert!(cap.contains(DevCap::IN));
        assert!(!cap.contains(DevCap::ACTIVE));
        cap.insert(DevCap::ACTIVE);
        cap.remove(DevCap::OUT);
        assert!(cap.contains(DevCap::ACTIVE));
        assert!(!cap.contains(DevCap::OUT));
        assert_eq!(format!("{:?}", DevCap::IN | DevCap::STREAM), "in|stream");
    }

    #[test]
    fn event_bits() {
        let ev = DevEvent::IN | DevEvent::HUP;
        assert!(ev.intersects(DevEvent::IN));
        assert!(!ev.contains(DevEvent::OUT));
        assert_eq!(format!("{:?}", ev), "IN|HUP");
    }
}
