//! The device abstraction: driver methods, event callbacks, and the
//! slab the host stores devices in.
//!
//! A device is split the same way the runtime splits responsibilities:
//! the [`Device`] driver owns the OS handle and performs raw I/O, while
//! the [`EvCb`] side receives readiness, read and write-completion
//! events and is where user logic lives. Both halves are looked up
//! through a [`DevId`], a generation-checked slab handle, so callbacks
//! can freely create, halt and kill devices while the host dispatches.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice};
use std::os::fd::RawFd;

use crate::cap::{DevCap, DevEvent};
use crate::err::{Errnum, Error, Result};
use crate::hio::Hio;
use crate::que::Wq;
use crate::skad::Skad;
use crate::time::Ntime;
use crate::tmr::Tmridx;

/// Handle to a device owned by a host context.
///
/// Stale handles (the device died, the slot was reused) are detected
/// and rejected by every host operation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DevId {
    idx: u32,
    gen: u32,
}

impl DevId {
    pub(crate) fn to_token(self) -> u64 {
        (u64::from(self.idx) << 32) | u64::from(self.gen)
    }

    pub(crate) fn from_token(tok: u64) -> DevId {
        DevId {
            idx: (tok >> 32) as u32,
            gen: tok as u32,
        }
    }
}

impl fmt::Debug for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}.{}", self.idx, self.gen)
    }
}

/// Watch commands accepted by [`Hio::dev_watch`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WatchCmd {
    /// Register with the multiplexer, watching input by default.
    Start,
    /// Honor the requested events exactly as given.
    Update,
    /// Recompute output interest from the write queue; input interest
    /// is taken from the requested events.
    Renew,
    /// Deregister.
    Stop,
}

/// What a read event delivered.
pub enum Rd<'a> {
    /// Payload bytes. For non-stream devices one datagram.
    Data(&'a [u8]),
    /// End of input on a stream, reported exactly once.
    Eof,
    /// Read-side failure reported through the callback: `Tmout` for a
    /// read timeout, `Devhup`/`Deverr` for hangups surfaced by the
    /// multiplexer.
    Err(Errnum),
}

/// Flow control returned by `on_read`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RdCtl {
    /// Keep reading greedily within this dispatch.
    Again,
    /// Stop after this delivery; wait for the next readiness event.
    Stop,
}

/// Gate value returned by `ready`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EvGate {
    /// Continue with read/write processing for this event.
    Proceed,
    /// The callback consumed the event; skip further processing.
    Skip,
}

/// Completion of a write request: bytes of the original request on
/// success, or the failure kind (`Tmout` for a write timeout).
pub type WrRes = std::result::Result<usize, Errnum>;

/// Driver half of a device: owns the system handle and performs the
/// raw operations the host schedules around.
pub trait Device: Any {
    /// Capability traits to start from. The host masks this to trait
    /// bits and derives the closed-state bits from what is missing.
    fn initial_cap(&self) -> DevCap {
        DevCap::IN | DevCap::OUT
    }

    fn syshnd(&self) -> RawFd;

    /// True when a library already closed the underlying handle behind
    /// the runtime's back; multiplexer control is skipped then.
    fn is_syshnd_broken(&self) -> bool {
        false
    }

    /// Releases the OS resources. `force` escalates on retries: 0 on
    /// the first attempt, 1 once the zombie retry gave up waiting, 2
    /// when the device is freed regardless of the outcome.
    fn kill(&mut self, force: u8) -> io::Result<()>;

    /// Reads once. `Ok(None)` means the operation would block.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Option<Skad>)>>;

    /// Writes once. `Ok(None)` means the operation would block. For a
    /// stream device an empty `data` closes the write half.
    fn write(&mut self, data: &[u8], dst: Option<&Skad>) -> io::Result<Option<usize>>;

    fn writev(&mut self, bufs: &[IoSlice<'_>], dst: Option<&Skad>) -> io::Result<Option<usize>> {
        match bufs.iter().find(|b| !b.is_empty()) {
            Some(b) => self.write(b, dst),
            None => self.write(&[], dst),
        }
    }

    fn sendfile(&mut self, fd: RawFd, foff: u64, len: usize) -> io::Result<Option<usize>> {
        let _ = (fd, foff, len);
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Type-erased control operation; concrete devices downcast `cmd`
    /// to the commands they understand.
    fn ioctl(&mut self, cmd: &mut dyn Any) -> Result<()> {
        let _ = cmd;
        Err(Error::new(Errnum::Noimpl))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Event-callback half of a device.
///
/// Callbacks run on the loop thread and must not block. They may issue
/// further device operations, including creating devices and halting
/// the device they were invoked for.
pub trait EvCb {
    /// First look at a readiness event. `Err` halts the device,
    /// `Skip` suppresses the read/write processing for this event.
    fn ready(&mut self, hio: &mut Hio, dev: DevId, events: DevEvent) -> Result<EvGate> {
        let _ = (hio, dev, events);
        Ok(EvGate::Proceed)
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

    /// Invoked once when the device is being killed, before the driver
    /// releases its resources.
    fn on_kill(&mut self, hio: &mut Hio, dev: DevId) {
        let _ = (hio, dev);
    }
}

/// Common per-device bookkeeping embedded next to the driver.
pub(crate) struct DevCore {
    pub cap: DevCap,
    /// Active read deadline, zero when none.
    pub rtmout: Ntime,
    /// Timer handle of the read deadline.
    pub rtmridx: Tmridx,
    pub wq: VecDeque<Wq>,
    pub wq_seq: u64,
    /// Completed-write entries owned by this device still waiting for
    /// their callback.
    pub cw_count: usize,
}

impl DevCore {
    fn new() -> DevCore {
        DevCore {
            cap: DevCap::EMPTY,
            rtmout: Ntime::ZERO,
            rtmridx: Tmridx::INVALID,
            wq: VecDeque::new(),
            wq_seq: 0,
            cw_count: 0,
        }
    }
}

pub(crate) struct DevSlot {
    pub core: DevCore,
    /// Taken out while a driver call could reenter the host.
    pub driver: Option<Box<dyn Device>>,
    /// Taken out while one of its callbacks runs.
    pub evcb: Option<Box<dyn EvCb>>,
}

struct Entry {
    gen: u32,
    slot: Option<DevSlot>,
}

/// Generation-checked storage for device slots.
pub(crate) struct DevSlab {
    entries: Vec<Entry>,
    free: Vec<u32>,
    len: usize,
}

impl DevSlab {
    pub fn new() -> DevSlab {
        DevSlab {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, driver: Box<dyn Device>, evcb: Box<dyn EvCb>) -> DevId {
        let slot = DevSlot {
            core: DevCore::new(),
            driver: Some(driver),
            evcb: Some(evcb),
        };
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                let entry = &mut self.entries[idx as usize];
                debug_assert!(entry.slot.is_none());
                entry.slot = Some(slot);
                DevId {
                    idx,
                    gen: entry.gen,
                }
            }
            None => {
                let idx = self.entries.len() as u32;
                self.entries.push(Entry {
                    gen: 0,
                    slot: Some(slot),
                });
                DevId { idx, gen: 0 }
            }
        }
    }

    pub fn get(&self, id: DevId) -> Option<&DevSlot> {
        let entry = self.entries.get(id.idx as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        entry.slot.as_ref()
    }

    pub fn get_mut(&mut self, id: DevId) -> Option<&mut DevSlot> {
        let entry = self.entries.get_mut(id.idx as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        entry.slot.as_mut()
    }

    pub fn remove(&mut self, id: DevId) -> Option<DevSlot> {
        let entry = self.entries.get_mut(id.idx as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        let slot = entry.slot.take()?;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.idx);
        self.len -= 1;
        Some(slot)
    }

    /// Ids of all live devices; used for teardown sweeps.
    pub fn ids(&self) -> Vec<DevId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.slot.is_some())
            .map(|(idx, e)| DevId {
                idx: idx as u32,
                gen: e.gen,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDev;

    impl Device for NullDev {
        fn syshnd(&self) -> RawFd {
            -1
        }
        fn kill(&mut self, _force: u8) -> io::Result<()> {
            Ok(())
        }
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<Option<(usize, Option<Skad>)>> {
            Ok(None)
        }
        fn write(&mut self, data: &[u8], _dst: Option<&Skad>) -> io::Result<Option<usize>> {
            Ok(Some(data.len()))
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct NullCb;

    impl EvCb for NullCb {
        fn on_read(
            &mut self,
            _hio: &mut Hio,
            _dev: DevId,
            _rd: Rd<'_>,
            _src: Option<&Skad>,
        ) -> Result<RdCtl> {
            Ok(RdCtl::Again)
        }
        fn on_write(
            &mut self,
            _hio: &mut Hio,
            _dev: DevId,
            _res: WrRes,
            _ctx: usize,
            _dst: Option<&Skad>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn slab_rejects_stale_ids() {
        let mut slab = DevSlab::new();
        let id = slab.insert(Box::new(NullDev), Box::new(NullCb));
        assert!(slab.get(id).is_some());
        assert!(slab.remove(id).is_some());
        assert!(slab.get(id).is_none());

        // slot reuse bumps the generation
        let id2 = slab.insert(Box::new(NullDev), Box::new(NullCb));
        assert!(slab.get(id).is_none());
        assert!(slab.get(id2).is_some());
        assert_ne!(id, id2);
    }

    #[test]
    fn token_round_trip() {
        let mut slab = DevSlab::new();
        let id = slab.insert(Box::new(NullDev), Box::new(NullCb));
        assert_eq!(DevId::from_token(id.to_token()), id);
    }
}
