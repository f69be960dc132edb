//! The host context: one instance owns one event loop.
//!
//! `Hio` holds the device slab, the timer wheel, the completed-write
//! queue and the multiplexer, and drives them in a fixed per-iteration
//! order: sweep the check-and-free blocks, drain completed writes, fire
//! due timers, drain completed writes again (timer handlers may have
//! completed more), reap halted devices, wait on the multiplexer,
//! dispatch readiness, and reap once more.
//!
//! Everything runs on the calling thread; callbacks may freely create
//! devices, submit writes and halt devices, including the one they were
//! invoked for. The one thing a callback must not do is kill its own
//! device; such a kill is degraded to a halt and the device dies at the
//! iteration boundary instead.

use std::any::Any;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{IoSlice, Write as _};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::cap::{DevCap, DevEvent};
use crate::dev::{DevId, DevSlab, Device, EvCb, EvGate, Rd, RdCtl, WatchCmd, WrRes};
use crate::err::{Errnum, Error, Result};
use crate::logwr::{LineWriter, LogMask};
use crate::que::{Cwq, Wq, WqPayload};
use crate::skad::Skad;
use crate::svc::{Service, SvcId};
use crate::sys::{Mux, MuxCmd, MuxEvent};
use crate::time::{self, Ntime};
use crate::tmr::{TmrPayload, TmrWheel, Tmridx};

const BIGBUF_LEN: usize = 65536;
const ZOMBIE_RETRY: Ntime = Ntime::from_secs(3);

/// Subsystem selection at `Hio::open` time.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Feature(u32);

impl Feature {
    pub const MUX: Feature = Feature(1 << 0);
    pub const LOG: Feature = Feature(1 << 1);
    pub const ALL: Feature = Feature(Self::MUX.0 | Self::LOG.0);

    pub const fn contains(self, other: Feature) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for Feature {
    type Output = Feature;
    fn bitor(self, rhs: Feature) -> Feature {
        Feature(self.0 | rhs.0)
    }
}

/// Why the loop was asked to stop.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum StopReq {
    None = 0,
    Termination = 1,
    /// The multiplexer itself failed; `loop_` reports this as a fatal
    /// error carrying the preserved failure message.
    WatcherError = 2,
}

impl StopReq {
    fn from_u8(v: u8) -> StopReq {
        match v {
            1 => StopReq::Termination,
            2 => StopReq::WatcherError,
            _ => StopReq::None,
        }
    }
}

/// Runtime-tunable options.
#[derive(Debug)]
pub enum Opt {
    Trait(u32),
    LogMask(LogMask),
    LogMaxCapa(usize),
    LogTarget(PathBuf),
}

/// A handle that can stop the loop from another thread or a signal
/// handler: it flips the stop reason and pokes the wake-up pipe.
#[derive(Clone)]
pub struct Stopper {
    flag: Arc<AtomicU8>,
    sender: Option<Arc<File>>,
}

impl Stopper {
    pub fn stop(&self, req: StopReq) {
        self.flag.store(req as u8, Ordering::Release);
        if let Some(sender) = &self.sender {
            let _ = (&**sender).write(&[1]);
        }
    }
}

struct Cfmb {
    payload: Box<dyn Any>,
    checker: Box<dyn FnMut(&mut dyn Any) -> bool>,
}

/// The host context.
pub struct Hio {
    features: Feature,
    init_time: Ntime,
    stopreq: Arc<AtomicU8>,

    pub(crate) last_err: Error,

    pub(crate) devices: DevSlab,
    /// Reap queue; entries are revalidated against the HALTED bit.
    hltq: VecDeque<DevId>,
    act_count: usize,
    zmb_count: usize,

    cwq: VecDeque<Cwq>,
    pub(crate) tmr: TmrWheel,
    cfmb: Vec<Cfmb>,
    svcs: Vec<(SvcId, Box<dyn Service>)>,
    svc_seq: u64,

    /// Per-iteration read landing area, taken out while a read callback
    /// borrows it.
    bigbuf: Option<Box<[u8]>>,
    evbuf: Vec<MuxEvent>,

    mux: Option<Mux>,
    log: Option<LineWriter>,
    opt_trait: u32,
}

impl Hio {
    /// Creates a host context. `tmrcapa` sizes the timer wheel ahead of
    /// time.
    pub fn open(features: Feature, tmrcapa: usize) -> Result<Hio> {
        let mux = if features.contains(Feature::MUX) {
            Some(Mux::new().map_err(Error::from_io)?)
        } else {
            None
        };
        let log = if features.contains(Feature::LOG) {
            Some(LineWriter::new())
        } else {
            None
        };

        Ok(Hio {
            features,
            init_time: time::monotonic_now(),
            stopreq: Arc::new(AtomicU8::new(StopReq::None as u8)),
            last_err: Error::new(Errnum::Noerr),
            devices: DevSlab::new(),
            hltq: VecDeque::new(),
            act_count: 0,
            zmb_count: 0,
            cwq: VecDeque::new(),
            tmr: TmrWheel::with_capacity(tmrcapa),
            cfmb: Vec::new(),
            svcs: Vec::new(),
            svc_seq: 0,
            bigbuf: Some(vec![0u8; BIGBUF_LEN].into_boxed_slice()),
            evbuf: Vec::new(),
            mux,
            log,
            opt_trait: 0,
        })
    }

    pub fn features(&self) -> Feature {
        self.features
    }

    /// Monotonic time since this context was opened.
    pub fn gettime(&self) -> Ntime {
        time::monotonic_now() - self.init_time
    }

    /// Wall-clock time; only meant for log timestamps.
    pub fn getrealtime(&self) -> Ntime {
        time::realtime_now()
    }

    /// The last error recorded by any operation on this context.
    pub fn errinf(&self) -> &Error {
        &self.last_err
    }

    pub(crate) fn seterr(&mut self, err: Error) -> Error {
        self.last_err = err.clone();
        err
    }

    pub fn set_option(&mut self, opt: Opt) -> Result<()> {
        match opt {
            Opt::Trait(v) => self.opt_trait = v,
            Opt::LogMask(mask) => {
                if let Some(log) = &mut self.log {
                    log.set_mask(mask);
                }
            }
            Opt::LogMaxCapa(capa) => {
                if let Some(log) = &mut self.log {
                    log.set_max_capa(capa);
                }
            }
            Opt::LogTarget(path) => {
                if self.log.is_none() {
                    return Err(self.seterr(Error::new(Errnum::Nocapa)));
                }
                let res = self
                    .log
                    .as_mut()
                    .expect("checked above")
                    .set_target(&path);
                if let Err(err) = res {
                    return Err(self.seterr(Error::from_io(err)));
                }
            }
        }
        Ok(())
    }

    pub fn option_trait(&self) -> u32 {
        self.opt_trait
    }

    pub fn log_writer(&self) -> Option<&LineWriter> {
        self.log.as_ref()
    }

    /*
     * ===== check-and-free memory blocks =====
     */

    /// Parks a value to be dropped once `checker` reports it is no
    /// longer needed. The loop polls the checker opportunistically at
    /// the top of every iteration.
    pub fn add_cfmb(
        &mut self,
        payload: Box<dyn Any>,
        checker: impl FnMut(&mut dyn Any) -> bool + 'static,
    ) {
        self.cfmb.push(Cfmb {
            payload,
            checker: Box::new(checker),
        });
    }

    fn clear_unneeded_cfmbs(&mut self) {
        self.cfmb
            .retain_mut(|c| !(c.checker)(c.payload.as_mut()));
    }

    #[doc(hidden)]
    pub fn cfmb_count(&self) -> usize {
        self.cfmb.len()
    }

    /*
     * ===== services =====
     */

    pub fn reg_svc(&mut self, svc: Box<dyn Service>) -> SvcId {
        let id = SvcId::new(self.svc_seq);
        self.svc_seq += 1;
        self.svcs.push((id, svc));
        id
    }

    pub fn dereg_svc(&mut self, id: SvcId) -> Option<Box<dyn Service>> {
        let pos = self.svcs.iter().position(|(sid, _)| *sid == id)?;
        Some(self.svcs.remove(pos).1)
    }

    /*
     * ===== timer jobs =====
     */

    /// Schedules `handler` to fire at the absolute (since-init) time
    /// `when`.
    pub fn instmrjob(
        &mut self,
        when: Ntime,
        handler: impl FnMut(&mut Hio, Ntime) + 'static,
    ) -> Tmridx {
        self.tmr.ins(when, TmrPayload::Func(Box::new(handler)))
    }

    /// Repositions a job to a new deadline, keeping its handle valid.
    pub fn updtmrjob(&mut self, idx: Tmridx, when: Ntime) -> bool {
        self.tmr.upd(idx, when)
    }

    pub fn deltmrjob(&mut self, idx: Tmridx) -> bool {
        self.tmr.del(idx).is_some()
    }

    pub fn gettmrjobdeadline(&self, idx: Tmridx) -> Option<Ntime> {
        self.tmr.deadline_of(idx)
    }

    pub fn schedtmrjob_at(
        &mut self,
        when: Ntime,
        handler: impl FnMut(&mut Hio, Ntime) + 'static,
    ) -> Result<Tmridx> {
        Ok(self.instmrjob(when, handler))
    }

    pub fn schedtmrjob_after(
        &mut self,
        delta: Ntime,
        handler: impl FnMut(&mut Hio, Ntime) + 'static,
    ) -> Result<Tmridx> {
        let when = self.gettime() + delta;
        self.schedtmrjob_at(when, handler)
    }

    pub fn tmrjob_count(&self) -> usize {
        self.tmr.len()
    }

    fn fire_due_tmrjobs(&mut self) {
        let now = self.gettime();
        while let Some((_idx, _when, payload)) = self.tmr.pop_due(now) {
            match payload {
                TmrPayload::ReadTmout(dev) => {
                    if let Some(slot) = self.devices.get_mut(dev) {
                        slot.core.rtmridx = Tmridx::INVALID;
                    }
                    self.on_read_timeout(dev);
                }
                TmrPayload::WriteTmout(dev, seq) => self.on_write_timeout(dev, seq),
                TmrPayload::KillZombie(dev) => self.kill_zombie_job(dev),
                TmrPayload::Func(mut f) => f(self, now),
            }
        }
    }

    fn on_read_timeout(&mut self, dev: DevId) {
        self.last_err = Error::new(Errnum::Tmout);
        match self.evcb_on_read(dev, Rd::Err(Errnum::Tmout), None) {
            Some(Err(err)) => {
                debug!("{:?} - halting device for on_read error upon timeout - {}", dev, err);
                self.last_err = err;
                self.dev_halt(dev);
            }
            _ => {}
        }
    }

    fn on_write_timeout(&mut self, dev: DevId, seq: u64) {
        let Some(slot) = self.devices.get_mut(dev) else {
            return;
        };
        let Some(pos) = slot.core.wq.iter().position(|q| q.seq == seq) else {
            return;
        };
        let q = slot.core.wq.remove(pos).expect("position was just found");

        self.last_err = Error::new(Errnum::Tmout);
        match self.evcb_on_write(dev, Err(Errnum::Tmout), q.ctx, q.dst.as_ref()) {
            Some(Err(err)) => {
                debug!("{:?} - halting device for on_write error upon timeout - {}", dev, err);
                self.last_err = err;
                self.dev_halt(dev);
            }
            _ => {}
        }
    }

    fn kill_zombie_job(&mut self, dev: DevId) {
        if self.devices.get(dev).is_none() {
            return;
        }
        if self.kill_and_free(dev, 0).is_err() {
            self.retry_or_force_kill(dev);
        }
    }

    /*
     * ===== event callback plumbing =====
     *
     * The callback object is taken out of the slot for the duration of
     * the call so the callback can reach back into the host, then put
     * back if the slot is still alive and was not re-armed meanwhile.
     */

    pub(crate) fn evcb_ready(&mut self, id: DevId, events: DevEvent) -> Option<Result<EvGate>> {
        let mut cb = self.devices.get_mut(id)?.evcb.take()?;
        let r = cb.ready(self, id, events);
        self.put_evcb(id, cb);
        Some(r)
    }

    pub(crate) fn evcb_on_read(
        &mut self,
        id: DevId,
        rd: Rd<'_>,
        src: Option<&Skad>,
    ) -> Option<Result<RdCtl>> {
        let mut cb = self.devices.get_mut(id)?.evcb.take()?;
        let r = cb.on_read(self, id, rd, src);
        self.put_evcb(id, cb);
        Some(r)
    }

    pub(crate) fn evcb_on_write(
        &mut self,
        id: DevId,
        res: WrRes,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Option<Result<()>> {
        let mut cb = self.devices.get_mut(id)?.evcb.take()?;
        let r = cb.on_write(self, id, res, ctx, dst);
        self.put_evcb(id, cb);
        Some(r)
    }

    fn evcb_on_kill(&mut self, id: DevId) {
        let Some(mut cb) = self.devices.get_mut(id).and_then(|s| s.evcb.take()) else {
            return;
        };
        cb.on_kill(self, id);
        self.put_evcb(id, cb);
    }

    fn put_evcb(&mut self, id: DevId, cb: Box<dyn EvCb>) {
        if let Some(slot) = self.devices.get_mut(id) {
            if slot.evcb.is_none() {
                slot.evcb = Some(cb);
            }
        }
    }

    /// Replaces the event-callback object of a live device.
    pub fn dev_set_evcb(&mut self, id: DevId, cb: Box<dyn EvCb>) -> Result<()> {
        match self.devices.get_mut(id) {
            Some(slot) => {
                slot.evcb = Some(cb);
                Ok(())
            }
            None => Err(self.seterr(Error::new(Errnum::Noent))),
        }
    }

    /// Runs `f` against the concrete driver type of a device.
    pub fn dev_with<D: Device, R>(
        &mut self,
        id: DevId,
        f: impl FnOnce(&mut D) -> R,
    ) -> Option<R> {
        let slot = self.devices.get_mut(id)?;
        let drv = slot.driver.as_mut()?;
        let d = drv.as_any_mut().downcast_mut::<D>()?;
        Some(f(d))
    }

    /// Current capability/state bits of a device, if it is still alive.
    pub fn dev_cap(&self, id: DevId) -> Option<DevCap> {
        self.devices.get(id).map(|s| s.core.cap)
    }

    pub fn active_count(&self) -> usize {
        self.act_count
    }

    pub fn zombie_count(&self) -> usize {
        self.zmb_count
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /*
     * ===== device lifecycle =====
     */

    /// Registers a new device: the driver joins the slab, input
    /// watching starts (unless the device is virtual) and the device
    /// becomes active. On failure the driver is destroyed through the
    /// kill path, falling back to the zombie retry if the kill itself
    /// fails.
    pub fn dev_make(&mut self, driver: Box<dyn Device>, evcb: Box<dyn EvCb>) -> Result<DevId> {
        let id = self.devices.insert(driver, evcb);

        let slot = self.devices.get_mut(id).expect("slot was just inserted");
        let mut cap = slot
            .driver
            .as_ref()
            .expect("driver was just inserted")
            .initial_cap()
            & DevCap::ALL_TRAITS;
        if !cap.contains(DevCap::IN) {
            cap.insert(DevCap::IN_CLOSED);
        }
        if !cap.contains(DevCap::OUT) {
            cap.insert(DevCap::OUT_CLOSED);
        }
        slot.core.cap = cap;

        if let Err(err) = self.dev_watch(id, WatchCmd::Start, DevEvent::EMPTY) {
            debug!("{:?} - watch start failed in dev_make - {}", id, err);
            if self.kill_and_free(id, 0).is_err() {
                self.retry_or_force_kill(id);
            }
            return Err(err);
        }

        let slot = self.devices.get_mut(id).expect("watch start keeps the slot");
        slot.core.cap.insert(DevCap::ACTIVE);
        self.act_count += 1;
        trace!("{:?} - device made active", id);
        Ok(id)
    }

    /// Requests an asynchronous stop: the device moves to the halted
    /// set and is killed at the next iteration boundary. Safe to call
    /// from any callback, idempotent.
    pub fn dev_halt(&mut self, id: DevId) {
        let Some(slot) = self.devices.get_mut(id) else {
            return;
        };
        if slot.core.cap.contains(DevCap::ACTIVE) {
            debug!("{:?} - halting device", id);
            slot.core.cap.remove(DevCap::ACTIVE);
            slot.core.cap.insert(DevCap::HALTED);
            self.act_count -= 1;
            self.hltq.push_back(id);
        }
    }

    /// Destroys a device now: fires its pending write completions,
    /// drops its queued writes without callbacks, stops the watch and
    /// releases the driver. A kill issued from inside the device's own
    /// callback degrades to `dev_halt`.
    pub fn dev_kill(&mut self, id: DevId) {
        let Some(slot) = self.devices.get_mut(id) else {
            return;
        };
        let cap = slot.core.cap;

        if cap.contains(DevCap::ZOMBIE) {
            debug_assert!(slot.core.wq.is_empty());
            debug_assert_eq!(slot.core.cw_count, 0);
            if self.kill_and_free(id, 0).is_err() {
                self.retry_or_force_kill(id);
            }
            return;
        }

        if !cap.intersects(DevCap::HALTED | DevCap::ACTIVE) {
            // probably a reentrant kill from a disconnect callback
            debug!("{:?} - duplicate kill", id);
            return;
        }

        if slot.evcb.is_none() || slot.driver.is_none() {
            // one of the device's own callbacks is running right now
            self.dev_halt(id);
            return;
        }

        // cancel the read deadline
        let rtmridx = std::mem::replace(&mut slot.core.rtmridx, Tmridx::INVALID);
        if rtmridx.is_valid() {
            self.tmr.del(rtmridx);
        }

        // flush completed writes owned by this device; their callbacks
        // still run so the writes are seen as completed even on
        // shutdown, but errors no longer matter
        if self.devices.get(id).map_or(0, |s| s.core.cw_count) > 0 {
            self.fire_cwq_handlers_for_dev(id, true);
        }

        // pending writes are dropped without callbacks
        if let Some(slot) = self.devices.get_mut(id) {
            while let Some(q) = slot.core.wq.pop_front() {
                if q.tmridx.is_valid() {
                    self.tmr.del(q.tmridx);
                }
            }
        }

        let Some(slot) = self.devices.get_mut(id) else {
            return;
        };
        if slot.core.cap.contains(DevCap::HALTED) {
            slot.core.cap.remove(DevCap::HALTED);
        } else {
            slot.core.cap.remove(DevCap::ACTIVE);
            self.act_count -= 1;
        }

        let _ = self.dev_watch(id, WatchCmd::Stop, DevEvent::EMPTY);

        if self.kill_and_free(id, 0).is_err() {
            self.retry_or_force_kill(id);
        }
    }

    fn kill_and_free(&mut self, id: DevId, force: u8) -> std::result::Result<(), ()> {
        let Some(slot) = self.devices.get(id) else {
            return Ok(());
        };
        debug_assert!(!slot.core.cap.intersects(DevCap::ACTIVE | DevCap::HALTED));

        if !slot.core.cap.contains(DevCap::ZOMBIE) {
            self.evcb_on_kill(id);
        }

        let Some(slot) = self.devices.get_mut(id) else {
            return Ok(());
        };
        let was_zombie = slot.core.cap.contains(DevCap::ZOMBIE);
        let kill_res = match slot.driver.as_mut() {
            Some(drv) => drv.kill(force),
            None => Ok(()),
        };

        if let Err(err) = kill_res {
            debug!("{:?} - kill method failure - {}", id, err);
            self.last_err = Error::from_io(err);
            if force >= 2 {
                // free regardless, possibly leaking device resources
                if was_zombie {
                    self.zmb_count -= 1;
                }
                self.devices.remove(id);
                return Ok(());
            }
            if !was_zombie {
                let slot = self.devices.get_mut(id).expect("slot is still present");
                slot.core.cap.insert(DevCap::ZOMBIE);
                self.zmb_count += 1;
                debug!("{:?} - moved to zombie list", id);
            }
            return Err(());
        }

        if was_zombie {
            self.zmb_count -= 1;
        }
        self.devices.remove(id);
        trace!("{:?} - device freed", id);
        Ok(())
    }

    fn retry_or_force_kill(&mut self, id: DevId) {
        if self.schedule_kill_zombie_job(id).is_ok() {
            return;
        }
        // retry scheduling failed; destroy now, escalating force
        while self.kill_and_free(id, 1).is_err() {
            if self.stopreq() != StopReq::None {
                let _ = self.kill_and_free(id, 2);
                break;
            }
        }
    }

    fn schedule_kill_zombie_job(&mut self, id: DevId) -> std::result::Result<(), ()> {
        let when = self.gettime() + ZOMBIE_RETRY;
        let idx = self.tmr.ins(when, TmrPayload::KillZombie(id));
        if idx.is_valid() {
            Ok(())
        } else {
            Err(())
        }
    }

    fn kill_all_halted_devices(&mut self) {
        while let Some(id) = self.hltq.pop_front() {
            let halted = self
                .devices
                .get(id)
                .map_or(false, |s| s.core.cap.contains(DevCap::HALTED));
            if halted {
                debug!("{:?} - killing halted device", id);
                self.dev_kill(id);
            }
        }
    }

    /*
     * ===== watch registration =====
     */

    pub fn dev_watch(&mut self, id: DevId, cmd: WatchCmd, events: DevEvent) -> Result<()> {
        let Some(slot) = self.devices.get_mut(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };
        let cur = slot.core.cap;

        // a virtual device performs no actual I/O; pretend the watch
        // succeeded but remember it is effectively suspended
        if cur.contains(DevCap::VIRTUAL) {
            if cmd == WatchCmd::Start {
                slot.core.cap.insert(DevCap::WATCH_SUSPENDED);
            }
            return Ok(());
        }

        let mut dev_cap = cur
            & !(DevCap::ALL_WATCHED | DevCap::WATCH_SUSPENDED | DevCap::WATCH_REREG_REQUIRED);
        let mut events = events;

        let mux_cmd = match cmd {
            WatchCmd::Start => {
                events = DevEvent::IN;
                dev_cap.insert(DevCap::WATCH_STARTED);
                MuxCmd::Insert
            }
            WatchCmd::Renew => {
                if slot.core.wq.is_empty() {
                    events.remove(DevEvent::OUT);
                } else {
                    events.insert(DevEvent::OUT);
                }
                MuxCmd::Update
            }
            WatchCmd::Update => MuxCmd::Update,
            WatchCmd::Stop => {
                if !dev_cap.contains(DevCap::WATCH_STARTED) {
                    return Ok(()); // not being watched
                }
                dev_cap.remove(DevCap::WATCH_STARTED);
                slot.core.cap = dev_cap | (cur & (DevCap::WATCH_SUSPENDED | DevCap::WATCH_REREG_REQUIRED));
                return self.ctrl_mux(id, MuxCmd::Delete, dev_cap);
            }
        };

        if events.contains(DevEvent::IN)
            && !cur.intersects(DevCap::IN_CLOSED | DevCap::IN_DISABLED)
            && cur.contains(DevCap::IN)
        {
            dev_cap.insert(DevCap::IN_WATCHED);
            if cur.contains(DevCap::PRI) {
                dev_cap.insert(DevCap::PRI_WATCHED);
            }
        }

        if events.contains(DevEvent::OUT)
            && !cur.contains(DevCap::OUT_CLOSED)
            && cur.contains(DevCap::OUT)
        {
            dev_cap.insert(DevCap::OUT_WATCHED);
        }

        if mux_cmd == MuxCmd::Update
            && (dev_cap & DevCap::ALL_WATCHED) == (cur & DevCap::ALL_WATCHED)
            && !cur.contains(DevCap::WATCH_SUSPENDED)
        {
            // no change in watched events; skip the system call
            let slot = self.devices.get_mut(id).expect("slot is still present");
            slot.core.cap =
                dev_cap | (cur & (DevCap::WATCH_SUSPENDED | DevCap::WATCH_REREG_REQUIRED));
            return Ok(());
        }

        self.ctrl_mux(id, mux_cmd, dev_cap)
    }

    /// Applies the watch state to the OS multiplexer, preserving the
    /// suspension bookkeeping the backend maintains.
    fn ctrl_mux(&mut self, id: DevId, cmd: MuxCmd, dev_cap: DevCap) -> Result<()> {
        let Some(slot) = self.devices.get_mut(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };
        let cur = slot.core.cap;
        let Some(drv) = slot.driver.as_ref() else {
            return Err(self.seterr(Error::new(Errnum::Intern)));
        };

        // a library may have closed the handle behind our back; feeding
        // it to the multiplexer would only fail with EBADF
        if drv.is_syshnd_broken() {
            slot.core.cap =
                dev_cap | (cur & (DevCap::WATCH_SUSPENDED | DevCap::WATCH_REREG_REQUIRED));
            return Ok(());
        }

        let hnd = drv.syshnd();
        let mut ctrl_cap =
            dev_cap | (cur & (DevCap::WATCH_SUSPENDED | DevCap::WATCH_REREG_REQUIRED));

        let Some(mux) = self.mux.as_mut() else {
            return Err(self.seterr(Error::new(Errnum::Nocapa)));
        };
        if let Err(err) = mux.ctrl(cmd, hnd, id.to_token(), &mut ctrl_cap) {
            return Err(self.seterr(Error::from_io(err)));
        }

        let slot = self.devices.get_mut(id).expect("slot is still present");
        slot.core.cap = dev_cap
            | (ctrl_cap & (DevCap::WATCH_SUSPENDED | DevCap::WATCH_REREG_REQUIRED));
        Ok(())
    }

    /*
     * ===== read enabling and read deadlines =====
     */

    pub fn dev_read(&mut self, id: DevId, enabled: bool) -> Result<()> {
        self.dev_read_inner(id, enabled, None)
    }

    /// Enables or disables input watching and arms (or re-arms) the
    /// read deadline. A deadline of `None` or a non-positive time
    /// leaves the device without a read timer.
    pub fn dev_timedread(&mut self, id: DevId, enabled: bool, tmout: Option<Ntime>) -> Result<()> {
        self.dev_read_inner(id, enabled, tmout)
    }

    fn dev_read_inner(&mut self, id: DevId, enabled: bool, tmout: Option<Ntime>) -> Result<()> {
        let Some(slot) = self.devices.get_mut(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };

        let renew_now = if enabled {
            slot.core.cap.remove(DevCap::IN_DISABLED);
            !slot.core.cap.contains(DevCap::IN_WATCHED)
        } else {
            slot.core.cap.insert(DevCap::IN_DISABLED);
            slot.core.cap.contains(DevCap::IN_WATCHED)
        };

        if renew_now {
            self.dev_watch(id, WatchCmd::Renew, DevEvent::IN)?;
        } else if let Some(slot) = self.devices.get_mut(id) {
            slot.core.cap.insert(DevCap::RENEW_REQUIRED);
        }

        // replace any existing read deadline
        let Some(slot) = self.devices.get_mut(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };
        let old = std::mem::replace(&mut slot.core.rtmridx, Tmridx::INVALID);
        if old.is_valid() {
            self.tmr.del(old);
        }

        if let Some(tmout) = tmout {
            if tmout.is_pos() {
                let when = self.gettime() + tmout;
                let idx = self.tmr.ins(when, TmrPayload::ReadTmout(id));
                let slot = self.devices.get_mut(id).expect("slot is still present");
                slot.core.rtmridx = idx;
                slot.core.rtmout = tmout;
            }
        }
        Ok(())
    }

    /*
     * ===== write submission =====
     */

    pub fn dev_write(
        &mut self,
        id: DevId,
        data: &[u8],
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        self.dev_write_inner(id, data, None, ctx, dst)
    }

    pub fn dev_timedwrite(
        &mut self,
        id: DevId,
        data: &[u8],
        tmout: Ntime,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        self.dev_write_inner(id, data, Some(tmout), ctx, dst)
    }

    pub fn dev_writev(
        &mut self,
        id: DevId,
        bufs: &[IoSlice<'_>],
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        self.dev_writev_inner(id, bufs, None, ctx, dst)
    }

    pub fn dev_timedwritev(
        &mut self,
        id: DevId,
        bufs: &[IoSlice<'_>],
        tmout: Ntime,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        self.dev_writev_inner(id, bufs, Some(tmout), ctx, dst)
    }

    pub fn dev_sendfile(
        &mut self,
        id: DevId,
        in_fd: RawFd,
        foff: u64,
        len: usize,
        ctx: usize,
    ) -> Result<()> {
        self.dev_sendfile_inner(id, in_fd, foff, len, None, ctx)
    }

    pub fn dev_timedsendfile(
        &mut self,
        id: DevId,
        in_fd: RawFd,
        foff: u64,
        len: usize,
        tmout: Ntime,
        ctx: usize,
    ) -> Result<()> {
        self.dev_sendfile_inner(id, in_fd, foff, len, Some(tmout), ctx)
    }

    fn check_writable(&mut self, id: DevId) -> Result<(DevCap, bool)> {
        let Some(slot) = self.devices.get(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };
        let cap = slot.core.cap;
        if cap.contains(DevCap::OUT_CLOSED) {
            return Err(self.seterr(Error::with_msg(
                Errnum::Nocapa,
                "unable to write to closed device",
            )));
        }
        Ok((cap, slot.core.wq.is_empty()))
    }

    fn dev_write_inner(
        &mut self,
        id: DevId,
        data: &[u8],
        tmout: Option<Ntime>,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        let (cap, wq_empty) = self.check_writable(id)?;

        if !wq_empty {
            // keep submission order; enqueue behind the pending writes
            return self.enqueue_pending(id, data, data.len(), tmout, ctx, dst);
        }

        if cap.contains(DevCap::STREAM) {
            let mut rem = data;
            loop {
                let Some(drv) = self
                    .devices
                    .get_mut(id)
                    .and_then(|s| s.driver.as_mut())
                else {
                    return Err(self.seterr(Error::new(Errnum::Intern)));
                };
                match drv.write(rem, dst) {
                    Err(err) => return Err(self.seterr(Error::from_io(err))),
                    Ok(None) => return self.enqueue_pending(id, rem, data.len(), tmout, ctx, dst),
                    Ok(Some(n)) => {
                        rem = &rem[n.min(rem.len())..];
                        if rem.is_empty() {
                            break;
                        }
                    }
                }
            }

            if data.is_empty() {
                // zero-length request closes the write half
                if let Some(slot) = self.devices.get_mut(id) {
                    slot.core.cap.insert(DevCap::OUT_CLOSED);
                }
            }

            // the completion callback is deferred to the next callback
            // point; running it inline would allow unbounded recursion
            // when the callback writes again
            self.enqueue_completed(id, data.len(), ctx, dst);
            Ok(())
        } else {
            let Some(drv) = self
                .devices
                .get_mut(id)
                .and_then(|s| s.driver.as_mut())
            else {
                return Err(self.seterr(Error::new(Errnum::Intern)));
            };
            match drv.write(data, dst) {
                Err(err) => Err(self.seterr(Error::from_io(err))),
                Ok(None) => self.enqueue_pending(id, data, data.len(), tmout, ctx, dst),
                Ok(Some(n)) => {
                    // a partial write is complete for a non-stream
                    // device; the callback reports the actual count
                    self.enqueue_completed(id, n, ctx, dst);
                    Ok(())
                }
            }
        }
    }

    fn dev_writev_inner(
        &mut self,
        id: DevId,
        bufs: &[IoSlice<'_>],
        tmout: Option<Ntime>,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        let (cap, wq_empty) = self.check_writable(id)?;
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        if !wq_empty {
            let flat = flatten(bufs, 0, 0);
            return self.enqueue_pending(id, &flat, total, tmout, ctx, dst);
        }

        if cap.contains(DevCap::STREAM) {
            let mut idx = 0; // first vector not fully written
            let mut off = 0; // bytes consumed within bufs[idx]
            loop {
                let written = {
                    let Some(drv) = self
                        .devices
                        .get_mut(id)
                        .and_then(|s| s.driver.as_mut())
                    else {
                        return Err(self.seterr(Error::new(Errnum::Intern)));
                    };
                    let mut views: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len() - idx);
                    if idx < bufs.len() {
                        views.push(IoSlice::new(&bufs[idx][off..]));
                        views.extend(bufs[idx + 1..].iter().map(|b| IoSlice::new(b)));
                    }
                    match drv.writev(&views, dst) {
                        Err(err) => return Err(self.seterr(Error::from_io(err))),
                        Ok(None) => {
                            let flat = flatten(bufs, idx, off);
                            return self.enqueue_pending(id, &flat, total, tmout, ctx, dst);
                        }
                        Ok(Some(n)) => n,
                    }
                };

                let mut n = written;
                while idx < bufs.len() && n >= bufs[idx].len() - off {
                    n -= bufs[idx].len() - off;
                    idx += 1;
                    off = 0;
                }
                off += n;
                if idx >= bufs.len() {
                    break;
                }
            }

            if bufs.is_empty() {
                if let Some(slot) = self.devices.get_mut(id) {
                    slot.core.cap.insert(DevCap::OUT_CLOSED);
                }
            }
            self.enqueue_completed(id, total, ctx, dst);
            Ok(())
        } else {
            let Some(drv) = self
                .devices
                .get_mut(id)
                .and_then(|s| s.driver.as_mut())
            else {
                return Err(self.seterr(Error::new(Errnum::Intern)));
            };
            match drv.writev(bufs, dst) {
                Err(err) => Err(self.seterr(Error::from_io(err))),
                Ok(None) => {
                    let flat = flatten(bufs, 0, 0);
                    self.enqueue_pending(id, &flat, total, tmout, ctx, dst)
                }
                Ok(Some(n)) => {
                    self.enqueue_completed(id, n, ctx, dst);
                    Ok(())
                }
            }
        }
    }

    fn dev_sendfile_inner(
        &mut self,
        id: DevId,
        in_fd: RawFd,
        foff: u64,
        len: usize,
        tmout: Option<Ntime>,
        ctx: usize,
    ) -> Result<()> {
        let (cap, wq_empty) = self.check_writable(id)?;
        if !cap.contains(DevCap::STREAM) {
            return Err(self.seterr(Error::with_msg(
                Errnum::Nocapa,
                "unable to sendfile over a non-stream device",
            )));
        }

        if !wq_empty {
            return self.enqueue_pending_sendfile(id, in_fd, foff, len, len, tmout, ctx);
        }

        let mut uoff = foff;
        let mut urem = len;
        loop {
            let Some(drv) = self
                .devices
                .get_mut(id)
                .and_then(|s| s.driver.as_mut())
            else {
                return Err(self.seterr(Error::new(Errnum::Intern)));
            };
            match drv.sendfile(in_fd, uoff, urem) {
                Err(err) => return Err(self.seterr(Error::from_io(err))),
                Ok(None) => {
                    return self.enqueue_pending_sendfile(id, in_fd, uoff, urem, len, tmout, ctx)
                }
                Ok(Some(n)) => {
                    let n = n.min(urem);
                    uoff += n as u64;
                    urem -= n;
                    if urem == 0 {
                        break;
                    }
                    if n == 0 {
                        // a zero-byte transfer with bytes remaining is
                        // effectively a block
                        return self
                            .enqueue_pending_sendfile(id, in_fd, uoff, urem, len, tmout, ctx);
                    }
                }
            }
        }

        self.enqueue_completed(id, len, ctx, None);
        Ok(())
    }

    fn enqueue_pending(
        &mut self,
        id: DevId,
        rem: &[u8],
        olen: usize,
        tmout: Option<Ntime>,
        ctx: usize,
        dst: Option<&Skad>,
    ) -> Result<()> {
        let payload = WqPayload::Bytes {
            buf: rem.to_vec().into_boxed_slice(),
            pos: 0,
        };
        self.enqueue_wq(id, payload, olen, tmout, ctx, dst.copied())
    }

    fn enqueue_pending_sendfile(
        &mut self,
        id: DevId,
        in_fd: RawFd,
        foff: u64,
        rem: usize,
        olen: usize,
        tmout: Option<Ntime>,
        ctx: usize,
    ) -> Result<()> {
        let payload = WqPayload::Sendfile {
            fd: in_fd,
            foff,
            rem,
        };
        self.enqueue_wq(id, payload, olen, tmout, ctx, None)
    }

    fn enqueue_wq(
        &mut self,
        id: DevId,
        payload: WqPayload,
        olen: usize,
        tmout: Option<Ntime>,
        ctx: usize,
        dst: Option<Skad>,
    ) -> Result<()> {
        let Some(slot) = self.devices.get_mut(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };
        if slot.core.cap.contains(DevCap::OUT_UNQUEUEABLE) {
            return Err(self.seterr(Error::with_msg(
                Errnum::Nocapa,
                "device incapable of queuing",
            )));
        }

        let seq = slot.core.wq_seq;
        slot.core.wq_seq += 1;

        let mut tmridx = Tmridx::INVALID;
        if let Some(tmout) = tmout {
            if tmout.is_pos() {
                let when = self.gettime() + tmout;
                tmridx = self.tmr.ins(when, TmrPayload::WriteTmout(id, seq));
            }
        }

        let slot = self.devices.get_mut(id).expect("slot is still present");
        slot.core.wq.push_back(Wq {
            seq,
            payload,
            olen,
            ctx,
            dst,
            tmridx,
        });

        if !slot.core.cap.contains(DevCap::OUT_WATCHED) {
            // arrange for output readiness to drain the queue
            if let Err(err) = self.dev_watch(id, WatchCmd::Renew, DevEvent::IN) {
                if let Some(slot) = self.devices.get_mut(id) {
                    if let Some(pos) = slot.core.wq.iter().position(|q| q.seq == seq) {
                        let q = slot.core.wq.remove(pos).expect("position was just found");
                        if q.tmridx.is_valid() {
                            self.tmr.del(q.tmridx);
                        }
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn enqueue_completed(&mut self, id: DevId, olen: usize, ctx: usize, dst: Option<&Skad>) {
        if let Some(slot) = self.devices.get_mut(id) {
            slot.core.cw_count += 1;
        }
        self.cwq.push_back(Cwq {
            dev: id,
            olen,
            ctx,
            dst: dst.copied(),
        });
    }

    /*
     * ===== completed-write queue =====
     */

    fn fire_cwq_handlers(&mut self) {
        while let Some(cwq) = self.cwq.pop_front() {
            if let Some(slot) = self.devices.get_mut(cwq.dev) {
                debug_assert!(slot.core.cw_count >= 1);
                slot.core.cw_count -= 1;
            }
            if let Some(Err(err)) =
                self.evcb_on_write(cwq.dev, Ok(cwq.olen), cwq.ctx, cwq.dst.as_ref())
            {
                debug!(
                    "{:?} - halting device for on_write error upon write completion - {}",
                    cwq.dev, err
                );
                self.last_err = err;
                self.dev_halt(cwq.dev);
            }
        }
    }

    fn fire_cwq_handlers_for_dev(&mut self, dev: DevId, for_kill: bool) {
        let mut i = 0;
        while i < self.cwq.len() {
            if self.cwq[i].dev != dev {
                i += 1;
                continue;
            }
            let cwq = self.cwq.remove(i).expect("index was just checked");
            if let Some(slot) = self.devices.get_mut(dev) {
                debug_assert!(slot.core.cw_count >= 1);
                slot.core.cw_count -= 1;
            }
            let r = self.evcb_on_write(dev, Ok(cwq.olen), cwq.ctx, cwq.dst.as_ref());
            if !for_kill {
                if let Some(Err(err)) = r {
                    debug!(
                        "{:?} - halting device for on_write error upon write completion - {}",
                        dev, err
                    );
                    self.last_err = err;
                    self.dev_halt(dev);
                }
            }
        }
    }

    /*
     * ===== event dispatch =====
     */

    fn dispatchable(&self, id: DevId) -> bool {
        self.devices
            .get(id)
            .map_or(false, |s| !s.core.cap.intersects(DevCap::HALTED | DevCap::ZOMBIE))
    }

    fn handle_event(&mut self, id: DevId, events: DevEvent, rdhup: bool) {
        let Some(slot) = self.devices.get_mut(id) else {
            return; // died earlier in this dispatch round
        };
        slot.core.cap.remove(DevCap::RENEW_REQUIRED);

        let mut xevents = events;
        if rdhup {
            xevents |= DevEvent::HUP;
        }
        match self.evcb_ready(id, xevents) {
            Some(Err(err)) => {
                debug!("{:?} - halting device for ready callback error - {}", id, err);
                self.last_err = err;
                self.dev_halt(id);
                return;
            }
            Some(Ok(EvGate::Skip)) => {
                self.renew_after_event(id);
                return;
            }
            Some(Ok(EvGate::Proceed)) | None => {}
        }

        // PRI is reserved for urgent-data handling

        if events.contains(DevEvent::OUT) && self.dispatchable(id) {
            self.handle_out(id);
        }

        if events.contains(DevEvent::IN) && self.dispatchable(id) {
            self.handle_in(id);
        }

        if self.dispatchable(id) {
            self.handle_hup_err(id, events, rdhup);
        }

        self.renew_after_event(id);
    }

    /// Drains the write queue while the device stays writable.
    fn handle_out(&mut self, id: DevId) {
        loop {
            // one driver call against the queue head
            let res = {
                let Some(slot) = self.devices.get_mut(id) else {
                    return;
                };
                let core = &mut slot.core;
                let Some(q) = core.wq.front_mut() else {
                    break;
                };
                let Some(drv) = slot.driver.as_mut() else {
                    return;
                };
                match &q.payload {
                    WqPayload::Bytes { buf, pos } => drv.write(&buf[*pos..], q.dst.as_ref()),
                    WqPayload::Sendfile { fd, foff, rem } => drv.sendfile(*fd, *foff, *rem),
                }
            };

            match res {
                Err(err) => {
                    let err = Error::from_io(err);
                    debug!("{:?} - halting device for write failure - {}", id, err);
                    self.last_err = err;
                    self.dev_halt(id);
                    return;
                }
                Ok(None) => break, // still blocked
                Ok(Some(n)) => {
                    let finished = {
                        let Some(slot) = self.devices.get_mut(id) else {
                            return;
                        };
                        let core = &mut slot.core;
                        let Some(q) = core.wq.front_mut() else {
                            break;
                        };
                        q.advance(n.min(q.remaining()));
                        if q.remaining() > 0 {
                            None // send the leftover of this entry
                        } else {
                            let q = core.wq.pop_front().expect("front entry exists");
                            let out_closed =
                                q.is_eof() && core.cap.contains(DevCap::STREAM);
                            if out_closed {
                                core.cap.insert(DevCap::OUT_CLOSED);
                                core.cap.insert(DevCap::RENEW_REQUIRED);
                            }
                            Some((q, out_closed))
                        }
                    };

                    let Some((q, out_closed)) = finished else {
                        continue;
                    };
                    if q.tmridx.is_valid() {
                        self.tmr.del(q.tmridx);
                    }

                    if let Some(Err(err)) =
                        self.evcb_on_write(id, Ok(q.olen), q.ctx, q.dst.as_ref())
                    {
                        debug!("{:?} - halting device for on_write error - {}", id, err);
                        self.last_err = err;
                        self.dev_halt(id);
                        return;
                    }

                    if out_closed {
                        // the write half just closed; drop the rest of
                        // the queue without callbacks
                        if let Some(slot) = self.devices.get_mut(id) {
                            while let Some(q) = slot.core.wq.pop_front() {
                                if q.tmridx.is_valid() {
                                    self.tmr.del(q.tmridx);
                                }
                            }
                        }
                        break;
                    }
                }
            }
        }

        if !self.dispatchable(id) {
            return;
        }
        let Some(slot) = self.devices.get_mut(id) else {
            return;
        };
        if slot.core.wq.is_empty() {
            if slot
                .core
                .cap
                .contains(DevCap::IN_CLOSED | DevCap::OUT_CLOSED)
            {
                debug!("{:?} - halting device with closed input and output", id);
                self.dev_halt(id);
            } else {
                slot.core.cap.insert(DevCap::RENEW_REQUIRED);
            }
        }
    }

    /// Greedy read loop: keeps reading while the callback asks for
    /// more and data is available.
    fn handle_in(&mut self, id: DevId) {
        let mut buf = self
            .bigbuf
            .take()
            .unwrap_or_else(|| vec![0u8; BIGBUF_LEN].into_boxed_slice());

        loop {
            let (res, rtmridx, rtmout) = {
                let Some(slot) = self.devices.get_mut(id) else {
                    break;
                };
                let Some(drv) = slot.driver.as_mut() else {
                    break;
                };
                (drv.read(&mut buf), slot.core.rtmridx, slot.core.rtmout)
            };

            // re-arm the read deadline; the pending read is being
            // answered by this very event
            if rtmridx.is_valid() {
                let when = self.gettime() + rtmout;
                self.tmr.upd(rtmridx, when);
            }

            match res {
                Err(err) => {
                    let err = Error::from_io(err);
                    debug!("{:?} - halting device for read failure - {}", id, err);
                    self.last_err = err;
                    self.dev_halt(id);
                    break;
                }
                Ok(None) => break, // would block
                Ok(Some((len, srcaddr))) => {
                    // run completed-write callbacks enqueued before this
                    // read so on_read never observes them out of order
                    self.fire_cwq_handlers();

                    let stream = self
                        .devices
                        .get(id)
                        .map_or(false, |s| s.core.cap.contains(DevCap::STREAM));

                    if len == 0 && stream {
                        // EOF on a stream, reported exactly once
                        if let Some(slot) = self.devices.get_mut(id) {
                            slot.core.cap.insert(DevCap::IN_CLOSED);
                            slot.core.cap.insert(DevCap::RENEW_REQUIRED);
                        }
                        let r = self.evcb_on_read(id, Rd::Eof, None);
                        let out_closed = self
                            .devices
                            .get(id)
                            .map_or(false, |s| s.core.cap.contains(DevCap::OUT_CLOSED));
                        if matches!(r, Some(Err(_))) || out_closed {
                            debug!("{:?} - halting stream device on input EOF", id);
                            self.dev_halt(id);
                        }
                        break;
                    }

                    match self.evcb_on_read(id, Rd::Data(&buf[..len]), srcaddr.as_ref()) {
                        Some(Err(err)) => {
                            debug!("{:?} - halting device for on_read failure - {}", id, err);
                            self.last_err = err;
                            self.dev_halt(id);
                            break;
                        }
                        Some(Ok(RdCtl::Stop)) | None => break,
                        Some(Ok(RdCtl::Again)) => {}
                    }
                }
            }
        }

        if self.bigbuf.is_none() {
            self.bigbuf = Some(buf);
        }
    }

    fn handle_hup_err(&mut self, id: DevId, events: DevEvent, rdhup: bool) {
        if events.intersects(DevEvent::ERR | DevEvent::HUP) {
            // error or hangup arrived, possibly alongside IN/OUT which
            // were already served above
            let in_closed = self
                .devices
                .get(id)
                .map_or(true, |s| s.core.cap.contains(DevCap::IN_CLOSED));
            if !in_closed {
                // simulated EOF: input was not closed but the device
                // reported hangup or error
                let rd = if events.contains(DevEvent::ERR) {
                    Rd::Err(Errnum::Deverr)
                } else {
                    Rd::Eof
                };
                let _ = self.evcb_on_read(id, rd, None);
            }
            if let Some(slot) = self.devices.get_mut(id) {
                slot.core.cap.insert(DevCap::IN_CLOSED);
                slot.core.cap.insert(DevCap::OUT_CLOSED);
                slot.core.cap.insert(DevCap::RENEW_REQUIRED);
            }
        } else if rdhup && !events.intersects(DevEvent::IN | DevEvent::OUT | DevEvent::PRI) {
            // read-side hangup with nothing readable: full close. With
            // IN/OUT set it may be a half-open peer; the next read will
            // see the EOF.
            if let Some(slot) = self.devices.get_mut(id) {
                slot.core.cap.insert(DevCap::IN_CLOSED);
                slot.core.cap.insert(DevCap::OUT_CLOSED);
                slot.core.cap.insert(DevCap::RENEW_REQUIRED);
            }
        }

        let both_closed = self.devices.get(id).map_or(false, |s| {
            s.core
                .cap
                .contains(DevCap::IN_CLOSED | DevCap::OUT_CLOSED)
        });
        if both_closed {
            debug!("{:?} - halting device with closed input and output", id);
            self.dev_halt(id);
        }
    }

    fn renew_after_event(&mut self, id: DevId) {
        if !self.dispatchable(id) {
            return;
        }
        let renew = self
            .devices
            .get(id)
            .map_or(false, |s| s.core.cap.contains(DevCap::RENEW_REQUIRED));
        if renew && self.dev_watch(id, WatchCmd::Renew, DevEvent::IN).is_err() {
            debug!("{:?} - halting device for watcher renewal failure", id);
            self.dev_halt(id);
        }
    }

    /*
     * ===== device control =====
     */

    pub fn dev_ioctl(&mut self, id: DevId, cmd: &mut dyn Any) -> Result<()> {
        let Some(slot) = self.devices.get_mut(id) else {
            return Err(self.seterr(Error::new(Errnum::Noent)));
        };
        let Some(mut drv) = slot.driver.take() else {
            return Err(self.seterr(Error::new(Errnum::Busy)));
        };
        let r = drv.ioctl(cmd);
        if let Some(slot) = self.devices.get_mut(id) {
            if slot.driver.is_none() {
                slot.driver = Some(drv);
            }
        }
        if let Err(err) = &r {
            self.last_err = err.clone();
        }
        r
    }

    /*
     * ===== the loop =====
     */

    pub fn stopreq(&self) -> StopReq {
        StopReq::from_u8(self.stopreq.load(Ordering::Acquire))
    }

    /// Requests the loop to stop and wakes a blocked wait.
    pub fn stop(&mut self, req: StopReq) {
        self.stopreq.store(req as u8, Ordering::Release);
        if let Some(mux) = &self.mux {
            mux.intr();
        }
    }

    /// A clonable handle for stopping the loop from outside it.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            flag: Arc::clone(&self.stopreq),
            sender: self
                .mux
                .as_ref()
                .and_then(|m| m.clone_waker_sender().ok())
                .map(Arc::new),
        }
    }

    /// Wakes a blocked wait without changing the stop reason.
    pub fn intr(&self) {
        if let Some(mux) = &self.mux {
            mux.intr();
        }
    }

    fn next_wait_tmout(&self) -> Ntime {
        match self.tmr.peek_deadline() {
            Some(deadline) => {
                let now = self.gettime();
                if deadline <= now {
                    Ntime::ZERO
                } else {
                    deadline - now
                }
            }
            // without a timer deadline, wake up quickly if halted
            // devices are pending, otherwise after the default second
            None => {
                if self.hltq.is_empty() {
                    Ntime::from_secs(1)
                } else {
                    Ntime::ZERO
                }
            }
        }
    }

    /// Runs one iteration of the loop.
    pub fn exec(&mut self) -> Result<()> {
        if !self.features.contains(Feature::MUX) {
            return Err(self.seterr(Error::new(Errnum::Nocapa)));
        }
        self.exec_once()
    }

    fn exec_once(&mut self) -> Result<()> {
        if !self.cfmb.is_empty() {
            self.clear_unneeded_cfmbs();
        }

        // completed writes first, then timers, then the completions the
        // timer handlers may have produced
        self.fire_cwq_handlers();
        self.fire_due_tmrjobs();
        self.fire_cwq_handlers();

        if self.act_count > 0 || self.tmr.len() > 0 {
            self.kill_all_halted_devices();

            let tmout = self.next_wait_tmout();
            let mut events = std::mem::take(&mut self.evbuf);
            events.clear();

            let wait_res = match self.mux.as_mut() {
                Some(mux) => mux.wait(tmout, &mut events),
                None => Ok(()),
            };

            match wait_res {
                Err(err) => {
                    self.evbuf = events;
                    warn_log!("failed to wait on multiplexer - {}", err);
                    let err = Error::from_io(err);
                    self.last_err = err.clone();
                    self.stopreq
                        .store(StopReq::WatcherError as u8, Ordering::Release);
                    return Err(err);
                }
                Ok(()) => {
                    for ev in events.drain(..) {
                        self.handle_event(DevId::from_token(ev.token), ev.events, ev.rdhup);
                    }
                    self.evbuf = events;
                }
            }
        }

        self.kill_all_halted_devices();
        Ok(())
    }

    /// Runs the loop until a stop is requested or no device and no
    /// timer job remains. A multiplexer failure is fatal and reported
    /// with the preserved error message.
    pub fn loop_(&mut self) -> Result<()> {
        if !self.features.contains(Feature::MUX) {
            return Err(self.seterr(Error::new(Errnum::Nocapa)));
        }
        if self.act_count == 0 && self.tmr.is_empty() {
            return Ok(());
        }

        self.stopreq
            .store(StopReq::None as u8, Ordering::Release);

        while self.stopreq() == StopReq::None {
            if self.act_count == 0 && self.tmr.is_empty() {
                break;
            }
            if let Err(err) = self.exec_once() {
                if self.stopreq() == StopReq::WatcherError {
                    // report the fatal watcher failure with whatever
                    // message the multiplexer left behind
                    let prev = self.last_err.msg().to_string();
                    let werr = Error::with_msg(
                        Errnum::Syserr,
                        format!("watcher error detected - {}", prev),
                    );
                    self.last_err = werr.clone();
                    return Err(werr);
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for Hio {
    fn drop(&mut self) {
        // unfired completion callbacks are not run at teardown
        self.cwq.clear();

        // services stop before devices die
        let svcs = std::mem::take(&mut self.svcs);
        for (_, mut svc) in svcs {
            svc.stop(self);
        }

        // active devices first, then halted ones
        for id in self.devices.ids() {
            let cap = match self.devices.get(id) {
                Some(s) => s.core.cap,
                None => continue,
            };
            if cap.intersects(DevCap::ACTIVE | DevCap::HALTED) {
                self.dev_kill(id);
            }
        }

        // whatever remains is a zombie; escalate force, then abandon
        for id in self.devices.ids() {
            if self.kill_and_free(id, 1).is_err() {
                let _ = self.kill_and_free(id, 2);
            }
        }

        self.tmr.clear_all();

        // a misbehaving checker makes this loop forever, as documented
        while !self.cfmb.is_empty() {
            self.clear_unneeded_cfmbs();
        }
    }
}

fn flatten(bufs: &[IoSlice<'_>], idx: usize, off: usize) -> Vec<u8> {
    let mut out = Vec::new();
    if idx < bufs.len() {
        out.extend_from_slice(&bufs[idx][off..]);
        for b in &bufs[idx + 1..] {
            out.extend_from_slice(b);
        }
    }
    out
}
