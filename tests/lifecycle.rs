//! Device lifecycle: halt/kill/zombie transitions, check-and-free
//! blocks, timer jobs driven through the loop.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use evio::{
    Device, DevId, EvCb, Hio, Ntime, Rd, RdCtl, Result, Service, Skad, StopReq, WrRes,
};

mod util;
use util::{init, init_with_hio, millis};

/// A loop-resident device without an OS handle. Its `kill` can be
/// told to fail a number of times to exercise the zombie retry path.
struct VirtDev {
    kill_fails: Rc<Cell<u32>>,
    kill_calls: Rc<Cell<u32>>,
    drops: Rc<Cell<u32>>,
}

impl Device for VirtDev {
    fn initial_cap(&self) -> evio::DevCap {
        evio::DevCap::VIRTUAL | evio::DevCap::IN | evio::DevCap::OUT
    }

    fn syshnd(&self) -> RawFd {
        -1
    }

    fn kill(&mut self, force: u8) -> io::Result<()> {
        self.kill_calls.set(self.kill_calls.get() + 1);
        if self.kill_fails.get() > 0 && force < 2 {
            self.kill_fails.set(self.kill_fails.get() - 1);
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
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

impl Drop for VirtDev {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

struct VirtCb {
    disconnects: Rc<Cell<u32>>,
}

impl EvCb for VirtCb {
    fn on_read(
        &mut self,
        _hio: &mut Hio,
        _dev: DevId,
        _rd: Rd<'_>,
        _src: Option<&Skad>,
    ) -> Result<RdCtl> {
        Ok(RdCtl::Stop)
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

    fn on_kill(&mut self, _hio: &mut Hio, _dev: DevId) {
        self.disconnects.set(self.disconnects.get() + 1);
    }
}

struct Counters {
    kill_fails: Rc<Cell<u32>>,
    kill_calls: Rc<Cell<u32>>,
    drops: Rc<Cell<u32>>,
    disconnects: Rc<Cell<u32>>,
}

fn make_virt(hio: &mut Hio, kill_fails: u32) -> (DevId, Counters) {
    let c = Counters {
        kill_fails: Rc::new(Cell::new(kill_fails)),
        kill_calls: Rc::new(Cell::new(0)),
        drops: Rc::new(Cell::new(0)),
        disconnects: Rc::new(Cell::new(0)),
    };
    let dev = VirtDev {
        kill_fails: Rc::clone(&c.kill_fails),
        kill_calls: Rc::clone(&c.kill_calls),
        drops: Rc::clone(&c.drops),
    };
    let cb = VirtCb {
        disconnects: Rc::clone(&c.disconnects),
    };
    let id = hio.dev_make(Box::new(dev), Box::new(cb)).unwrap();
    (id, c)
}

#[test]
fn halt_is_idempotent() {
    let mut hio = init_with_hio();
    let (id, c) = make_virt(&mut hio, 0);
    assert_eq!(hio.active_count(), 1);

    hio.dev_halt(id);
    hio.dev_halt(id);
    assert_eq!(hio.active_count(), 0);
    assert_eq!(hio.device_count(), 1);

    // the next iteration boundary reaps the device exactly once
    hio.exec().unwrap();
    assert_eq!(hio.device_count(), 0);
    assert_eq!(c.kill_calls.get(), 1);
    assert_eq!(c.disconnects.get(), 1);
    assert_eq!(c.drops.get(), 1);
}

#[test]
fn kill_failure_goes_through_zombie_retry() {
    let mut hio = init_with_hio();
    let (id, c) = make_virt(&mut hio, 2);

    let t0 = hio.gettime();
    hio.dev_kill(id);
    // first attempt failed; the device lingers as a zombie with a
    // retry scheduled
    assert_eq!(c.kill_calls.get(), 1);
    assert_eq!(hio.zombie_count(), 1);
    assert_eq!(hio.device_count(), 1);
    assert_eq!(hio.tmrjob_count(), 1);

    // the retry timer keeps the loop alive until the kill succeeds
    hio.loop_().unwrap();
    let elapsed = millis(hio.gettime() - t0);

    assert_eq!(c.kill_calls.get(), 3);
    assert_eq!(c.drops.get(), 1);
    assert_eq!(c.disconnects.get(), 1);
    assert_eq!(hio.zombie_count(), 0);
    assert_eq!(hio.device_count(), 0);
    assert_eq!(hio.tmrjob_count(), 0);
    // two retries roughly 3 seconds apart
    assert!(elapsed >= 5_500, "retries came too fast: {}ms", elapsed);
    assert!(elapsed <= 10_000, "retries came too slow: {}ms", elapsed);
}

#[test]
fn teardown_force_frees_stubborn_zombies() {
    init();
    let drops = {
        let mut hio = Hio::open(evio::Feature::ALL, 16).unwrap();
        // kill never succeeds below force 2
        let (id, c) = make_virt(&mut hio, u32::MAX);
        hio.dev_kill(id);
        assert_eq!(hio.zombie_count(), 1);
        let drops = Rc::clone(&c.drops);
        drop(hio); // close escalates force and frees anyway
        drops
    };
    assert_eq!(drops.get(), 1);
}

#[test]
fn cfmb_entries_free_when_checker_agrees() {
    struct Payload {
        drops: Rc<Cell<u32>>,
    }
    impl Drop for Payload {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    let mut hio = init_with_hio();
    let drops = Rc::new(Cell::new(0));
    let polls = Rc::new(Cell::new(0));

    let p = Payload {
        drops: Rc::clone(&drops),
    };
    let polls2 = Rc::clone(&polls);
    hio.add_cfmb(Box::new(p), move |_| {
        polls2.set(polls2.get() + 1);
        polls2.get() >= 3
    });

    hio.exec().unwrap();
    hio.exec().unwrap();
    assert_eq!(drops.get(), 0);
    assert_eq!(hio.cfmb_count(), 1);

    hio.exec().unwrap();
    assert_eq!(drops.get(), 1);
    assert_eq!(hio.cfmb_count(), 0);
    assert_eq!(polls.get(), 3);
}

#[test]
fn timer_jobs_fire_through_the_loop() {
    let mut hio = init_with_hio();
    let fired = Rc::new(Cell::new(None));

    let fired2 = Rc::clone(&fired);
    let t0 = hio.gettime();
    hio.schedtmrjob_after(Ntime::from_millis(50), move |_hio, now| {
        fired2.set(Some(now));
    })
    .unwrap();

    // with no devices the loop drains once the job fires
    hio.loop_().unwrap();

    let at = fired.get().expect("timer job never fired");
    let delay = millis(at - t0);
    assert!(delay >= 50, "fired early: {}ms", delay);
    assert!(delay <= 1_000, "fired late: {}ms", delay);
    assert_eq!(hio.tmrjob_count(), 0);
}

#[test]
fn timer_handle_survives_update_and_rejects_double_delete() {
    let mut hio = init_with_hio();
    let keeper = hio
        .schedtmrjob_after(Ntime::from_secs(100), |_, _| {})
        .unwrap();
    let baseline = hio.tmrjob_count();

    let idx = hio
        .schedtmrjob_after(Ntime::from_secs(200), |_, _| {})
        .unwrap();
    assert!(hio.gettmrjobdeadline(idx).is_some());
    assert!(hio.updtmrjob(idx, hio.gettime() + Ntime::from_secs(10)));
    assert!(hio.gettmrjobdeadline(idx).is_some());
    assert!(hio.deltmrjob(idx));
    assert!(!hio.deltmrjob(idx));
    assert!(hio.gettmrjobdeadline(idx).is_none());
    assert_eq!(hio.tmrjob_count(), baseline);

    assert!(hio.deltmrjob(keeper));
}

#[test]
fn reentrant_timer_handlers_can_reschedule() {
    let mut hio = init_with_hio();
    let count = Rc::new(Cell::new(0u32));

    // each firing schedules the next until five have run
    fn arm(hio: &mut Hio, count: Rc<Cell<u32>>) {
        hio.schedtmrjob_after(Ntime::from_millis(10), move |hio, _| {
            count.set(count.get() + 1);
            if count.get() < 5 {
                arm(hio, Rc::clone(&count));
            }
        })
        .unwrap();
    }
    arm(&mut hio, Rc::clone(&count));

    hio.loop_().unwrap();
    assert_eq!(count.get(), 5);
}

#[test]
fn services_stop_before_devices_die() {
    struct TestSvc {
        stopped: Rc<Cell<bool>>,
        dev: DevId,
    }
    impl Service for TestSvc {
        fn stop(&mut self, hio: &mut Hio) {
            // the host must still be functional: killing our device
            // here has to work
            self.stopped.set(true);
            hio.dev_kill(self.dev);
        }
    }

    let stopped = Rc::new(Cell::new(false));
    let c = {
        let mut hio = init_with_hio();
        let (id, c) = make_virt(&mut hio, 0);
        hio.reg_svc(Box::new(TestSvc {
            stopped: Rc::clone(&stopped),
            dev: id,
        }));
        c
    };
    assert!(stopped.get());
    assert_eq!(c.kill_calls.get(), 1);
    assert_eq!(c.drops.get(), 1);
}

#[test]
fn stopper_interrupts_a_blocked_loop() {
    let mut hio = init_with_hio();
    // a far-away job keeps the loop waiting
    hio.schedtmrjob_after(Ntime::from_secs(600), |_, _| {})
        .unwrap();

    let stopper = hio.stopper();
    let t0 = hio.gettime();
    let th = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        stopper.stop(StopReq::Termination);
    });

    hio.loop_().unwrap();
    let elapsed = millis(hio.gettime() - t0);
    th.join().unwrap();

    assert_eq!(hio.stopreq(), StopReq::Termination);
    assert!(elapsed < 5_000, "stop did not interrupt the wait: {}ms", elapsed);
}
