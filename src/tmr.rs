//! Timer wheel: a binary heap of scheduled jobs with stable handles.
//!
//! A `Tmridx` stays valid while its job is scheduled no matter how the
//! heap reorders itself; relocations only rewrite the slot table. This
//! keeps cancellation and deadline updates O(log N) without scanning,
//! which the per-device read timers and per-write timeouts rely on.

use crate::dev::DevId;
use crate::hio::Hio;
use crate::time::Ntime;

/// Stable, generation-checked handle to a scheduled timer job.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Tmridx {
    slot: u32,
    gen: u32,
}

impl Tmridx {
    /// Handle value meaning "no job".
    pub const INVALID: Tmridx = Tmridx {
        slot: u32::MAX,
        gen: 0,
    };

    pub fn is_valid(&self) -> bool {
        *self != Tmridx::INVALID
    }
}

/// What to do when a job fires. The first three are owned by the core
/// so the dispatcher can clear the owner's stored handle before running
/// the handler; everything else goes through a boxed closure.
pub(crate) enum TmrPayload {
    ReadTmout(DevId),
    WriteTmout(DevId, u64),
    KillZombie(DevId),
    Func(Box<dyn FnMut(&mut Hio, Ntime)>),
}

const POS_FREE: usize = usize::MAX;

struct Slot {
    gen: u32,
    /// Current heap position, or `POS_FREE` when vacant.
    pos: usize,
    when: Ntime,
    seq: u64,
    payload: Option<TmrPayload>,
}

pub(crate) struct TmrWheel {
    slots: Vec<Slot>,
    free: Vec<u32>,
    heap: Vec<u32>,
    seq: u64,
}

impl TmrWheel {
    pub fn with_capacity(capa: usize) -> TmrWheel {
        let capa = capa.max(1);
        TmrWheel {
            slots: Vec::with_capacity(capa),
            free: Vec::new(),
            heap: Vec::with_capacity(capa),
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn ins(&mut self, when: Ntime, payload: TmrPayload) -> Tmridx {
        let seq = self.seq;
        self.seq += 1;

        let slot = match self.free.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot as usize];
                s.when = when;
                s.seq = seq;
                s.payload = Some(payload);
                slot
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    pos: POS_FREE,
                    when,
                    seq,
                    payload: Some(payload),
                });
                slot
            }
        };

        let pos = self.heap.len();
        self.heap.push(slot);
        self.slots[slot as usize].pos = pos;
        self.sift_up(pos);

        Tmridx {
            slot,
            gen: self.slots[slot as usize].gen,
        }
    }

    fn check(&self, idx: Tmridx) -> Option<usize> {
        let slot = self.slots.get(idx.slot as usize)?;
        if slot.gen != idx.gen || slot.pos == POS_FREE {
            return None;
        }
        Some(idx.slot as usize)
    }

    /// Repositions a scheduled job to a new deadline. The handle stays
    /// valid. Returns false for a dead handle.
    pub fn upd(&mut self, idx: Tmridx, when: Ntime) -> bool {
        let Some(slot) = self.check(idx) else {
            return false;
        };
        let seq = self.seq;
        self.seq += 1;
        let s = &mut self.slots[slot];
        s.when = when;
        s.seq = seq;
        let pos = s.pos;
        self.sift_down(pos);
        self.sift_up(self.slots[slot].pos);
        true
    }

    pub fn del(&mut self, idx: Tmridx) -> Option<TmrPayload> {
        let slot = self.check(idx)?;
        let pos = self.slots[slot].pos;
        Some(self.remove_at(pos))
    }

    pub fn deadline_of(&self, idx: Tmridx) -> Option<Ntime> {
        let slot = self.check(idx)?;
        Some(self.slots[slot].when)
    }

    /// The earliest deadline, if any job is scheduled.
    pub fn peek_deadline(&self) -> Option<Ntime> {
        self.heap
            .first()
            .map(|&slot| self.slots[slot as usize].when)
    }

    /// Removes and returns the earliest job if it is due at `now`.
    /// Firing loops over this so handlers can freely insert and delete
    /// other jobs in between.
    pub fn pop_due(&mut self, now: Ntime) -> Option<(Tmridx, Ntime, TmrPayload)> {
        let &slot = self.heap.first()?;
        let s = &self.slots[slot as usize];
        if s.when > now {
            return None;
        }
        let idx = Tmridx { slot, gen: s.gen };
        let when = s.when;
        let payload = self.remove_at(0);
        Some((idx, when, payload))
    }

    pub fn clear_all(&mut self) {
        while let Some(&slot) = self.heap.first() {
            let s = &self.slots[slot as usize];
            let idx = Tmridx { slot, gen: s.gen };
            let _ = self.del(idx);
        }
    }

    fn remove_at(&mut self, pos: usize) -> TmrPayload {
        let slot = self.heap[pos] as usize;
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        self.slots[self.heap[pos] as usize].pos = pos;
        self.heap.pop();

        let s = &mut self.slots[slot];
        s.pos = POS_FREE;
        s.gen = s.gen.wrapping_add(1);
        let payload = s.payload.take().expect("scheduled slot without payload");
        self.free.push(slot as u32);

        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(self.slots[self.heap[pos] as usize].pos);
        }
        payload
    }

    fn less(&self, a: u32, b: u32) -> bool {
        let (a, b) = (&self.slots[a as usize], &self.slots[b as usize]);
        (a.when, a.seq) < (b.when, b.seq)
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(self.heap[pos], self.heap[parent]) {
                break;
            }
            self.heap.swap(pos, parent);
            self.slots[self.heap[pos] as usize].pos = pos;
            self.slots[self.heap[parent] as usize].pos = parent;
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = pos * 2 + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < self.heap.len() && self.less(self.heap[right], self.heap[left]) {
                child = right;
            }
            if !self.less(self.heap[child], self.heap[pos]) {
                break;
            }
            self.heap.swap(pos, child);
            self.slots[self.heap[pos] as usize].pos = pos;
            self.slots[self.heap[child] as usize].pos = child;
            pos = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TmrPayload {
        TmrPayload::Func(Box::new(|_, _| {}))
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut w = TmrWheel::with_capacity(4);
        w.ins(Ntime::from_millis(30), noop());
        w.ins(Ntime::from_millis(10), noop());
        w.ins(Ntime::from_millis(20), noop());
        assert_eq!(w.peek_deadline(), Some(Ntime::from_millis(10)));

        let mut fired = Vec::new();
        while let Some((_, when, _)) = w.pop_due(Ntime::from_millis(100)) {
            fired.push(when);
        }
        assert_eq!(
            fired,
            vec![
                Ntime::from_millis(10),
                Ntime::from_millis(20),
                Ntime::from_millis(30)
            ]
        );
        assert!(w.is_empty());
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let mut w = TmrWheel::with_capacity(4);
        let when = Ntime::from_millis(5);
        let a = w.ins(when, noop());
        let b = w.ins(when, noop());
        let (first, _, _) = w.pop_due(when).unwrap();
        let (second, _, _) = w.pop_due(when).unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[test]
    fn handles_survive_relocation() {
        let mut w = TmrWheel::with_capacity(8);
        let idx = w.ins(Ntime::from_millis(50), noop());
        for ms in [5, 15, 25, 35, 45] {
            w.ins(Ntime::from_millis(ms), noop());
        }
        // reposition, then cancel through the original handle
        assert!(w.upd(idx, Ntime::from_millis(1)));
        assert_eq!(w.peek_deadline(), Some(Ntime::from_millis(1)));
        assert_eq!(w.deadline_of(idx), Some(Ntime::from_millis(1)));
        assert!(w.del(idx).is_some());
        assert!(w.del(idx).is_none());
        assert_eq!(w.len(), 5);
    }

    #[test]
    fn ins_upd_del_leaves_wheel_unchanged() {
        let mut w = TmrWheel::with_capacity(4);
        w.ins(Ntime::from_millis(7), noop());
        let size = w.len();
        let idx = w.ins(Ntime::from_millis(9), noop());
        assert!(w.upd(idx, Ntime::from_millis(3)));
        assert!(w.del(idx).is_some());
        assert_eq!(w.len(), size);
        assert_eq!(w.peek_deadline(), Some(Ntime::from_millis(7)));
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut w = TmrWheel::with_capacity(2);
        let idx = w.ins(Ntime::from_millis(1), noop());
        assert!(w.pop_due(Ntime::from_millis(1)).is_some());
        // the slot is vacant now; a reuse must not honor the old handle
        let idx2 = w.ins(Ntime::from_millis(2), noop());
        assert!(!w.upd(idx, Ntime::from_millis(9)));
        assert!(w.del(idx).is_none());
        assert!(w.del(idx2).is_some());
    }

    #[test]
    fn not_due_jobs_stay() {
        let mut w = TmrWheel::with_capacity(2);
        w.ins(Ntime::from_millis(100), noop());
        assert!(w.pop_due(Ntime::from_millis(99)).is_none());
        assert_eq!(w.len(), 1);
    }
}
