//! A lock (binary semaphore with a holder) supporting one level of priority
//! donation, with the chain bounded to `MAX_DONATION_DEPTH` transitive hops
//! per §4.2/Non-goals ("priority donation chains deeper than one level of
//! nesting are specified but not optimized").

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::instructions::interrupts;

use super::Semaphore;
use crate::scheduler::{self, LockLike, ThreadId};

/// How many transitive "holder is itself waiting on another lock" hops a
/// donation chases before giving up. Bounded rather than walked to a fixed
/// point, per the redesign note on priority-donation chain walks.
const MAX_DONATION_DEPTH: usize = 8;

struct Inner {
    holder: Option<ThreadId>,
}

pub struct Lock {
    inner: Mutex<Inner>,
    sema: Semaphore,
}

impl Lock {
    pub fn new() -> Arc<Self> {
        Arc::new(Lock {
            inner: Mutex::new(Inner { holder: None }),
            sema: Semaphore::new(1),
        })
    }

    fn id(&self) -> usize {
        self as *const Lock as usize
    }

    pub fn is_held_by_current(&self) -> bool {
        self.inner.lock().holder == Some(scheduler::current_tid())
    }

    /// Acquire the lock, donating priority to the holder (and transitively,
    /// bounded by `MAX_DONATION_DEPTH`) if the holder has lower effective
    /// priority than the caller.
    pub fn acquire(self: &Arc<Self>) {
        let me = scheduler::current_tid();
        assert!(!self.is_held_by_current(), "recursive lock acquisition");

        interrupts::without_interrupts(|| {
            if let Some(holder) = self.inner.lock().holder {
                self.donate_chain(holder, scheduler::priority_of(me));
                scheduler::set_waiting_lock(me, Some(self.clone() as Arc<dyn LockLike>));
            }
        });

        self.sema.down();

        interrupts::without_interrupts(|| {
            scheduler::set_waiting_lock(me, None);
            self.inner.lock().holder = Some(me);
        });
    }

    pub fn try_acquire(self: &Arc<Self>) -> bool {
        let me = scheduler::current_tid();
        assert!(!self.is_held_by_current(), "recursive lock acquisition");
        if self.sema.try_down() {
            self.inner.lock().holder = Some(me);
            true
        } else {
            false
        }
    }

    /// Revoke donations tied to this lock from the holder, restore the
    /// holder's priority to `max(origin, remaining donations)`, then release.
    pub fn release(&self) {
        interrupts::without_interrupts(|| {
            let holder = self.inner.lock().holder.take();
            if let Some(h) = holder {
                scheduler::revoke_donation(h, self.id());
            }
        });
        self.sema.up();
        scheduler::maybe_yield_to_higher();
    }

    fn donate_chain(&self, first_holder: ThreadId, donor_priority: i64) {
        let mut target = first_holder;
        let mut depth = 0;
        loop {
            scheduler::donate_priority(target, self.id(), donor_priority);
            depth += 1;
            if depth >= MAX_DONATION_DEPTH {
                break;
            }
            match scheduler::waiting_lock_of(target) {
                Some(next_lock) => match next_lock.holder() {
                    Some(next_holder) => target = next_holder,
                    None => break,
                },
                None => break,
            }
        }
    }
}

impl LockLike for Lock {
    fn lock_id(&self) -> usize {
        self.id()
    }

    fn holder(&self) -> Option<ThreadId> {
        self.inner.lock().holder
    }
}
