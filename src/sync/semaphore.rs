//! Counting semaphore with a FIFO-priority-ordered waiter list.

use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::list::SortedList;
use crate::scheduler::{self, ThreadId};

struct Inner {
    count: u32,
    waiters: SortedList<ThreadId>,
}

pub struct Semaphore {
    inner: Mutex<Inner>,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Semaphore {
            inner: Mutex::new(Inner { count, waiters: SortedList::new() }),
        }
    }

    /// Wait for the counter to become positive, then decrement it.
    pub fn down(&self) {
        interrupts::without_interrupts(|| loop {
            {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    inner.count -= 1;
                    return;
                }
                let me = scheduler::current_tid();
                inner.waiters.push(me, |t| scheduler::priority_of(*t));
            }
            // Block outside the inner lock: `block()` does not return until
            // another thread has `unblock`ed us, which may itself need this
            // semaphore's lock (e.g. to requeue after a spurious wake).
            scheduler::block();
        });
    }

    /// Increment the counter and wake the highest-priority waiter, if any.
    /// Yields if the woken thread now outranks the running thread (§5,
    /// "yields on priority").
    pub fn up(&self) {
        interrupts::without_interrupts(|| {
            let woken = {
                let mut inner = self.inner.lock();
                inner.count += 1;
                inner.waiters.pop_front()
            };
            if let Some(tid) = woken {
                scheduler::unblock(tid);
                scheduler::maybe_yield_to_higher();
            }
        });
    }

    pub fn try_down(&self) -> bool {
        interrupts::without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.count > 0 {
                inner.count -= 1;
                true
            } else {
                false
            }
        })
    }

    pub fn value(&self) -> u32 {
        self.inner.lock().count
    }
}
