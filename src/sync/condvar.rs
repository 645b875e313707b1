//! Condition variable: `wait` atomically releases the associated lock and
//! blocks, `signal`/`broadcast` wake waiters in priority order.

use alloc::sync::Arc;
use spin::Mutex as SpinMutex;

use super::{Lock, Semaphore};
use crate::list::SortedList;
use crate::scheduler::{self, ThreadId};

struct Waiter {
    tid: ThreadId,
    sema: Arc<Semaphore>,
}

pub struct Condvar {
    waiters: SpinMutex<SortedList<Waiter>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar { waiters: SpinMutex::new(SortedList::new()) }
    }

    /// Release `lock`, block until woken, then reacquire `lock`.
    pub fn wait(&self, lock: &Arc<Lock>) {
        let waiter = Waiter {
            tid: scheduler::current_tid(),
            sema: Arc::new(Semaphore::new(0)),
        };
        let sema = waiter.sema.clone();
        self.waiters.lock().push(waiter, |w| scheduler::priority_of(w.tid));

        lock.release();
        sema.down();
        lock.acquire();
    }

    pub fn signal(&self) {
        let woken = self.waiters.lock().pop_front();
        if let Some(w) = woken {
            w.sema.up();
        }
    }

    pub fn broadcast(&self) {
        loop {
            let woken = self.waiters.lock().pop_front();
            match woken {
                Some(w) => w.sema.up(),
                None => break,
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
