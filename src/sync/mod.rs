//! Synchronization primitives layered on the scheduler's `block`/`unblock`.
//!
//! Grounded on the teacher's `fs/pipe.rs::PipeInner` — a `Mutex`-guarded
//! shared counter that callers in `syscalls/mod.rs` polled with a manual
//! block-yield-retry loop. These primitives replace that polling with real
//! wait queues tied into the scheduler, per §4.2.

pub mod condvar;
pub mod lock;
pub mod semaphore;

pub use condvar::Condvar;
pub use lock::Lock;
pub use semaphore::Semaphore;
