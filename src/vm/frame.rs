//! Physical frame table: tracks which user page owns each allocated data
//! frame and exposes a pluggable eviction hook for when the free list runs
//! dry.
//!
//! Grounded on `memory/frame_allocator.rs::BumpFrameAllocator`, which this
//! layers on top of: the bump allocator hands out fresh frames, this table
//! adds a free list so exiting/forking processes can give frames back, plus
//! the owner-tracking an eviction policy needs to pick a victim.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::paging::FrameAllocator;

use crate::memory::FRAME_ALLOCATOR;
use crate::scheduler::ThreadId;

/// Decides which resident frame to reclaim when the system is out of free
/// physical memory. No backing store (disk-based swap is a non-goal) means
/// the only safe policy today is to refuse; the trait exists so a future
/// swap file can be dropped in without touching callers of `alloc`.
pub trait EvictionPolicy: Send + Sync {
    fn select_victim(&self, owners: &BTreeMap<u64, (ThreadId, u64)>) -> Option<u64>;
}

struct NoEviction;
impl EvictionPolicy for NoEviction {
    fn select_victim(&self, _owners: &BTreeMap<u64, (ThreadId, u64)>) -> Option<u64> {
        None
    }
}

struct Inner {
    free_list: Vec<u64>,
    /// physical frame -> (owning thread, owning virtual page)
    owners: BTreeMap<u64, (ThreadId, u64)>,
    eviction: Box<dyn EvictionPolicy>,
}

pub struct FrameTable {
    inner: Mutex<Inner>,
}

impl FrameTable {
    fn new() -> Self {
        FrameTable {
            inner: Mutex::new(Inner { free_list: Vec::new(), owners: BTreeMap::new(), eviction: Box::new(NoEviction) }),
        }
    }

    /// Replace the eviction policy, e.g. with a swap-backed one.
    pub fn set_eviction_policy(&self, policy: Box<dyn EvictionPolicy>) {
        self.inner.lock().eviction = policy;
    }

    /// Allocate a zeroed data frame for `owner`'s page at `vaddr`.
    pub fn alloc(&self, owner: ThreadId, vaddr: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let phys = if let Some(reused) = inner.free_list.pop() {
            reused
        } else if let Some(frame) = FRAME_ALLOCATOR.lock().allocate_frame() {
            frame.start_address().as_u64()
        } else if let Some(victim) = inner.eviction.select_victim(&inner.owners) {
            victim
        } else {
            return None;
        };

        unsafe { core::ptr::write_bytes(phys as *mut u8, 0, 4096) };
        inner.owners.insert(phys, (owner, vaddr));
        Some(phys)
    }

    /// Return a frame to the free list.
    pub fn free(&self, phys: u64) {
        let mut inner = self.inner.lock();
        inner.owners.remove(&phys);
        inner.free_list.push(phys);
    }

    pub fn owner_of(&self, phys: u64) -> Option<(ThreadId, u64)> {
        self.inner.lock().owners.get(&phys).copied()
    }

    /// Re-tag a frame's owner, used when a frame is allocated before the
    /// thread claiming it has a `ThreadId` yet (process creation allocates
    /// the initial stack frame before `spawn_with` hands back the new tid).
    pub fn reassign_owner(&self, phys: u64, new_owner: ThreadId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.owners.get_mut(&phys) {
            entry.0 = new_owner;
        }
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().owners.len()
    }
}

lazy_static! {
    pub static ref FRAMES: FrameTable = FrameTable::new();
}

pub fn alloc(owner: ThreadId, vaddr: u64) -> Option<u64> {
    FRAMES.alloc(owner, vaddr)
}

pub fn free(phys: u64) {
    FRAMES.free(phys)
}

pub fn reassign_owner(phys: u64, new_owner: ThreadId) {
    FRAMES.reassign_owner(phys, new_owner)
}
