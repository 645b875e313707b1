//! Thread descriptor: the per-thread state the scheduler, synchronization
//! primitives, and process lifecycle all mutate.
//!
//! Grounded on `scheduler/task.rs::Process`/`ProcessState` from the teacher,
//! expanded with the scheduling and address-space attributes this spec
//! requires (donation bookkeeping, nice/recent_cpu, the coordination
//! semaphores, the supplemental page table).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::fixed_point::Fixed;
use crate::fs::fd::File;
use crate::sync::Semaphore;
use crate::vm::spt::Spt;
use spin::Mutex;

use super::context::Context;

pub const PRI_MIN: i64 = 0;
pub const PRI_MAX: i64 = 63;
pub const PRI_DEFAULT: i64 = 31;
pub const NICE_MIN: i64 = -20;
pub const NICE_MAX: i64 = 20;
pub const TIME_SLICE: u32 = 4;
pub const CHILD_MAX: usize = 16;
pub const FD_MAX: usize = 128;

/// Magic sentinel written at the base of a thread's kernel stack; overwritten
/// only by a stack overflow, checked on every schedule.
pub const STACK_MAGIC: u32 = 0xcd6ab0f1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Implemented by `sync::Lock` so a blocked thread can record which lock it
/// is waiting on without `scheduler` depending on `sync` (which itself
/// depends on `scheduler::block`/`unblock`).
pub trait LockLike: Send + Sync {
    fn lock_id(&self) -> usize;
    fn holder(&self) -> Option<ThreadId>;
}

/// User-process-only fields. Absent for pure kernel threads (the idle thread,
/// the boot thread before `create_initd` runs).
pub struct UserState {
    /// Physical address of this address space's PML4 (loaded into CR3).
    pub page_table: u64,
    /// The running executable, write-denied for the process's lifetime.
    pub exec_file: Option<Arc<Mutex<File>>>,
    pub fd_table: Vec<Option<Arc<Mutex<File>>>>,
    pub children: [Option<ThreadId>; CHILD_MAX],
    pub parent: Option<ThreadId>,
    pub exit_status: i64,
    /// `(child_tid, exit_status)` pairs pushed here by a child in `process::exit`
    /// just before it tears down, since the child's own `Thread` (and its
    /// `exit_status` field) is gone by the time a `wait`ing parent gets to run.
    pub exit_records: Vec<(ThreadId, i64)>,
    /// Signalled once per child exit; `wait` loops on it, rechecking
    /// `exit_records`, the usual semaphore-as-condvar pattern.
    pub wait_sema: Semaphore,
    pub spt: Spt,
    pub stack_bottom: u64,
    /// Last user `rsp` observed at a syscall or fault boundary, used to
    /// classify stack-growth faults from kernel mode.
    pub last_user_rsp: u64,
    /// Start addresses of active `mmap` regions, used by `munmap`.
    pub mmap_regions: Vec<u64>,
}

impl UserState {
    pub fn new(page_table: u64, stack_bottom: u64) -> Self {
        UserState {
            page_table,
            exec_file: None,
            fd_table: {
                let mut t = Vec::with_capacity(FD_MAX);
                t.resize_with(FD_MAX, || None);
                t
            },
            children: [None; CHILD_MAX],
            parent: None,
            exit_status: 0,
            exit_records: Vec::new(),
            wait_sema: Semaphore::new(0),
            spt: Spt::new(),
            stack_bottom,
            last_user_rsp: 0,
            mmap_regions: Vec::new(),
        }
    }
}

pub struct Thread {
    pub tid: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    /// Effective priority: `max(origin_priority, active donations)`.
    pub priority: i64,
    pub origin_priority: i64,
    /// `(lock_id, donated_amount)` pairs, one per lock currently donating to
    /// this thread, per the "bounded donation set" redesign note.
    donations: Vec<(usize, i64)>,
    pub waiting_lock: Option<Arc<dyn LockLike>>,
    pub nice: i64,
    pub recent_cpu: Fixed,
    pub wake_up_time: Option<u64>,
    pub context: Context,
    pub kernel_stack: Box<[u8]>,
    pub user: Option<UserState>,
    /// Ticks the thread has run in its current quantum (round-robin/MLFQ preemption).
    pub thread_ticks: u32,
}

impl Thread {
    pub fn new(tid: ThreadId, name: &str, priority: i64, context: Context, kernel_stack: Box<[u8]>) -> Self {
        debug_assert!(kernel_stack.len() >= 4, "kernel stack too small for magic sentinel");
        let mut stack = kernel_stack;
        stack[0..4].copy_from_slice(&STACK_MAGIC.to_le_bytes());
        Thread {
            tid,
            name: String::from(name),
            status: ThreadStatus::Blocked,
            priority,
            origin_priority: priority,
            donations: Vec::new(),
            waiting_lock: None,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            wake_up_time: None,
            context,
            kernel_stack: stack,
            user: None,
            thread_ticks: 0,
        }
    }

    pub fn is_user(&self) -> bool {
        self.user.is_some()
    }

    pub fn check_magic(&self) -> bool {
        self.kernel_stack.len() >= 4
            && u32::from_le_bytes(self.kernel_stack[0..4].try_into().unwrap()) == STACK_MAGIC
    }

    pub fn donate(&mut self, lock_id: usize, amount: i64) {
        match self.donations.iter_mut().find(|(id, _)| *id == lock_id) {
            Some(entry) => {
                if amount > entry.1 {
                    entry.1 = amount;
                }
            }
            None => self.donations.push((lock_id, amount)),
        }
        self.recompute_priority();
    }

    pub fn revoke(&mut self, lock_id: usize) {
        self.donations.retain(|(id, _)| *id != lock_id);
        self.recompute_priority();
    }

    pub fn has_active_donation(&self) -> bool {
        !self.donations.is_empty()
    }

    pub fn set_origin_priority(&mut self, p: i64) {
        self.origin_priority = p;
        self.recompute_priority();
    }

    fn recompute_priority(&mut self) {
        let max_donation = self.donations.iter().map(|(_, a)| *a).max();
        self.priority = match max_donation {
            Some(d) => self.origin_priority.max(d),
            None => self.origin_priority,
        };
    }

    /// Recompute `priority` from `recent_cpu`/`nice` under MLFQ, per §4.1.
    pub fn recompute_mlfq_priority(&mut self) {
        let p = Fixed::from_int(PRI_MAX)
            .sub(self.recent_cpu.div_int(4))
            .sub_int(2 * self.nice)
            .to_int_trunc();
        self.origin_priority = p.clamp(PRI_MIN, PRI_MAX);
        self.recompute_priority();
    }
}
