//! The scheduler singleton: a fixed-capacity thread arena, a priority-ordered
//! ready list, a sleep list, and the context-switch driver.
//!
//! Grounded on the teacher's `SCHEDULER` lazy_static singleton and its
//! `yield_now`/`exit_current` pair; the thread arena replaces the teacher's
//! `VecDeque<Process>` ready queue with a fixed-size slot table per the
//! "parent references forming cycles" redesign resolution in DESIGN.md, so
//! threads are always addressed by `ThreadId`, never held by value in a
//! queue that also doubles as the process table.

pub mod context;
pub mod thread;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;

use context::Context;
pub use thread::{
    LockLike, Thread, ThreadId, ThreadStatus, UserState, CHILD_MAX, FD_MAX, NICE_MAX, NICE_MIN, PRI_DEFAULT,
    PRI_MAX, PRI_MIN, TIME_SLICE,
};

use crate::fixed_point::Fixed;
use crate::list::SortedList;

/// Size of each thread's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Fixed-capacity thread arena, per DESIGN.md's resolution of the "parent
/// references forming cycles" redesign flag.
pub const MAX_THREADS: usize = 64;

#[derive(Debug)]
pub enum SchedError {
    OutOfMemory,
}

/// Register frame saved on a thread's kernel stack by `syscall_handler_asm`
/// at offset `kernel_stack_top - 152`, in exactly the order the handler
/// pushes (`rax` is never pushed — it carries the syscall number in and the
/// result out through the register file directly). `process::fork` copies
/// this verbatim to seed the child's initial registers.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TrapFrame {
    pub rcx: u64,
    pub rbx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Byte offset of the saved `TrapFrame` below the top of a thread's kernel
/// stack, matching `syscall_handler_asm`'s 14 pushes (112 bytes).
pub const TRAP_FRAME_STACK_OFFSET: u64 = 152;

/// Trampoline a forked child resumes at: pops the cloned `TrapFrame` off its
/// kernel stack and `iretq`s straight back to user mode with `rax = 0`.
#[unsafe(naked)]
pub extern "C" fn fork_trampoline() {
    unsafe {
        core::arch::naked_asm!(
            "xor rax, rax",
            "pop rcx",
            "pop rbx",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rbp",
            "pop r8",
            "pop r9",
            "pop r10",
            "pop r11",
            "pop r12",
            "pop r13",
            "pop r14",
            "pop r15",
            "iretq",
        );
    }
}

/// Read the `TrapFrame` most recently saved on `tid`'s kernel stack.
pub fn trap_frame_of(tid: ThreadId) -> Option<TrapFrame> {
    with_thread(tid, |t| {
        let top = t.kernel_stack.as_ptr() as u64 + t.kernel_stack.len() as u64;
        let ptr = (top - TRAP_FRAME_STACK_OFFSET) as *const TrapFrame;
        unsafe { *ptr }
    })
}

struct Scheduler {
    threads: Vec<Option<Thread>>,
    current: Option<ThreadId>,
    ready: SortedList<ThreadId>,
    /// `(tid, wake_up_time)`, kept ascending by `wake_up_time`.
    sleeping: SortedList<(ThreadId, u64)>,
    /// Threads torn down by `exit_thread` but not yet reclaimed; a thread
    /// cannot free its own in-use kernel stack, so reclamation happens on the
    /// next `switch_away`.
    zombies: Vec<ThreadId>,
    next_tid: u64,
    ticks: u64,
    active: bool,
    mlfqs: bool,
    load_avg: Fixed,
}

impl Scheduler {
    fn new() -> Self {
        let mut threads = Vec::with_capacity(MAX_THREADS);
        threads.resize_with(MAX_THREADS, || None);
        Scheduler {
            threads,
            current: None,
            ready: SortedList::new(),
            sleeping: SortedList::new(),
            zombies: Vec::new(),
            next_tid: 1,
            ticks: 0,
            active: false,
            mlfqs: false,
            load_avg: Fixed::ZERO,
        }
    }

    fn find(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.iter().flatten().find(|t| t.tid == tid)
    }

    fn find_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().flatten().find(|t| t.tid == tid)
    }

    fn free_slot(&self) -> Option<usize> {
        self.threads.iter().position(|s| s.is_none())
    }

    fn effective_priority(&self, tid: ThreadId) -> i64 {
        self.find(tid).map(|t| t.priority).unwrap_or(PRI_MIN)
    }

    /// Re-sort the ready list after a priority change (donation, nice,
    /// `set_priority`, MLFQ recompute).
    fn resort_ready(&mut self) {
        let ids: Vec<ThreadId> = self.ready.iter().copied().collect();
        let snapshot: Vec<(ThreadId, i64)> =
            ids.iter().map(|&tid| (tid, self.effective_priority(tid))).collect();
        self.ready
            .resort(move |tid| snapshot.iter().find(|(id, _)| id == tid).map(|(_, p)| *p).unwrap_or(i64::MIN));
    }
}

lazy_static! {
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Bring up the scheduler, consuming the `-o mlfqs` boot flag, and promote
/// the current (boot) execution context to thread 0.
pub fn init(mlfqs: bool) {
    let mut sched = SCHEDULER.lock();
    sched.mlfqs = mlfqs;

    let mut idle = Thread::new(ThreadId(0), "idle", PRI_MIN, Context::empty(), Box::new([0u8; 4]));
    idle.status = ThreadStatus::Running;

    sched.threads[0] = Some(idle);
    sched.current = Some(ThreadId(0));
    sched.active = true;
    drop(sched);

    crate::log_info!("scheduler online ({})", if mlfqs { "mlfqs" } else { "priority" });
}

/// Spawn a kernel thread. `arg` is handed to `entry` through `r12`; the
/// function `entry` points at is expected to read it on first dispatch (see
/// `process::create_initd`).
pub fn create(
    name: &str,
    priority: i64,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) -> Result<ThreadId, SchedError> {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let slot = sched.free_slot().ok_or(SchedError::OutOfMemory)?;

        let tid = ThreadId(sched.next_tid);
        sched.next_tid += 1;

        let stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64;

        let mut ctx = Context::new(entry as usize as u64, stack_top);
        ctx.r12 = arg as u64;

        let mut thread = Thread::new(tid, name, priority, ctx, stack);
        thread.status = ThreadStatus::Ready;
        let cur_priority = sched.current.map(|c| sched.effective_priority(c)).unwrap_or(PRI_MIN);

        sched.threads[slot] = Some(thread);
        sched.ready.push(tid, move |_| priority);
        drop(sched);

        if priority > cur_priority {
            yield_now();
        }

        Ok(tid)
    })
}

/// Insert a fully custom thread — a prebuilt `Context` (e.g. pointed at
/// `fork_trampoline` with an already-populated `TrapFrame`), a kernel stack,
/// and optionally a `UserState`. Used by `process::{create_initd, fork}`,
/// which need control over the initial register state `create` doesn't give.
pub fn spawn_with(
    name: &str,
    priority: i64,
    context: Context,
    kernel_stack: Box<[u8]>,
    user: Option<UserState>,
) -> Result<ThreadId, SchedError> {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let slot = sched.free_slot().ok_or(SchedError::OutOfMemory)?;

        let tid = ThreadId(sched.next_tid);
        sched.next_tid += 1;

        let mut thread = Thread::new(tid, name, priority, context, kernel_stack);
        thread.status = ThreadStatus::Ready;
        thread.user = user;

        sched.threads[slot] = Some(thread);
        sched.ready.push(tid, move |_| priority);
        Ok(tid)
    })
}

/// Return the currently running thread's id.
pub fn current_tid() -> ThreadId {
    SCHEDULER.lock().current.expect("scheduler not initialized")
}

pub fn priority_of(tid: ThreadId) -> i64 {
    SCHEDULER.lock().effective_priority(tid)
}

pub fn with_thread_mut<R>(tid: ThreadId, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    interrupts::without_interrupts(|| SCHEDULER.lock().find_mut(tid).map(f))
}

pub fn with_thread<R>(tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    interrupts::without_interrupts(|| SCHEDULER.lock().find(tid).map(f))
}

/// Snapshot `(tid, name, status)` for every live thread, for the debug
/// console's `ps` command.
pub fn list_tasks() -> Vec<(u64, String, &'static str)> {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        sched
            .threads
            .iter()
            .flatten()
            .map(|t| {
                let status = match t.status {
                    ThreadStatus::Running => "running",
                    ThreadStatus::Ready => "ready",
                    ThreadStatus::Blocked => "blocked",
                    ThreadStatus::Dying => "dying",
                };
                (t.tid.0, t.name.clone(), status)
            })
            .collect()
    })
}

pub fn donate_priority(tid: ThreadId, lock_id: usize, amount: i64) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if let Some(t) = sched.find_mut(tid) {
            t.donate(lock_id, amount);
        }
        sched.resort_ready();
    });
}

pub fn revoke_donation(tid: ThreadId, lock_id: usize) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if let Some(t) = sched.find_mut(tid) {
            t.revoke(lock_id);
        }
        sched.resort_ready();
    });
}

pub fn set_waiting_lock(tid: ThreadId, lock: Option<Arc<dyn LockLike>>) {
    with_thread_mut(tid, |t| t.waiting_lock = lock);
}

pub fn waiting_lock_of(tid: ThreadId) -> Option<Arc<dyn LockLike>> {
    with_thread(tid, |t| t.waiting_lock.clone()).flatten()
}

/// Block the current thread and switch away. Returns once another thread has
/// `unblock`ed it.
pub fn block() {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let me = sched.current.expect("block() with no current thread");
        if let Some(t) = sched.find_mut(me) {
            t.status = ThreadStatus::Blocked;
        }
        drop(sched);
        switch_away();
    });
}

/// Move a blocked thread to the ready list. Does not itself preempt the
/// caller; see §5's "plain unblock does not yield" ordering note.
pub fn unblock(tid: ThreadId) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let priority = sched.effective_priority(tid);
        match sched.find_mut(tid) {
            Some(t) if t.status == ThreadStatus::Blocked => t.status = ThreadStatus::Ready,
            _ => return,
        }
        sched.ready.push(tid, move |_| priority);
    });
}

/// Yield to the ready head if it now outranks the running thread.
pub fn maybe_yield_to_higher() {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        let cur = match sched.current {
            Some(c) => c,
            None => return,
        };
        let cur_priority = sched.effective_priority(cur);
        let outranked = sched
            .ready
            .front()
            .map(|&tid| sched.effective_priority(tid) > cur_priority)
            .unwrap_or(false);
        drop(sched);
        if outranked {
            yield_now();
        }
    });
}

/// Cooperatively yield to the next ready thread, if any.
pub fn yield_now() {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let me = match sched.current {
            Some(c) => c,
            None => return,
        };
        if sched.ready.is_empty() {
            return;
        }
        let priority = sched.effective_priority(me);
        if let Some(t) = sched.find_mut(me) {
            t.status = ThreadStatus::Ready;
        }
        sched.ready.push(me, move |_| priority);
        drop(sched);
        switch_away();
    });
}

/// Switch from the current thread to the next ready thread. Caller must hold
/// no locks and have interrupts disabled.
fn switch_away() {
    let mut sched = SCHEDULER.lock();
    let outgoing = sched.current.take().expect("switch_away with no current thread");
    reclaim_zombies(&mut sched);

    let next = loop {
        if let Some(tid) = sched.ready.pop_front() {
            break tid;
        }
        drop(sched);
        interrupts::enable_and_hlt();
        interrupts::disable();
        sched = SCHEDULER.lock();
        reclaim_zombies(&mut sched);
    };

    if let Some(t) = sched.find_mut(next) {
        t.status = ThreadStatus::Running;
        t.thread_ticks = 0;
        assert!(t.check_magic(), "kernel stack overflow detected");
    }
    sched.current = Some(next);
    activate_address_space(&sched, next);

    let outgoing_ctx = sched.find_mut(outgoing).map(|t| &mut t.context as *mut Context);
    let next_ctx = sched.find(next).map(|t| &t.context as *const Context).unwrap();
    drop(sched);

    match outgoing_ctx {
        Some(old) => unsafe { context::switch_context(old, next_ctx) },
        None => unsafe { context::restore_context(next_ctx) },
    }
}

fn activate_address_space(sched: &Scheduler, tid: ThreadId) {
    if let Some(t) = sched.find(tid) {
        if let Some(user) = &t.user {
            unsafe {
                core::arch::asm!("mov cr3, {0}", in(reg) user.page_table, options(nostack, preserves_flags));
            }
        }
        let stack_top = t.kernel_stack.as_ptr() as u64 + t.kernel_stack.len() as u64;
        crate::interrupts::gdt::set_tss_rsp0(stack_top & !0xF);
    }
}

fn reclaim_zombies(sched: &mut Scheduler) {
    let pending = core::mem::take(&mut sched.zombies);
    for tid in pending {
        if let Some(pos) = sched.threads.iter().position(|s| matches!(s, Some(t) if t.tid == tid)) {
            sched.threads[pos] = None;
        }
    }
}

/// Terminate the calling thread and never return. User-process exit runs
/// `process::exit`'s cleanup first and calls this last.
pub fn exit_thread() -> ! {
    interrupts::disable();
    let mut sched = SCHEDULER.lock();
    let me = sched.current.take().expect("exit_thread with no current thread");
    if let Some(t) = sched.find_mut(me) {
        t.status = ThreadStatus::Dying;
    }
    sched.zombies.push(me);
    reclaim_zombies(&mut sched);

    let next = loop {
        if let Some(tid) = sched.ready.pop_front() {
            break tid;
        }
        drop(sched);
        loop {
            interrupts::enable_and_hlt();
        }
    };

    if let Some(t) = sched.find_mut(next) {
        t.status = ThreadStatus::Running;
        t.thread_ticks = 0;
    }
    sched.current = Some(next);
    activate_address_space(&sched, next);
    let next_ctx = sched.find(next).map(|t| &t.context as *const Context).unwrap();
    drop(sched);

    unsafe { context::restore_context(next_ctx) };
    unreachable!("restore_context never returns")
}

/// Called from the timer interrupt handler once per tick.
pub fn tick() {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if !sched.active {
            return;
        }
        sched.ticks += 1;
        let now = sched.ticks;

        if let Some(cur) = sched.current {
            let mlfqs = sched.mlfqs;
            if let Some(t) = sched.find_mut(cur) {
                t.thread_ticks += 1;
                if mlfqs {
                    t.recent_cpu = t.recent_cpu.add_int(1);
                }
            }
        }

        if sched.mlfqs {
            if now % 4 == 0 {
                recompute_mlfq_priorities(&mut sched);
            }
            if now % 100 == 0 {
                recompute_recent_cpu_and_load_avg(&mut sched);
            }
        }

        let slice_expired = sched
            .current
            .and_then(|c| sched.find(c))
            .map(|t| t.thread_ticks >= TIME_SLICE)
            .unwrap_or(false);
        drop(sched);

        wake_expired_inner(now);
        if slice_expired {
            yield_now();
        }
    });
}

fn recompute_mlfq_priorities(sched: &mut Scheduler) {
    for slot in sched.threads.iter_mut().flatten() {
        slot.recompute_mlfq_priority();
    }
    sched.resort_ready();
}

fn recompute_recent_cpu_and_load_avg(sched: &mut Scheduler) {
    let running_counts_toward_load = sched.current.map(|c| c != ThreadId(0)).unwrap_or(false);
    let ready_count = sched.ready.len() as i64 + if running_counts_toward_load { 1 } else { 0 };
    let fifty_nine_sixtieths = Fixed::from_int(59).div_int(60);
    let one_sixtieth = Fixed::from_int(1).div_int(60);
    sched.load_avg = fifty_nine_sixtieths.mul(sched.load_avg).add(one_sixtieth.mul_int(ready_count));

    let coeff = sched.load_avg.mul_int(2).div(sched.load_avg.mul_int(2).add_int(1));
    for slot in sched.threads.iter_mut().flatten() {
        slot.recent_cpu = coeff.mul(slot.recent_cpu).add_int(slot.nice);
    }
}

/// Block the caller until absolute tick `wake_at`.
pub fn sleep_until(wake_at: u64) {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let me = sched.current.expect("sleep_until with no current thread");
        if wake_at <= sched.ticks {
            return;
        }
        if let Some(t) = sched.find_mut(me) {
            t.status = ThreadStatus::Blocked;
            t.wake_up_time = Some(wake_at);
        }
        sched.sleeping.push((me, wake_at), |(_, w)| -(*w as i64));
        drop(sched);
        switch_away();
    });
}

fn wake_expired_inner(now: u64) {
    let woken: Vec<ThreadId> = {
        let mut sched = SCHEDULER.lock();
        sched
            .sleeping
            .drain_matching(|(_, w)| *w <= now)
            .into_iter()
            .map(|(tid, _)| tid)
            .collect()
    };
    for tid in &woken {
        with_thread_mut(*tid, |t| t.wake_up_time = None);
        unblock(*tid);
    }
    if !woken.is_empty() {
        maybe_yield_to_higher();
    }
}

/// Pop all sleepers whose `wake_up_time` has passed. Called by `tick`;
/// exposed separately for unit tests driving the clock without the timer IDT.
pub fn wake_expired() {
    let now = SCHEDULER.lock().ticks;
    wake_expired_inner(now);
}

pub fn ticks() -> u64 {
    SCHEDULER.lock().ticks
}

pub fn is_mlfqs() -> bool {
    SCHEDULER.lock().mlfqs
}

/// Set the caller's base priority and recompute its effective priority,
/// yielding if the ready head now outranks it.
pub fn set_priority(p: i64) {
    let me = current_tid();
    with_thread_mut(me, |t| t.set_origin_priority(p.clamp(PRI_MIN, PRI_MAX)));
    interrupts::without_interrupts(|| SCHEDULER.lock().resort_ready());
    maybe_yield_to_higher();
}

pub fn get_priority() -> i64 {
    priority_of(current_tid())
}

pub fn set_nice(n: i64) {
    let me = current_tid();
    with_thread_mut(me, |t| {
        t.nice = n.clamp(NICE_MIN, NICE_MAX);
        t.recompute_mlfq_priority();
    });
    interrupts::without_interrupts(|| SCHEDULER.lock().resort_ready());
    maybe_yield_to_higher();
}

pub fn get_nice() -> i64 {
    with_thread(current_tid(), |t| t.nice).unwrap_or(0)
}

pub fn get_load_avg() -> i64 {
    SCHEDULER.lock().load_avg.to_percent_round()
}

pub fn get_recent_cpu() -> i64 {
    with_thread(current_tid(), |t| t.recent_cpu.to_percent_round()).unwrap_or(0)
}

/// Snapshot of live threads for the debug console's `ps` command.
pub fn list_threads() -> Vec<(u64, String, ThreadStatus, i64)> {
    SCHEDULER
        .lock()
        .threads
        .iter()
        .flatten()
        .map(|t| (t.tid.0, t.name.clone(), t.status, t.priority))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_default_is_zeroed() {
        let frame = TrapFrame::default();
        assert_eq!(frame.rcx, 0);
        assert_eq!(frame.rsp, 0);
    }
}
