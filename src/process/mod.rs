//! Process lifecycle: load-and-launch, fork, exec, wait, exit.
//!
//! Grounded on the teacher's `scheduler::sys_fork`/`sys_exec`/`sys_wait`, with
//! the actual address-space duplication those stubs called out to
//! (`deep_clone_process_memory` et al.) now implemented in
//! `memory::paging`/`vm`. Per §4.4, fork is a synchronous deep copy done by
//! the parent before the child thread is ever scheduled — no COW, no handoff
//! semaphore needed between the two.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::interrupts::gdt;
use crate::loader::elf::{self, ExecError};
use crate::scheduler::context::Context;
use crate::scheduler::{self, SchedError, ThreadId, UserState, KERNEL_STACK_SIZE, PRI_DEFAULT};
use crate::vm::page::Page;
use crate::vm::spt::Spt;

#[derive(Debug)]
pub enum ProcessError {
    Load(ExecError),
    OutOfMemory,
    NotAChild,
}

impl From<ExecError> for ProcessError {
    fn from(e: ExecError) -> Self {
        ProcessError::Load(e)
    }
}

impl From<SchedError> for ProcessError {
    fn from(_: SchedError) -> Self {
        ProcessError::OutOfMemory
    }
}

/// Trampoline a freshly loaded process resumes at: reads the entry point and
/// initial user `rsp`/segment selectors out of `r12..r15` (set on its
/// `Context` by `spawn_user_thread`) and jumps straight to
/// `jump_to_usermode`, which never returns.
#[unsafe(naked)]
extern "C" fn usermode_entry_trampoline() {
    unsafe {
        core::arch::naked_asm!(
            "mov rdi, r12",
            "mov rsi, r13",
            "mov rdx, r14",
            "mov rcx, r15",
            "jmp {jump}",
            jump = sym crate::interrupts::usermode::jump_to_usermode,
        );
    }
}

/// Build a user-mode `Context`/`UserState` pair from a loaded image and hand
/// it to the scheduler. Shared by `create_initd` and `exec`.
fn spawn_user_thread(name: &str, image: elf::LoadedImage, args: &[String]) -> Result<ThreadId, ProcessError> {
    let _ = crate::fs::VFS.lock().deny_write(name);

    let pml4 = crate::memory::paging::create_new_page_table().ok_or(ProcessError::OutOfMemory)?;

    let stack_frame = crate::vm::frame::alloc(ThreadId(0), image.stack_bottom).ok_or(ProcessError::OutOfMemory)?;
    if !crate::memory::paging::map_user_page(pml4.as_u64(), image.stack_bottom, stack_frame, true) {
        crate::vm::frame::free(stack_frame);
        return Err(ProcessError::OutOfMemory);
    }
    let user_rsp = unsafe { elf::setup_stack(stack_frame as *mut u8, image.stack_bottom, args) };

    let mut spt = image.spt;
    spt.insert(Page::anon_resident(image.stack_bottom, true, stack_frame));

    let mut user = UserState::new(pml4.as_u64(), image.stack_bottom);
    user.exec_file = Some(image.exec_file);
    user.spt = spt;
    // fd 0/1/2 are the console by convention, same as a Pintos shell's stdin/
    // stdout/stderr; every process gets its own independent `File` so that
    // e.g. `close(1)` in one process never affects another's.
    user.fd_table[0] = Some(crate::fs::fd::File::new_console());
    user.fd_table[1] = Some(crate::fs::fd::File::new_console());
    user.fd_table[2] = Some(crate::fs::fd::File::new_console());

    let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = kernel_stack.as_ptr() as u64 + kernel_stack.len() as u64;

    let mut ctx = Context::new(usermode_entry_trampoline as usize as u64, stack_top);
    ctx.r12 = image.entry;
    ctx.r13 = user_rsp;
    ctx.r14 = gdt::user_code_selector().0 as u64;
    ctx.r15 = gdt::user_data_selector().0 as u64;

    let tid = scheduler::spawn_with(name, PRI_DEFAULT, ctx, kernel_stack, Some(user))?;
    crate::vm::frame::reassign_owner(stack_frame, tid);
    Ok(tid)
}

fn split_cmdline(cmdline: &str) -> (String, Vec<String>) {
    let mut parts = cmdline.split_whitespace().map(|s| s.to_string());
    let path = parts.next().unwrap_or_default();
    let args: Vec<String> = core::iter::once(path.clone()).chain(parts).collect();
    (path, args)
}

/// Load and launch the first user process, named by `cmdline`'s program path
/// with the rest of `cmdline` split into `argv`.
pub fn create_initd(cmdline: &str) -> Result<ThreadId, ProcessError> {
    let (path, args) = split_cmdline(cmdline);
    let image = elf::load(&path, &args)?;
    spawn_user_thread(&path, image, &args)
}

/// Load and launch a process replacing none of the caller's state — there is
/// no in-place `exec` here, only `exec`-as-`fork`-plus-`load`: the caller's
/// shell spawns a fresh process and does not reuse its own address space.
pub fn exec(cmdline: &str) -> Result<ThreadId, ProcessError> {
    let (path, args) = split_cmdline(cmdline);
    let image = elf::load(&path, &args)?;
    let parent = scheduler::current_tid();
    let child = spawn_user_thread(&path, image, &args)?;

    scheduler::with_thread_mut(child, |t| {
        if let Some(u) = t.user.as_mut() {
            u.parent = Some(parent);
        }
    });
    scheduler::with_thread_mut(parent, |t| {
        if let Some(u) = t.user.as_mut() {
            if let Some(slot) = u.children.iter_mut().find(|c| c.is_none()) {
                *slot = Some(child);
            }
        }
    });

    Ok(child)
}

/// Clone the calling user thread, copying its address space, file
/// descriptors, and current register state. Returns the child's `ThreadId`
/// to the parent; the child resumes at the same syscall return site with
/// `rax = 0` (via `fork_trampoline`).
pub fn fork(name: &str) -> Option<ThreadId> {
    let parent = scheduler::current_tid();
    let trap_frame = scheduler::trap_frame_of(parent)?;

    let (parent_pml4, resident_pages, stack_bottom, exec_file, priority) = scheduler::with_thread(parent, |t| {
        let u = t.user.as_ref()?;
        Some((u.page_table, u.spt.resident_pages(), u.stack_bottom, u.exec_file.clone(), t.priority))
    })??;

    let child_pml4 = crate::memory::paging::create_new_page_table()?;
    if !crate::memory::paging::deep_clone_process_memory(child_pml4.as_u64(), parent_pml4, &resident_pages) {
        crate::memory::paging::free_user_memory(child_pml4.as_u64(), &[]);
        return None;
    }

    let child_spt = scheduler::with_thread(parent, |t| {
        let spt = &t.user.as_ref()?.spt;
        Some(Spt::copy(spt, |vaddr| crate::memory::paging::translate_user_page(child_pml4.as_u64(), vaddr)))
    })??;

    if let Some(exec_file) = &exec_file {
        let path = exec_file.lock().path.clone();
        let _ = crate::fs::VFS.lock().deny_write(&path);
    }

    let fd_table = scheduler::with_thread(parent, |t| {
        t.user.as_ref().map(|u| u.fd_table.iter().map(|slot| slot.as_ref().map(|f| f.lock().duplicate())).collect::<Vec<_>>())
    })??;

    let mmap_regions = scheduler::with_thread(parent, |t| t.user.as_ref().map(|u| u.mmap_regions.clone()))??;

    let mut user = UserState::new(child_pml4.as_u64(), stack_bottom);
    user.exec_file = exec_file;
    user.fd_table = fd_table;
    user.spt = child_spt;
    user.parent = Some(parent);
    user.mmap_regions = mmap_regions;

    let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let stack_top = kernel_stack.as_ptr() as u64 + kernel_stack.len() as u64;
    let tf_ptr = (stack_top - scheduler::TRAP_FRAME_STACK_OFFSET) as *mut scheduler::TrapFrame;
    unsafe { core::ptr::write(tf_ptr, trap_frame) };

    let child_ctx = Context {
        rsp: stack_top - scheduler::TRAP_FRAME_STACK_OFFSET,
        rbp: 0,
        rbx: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rip: scheduler::fork_trampoline as usize as u64,
    };

    let child_tid = scheduler::spawn_with(name, priority, child_ctx, kernel_stack, Some(user)).ok()?;

    for &(vaddr, _) in &resident_pages {
        if let Some(frame) = crate::memory::paging::translate_user_page(child_pml4.as_u64(), vaddr) {
            crate::vm::frame::reassign_owner(frame, child_tid);
        }
    }

    scheduler::with_thread_mut(parent, |t| {
        if let Some(u) = t.user.as_mut() {
            if let Some(slot) = u.children.iter_mut().find(|c| c.is_none()) {
                *slot = Some(child_tid);
            }
        }
    });

    Some(child_tid)
}

/// Block until `child_tid` exits, returning its exit status. Returns `-1` if
/// `child_tid` is not (or no longer) one of the caller's children — already
/// waited for, or never a child at all.
pub fn wait(child_tid: ThreadId) -> i64 {
    let me = scheduler::current_tid();

    let is_child = scheduler::with_thread(me, |t| {
        t.user.as_ref().map(|u| u.children.iter().any(|c| *c == Some(child_tid))).unwrap_or(false)
    })
    .unwrap_or(false);
    if !is_child {
        return -1;
    }

    loop {
        let found = scheduler::with_thread_mut(me, |t| {
            let u = t.user.as_mut()?;
            let idx = u.exit_records.iter().position(|(tid, _)| *tid == child_tid)?;
            let (_, status) = u.exit_records.remove(idx);
            if let Some(slot) = u.children.iter_mut().find(|c| **c == Some(child_tid)) {
                *slot = None;
            }
            Some(status)
        })
        .flatten();

        if let Some(status) = found {
            return status;
        }

        let sema_ptr = match scheduler::with_thread(me, |t| t.user.as_ref().map(|u| &u.wait_sema as *const crate::sync::Semaphore)) {
            Some(Some(p)) => p,
            _ => return -1,
        };
        unsafe { (*sema_ptr).down() };
    }
}

/// Tear down the calling user process and never return. Frees its address
/// space, drops its file descriptors, reparents (orphans) any still-living
/// children, records its exit status for a waiting parent, and hands off to
/// `scheduler::exit_thread`.
pub fn exit(status: i64) -> ! {
    let me = scheduler::current_tid();

    let (exec_path, parent, children) = scheduler::with_thread_mut(me, |t| {
        let u = t.user.as_mut().expect("process::exit on a non-user thread");
        u.exit_status = status;
        u.fd_table.clear();
        u.spt.kill(u.page_table);
        let exec_path = u.exec_file.as_ref().map(|f| f.lock().path.clone());
        (exec_path, u.parent, u.children)
    })
    .expect("current thread missing");

    for child in children.into_iter().flatten() {
        scheduler::with_thread_mut(child, |t| {
            if let Some(u) = t.user.as_mut() {
                u.parent = None;
            }
        });
    }

    if let Some(path) = exec_path {
        let _ = crate::fs::VFS.lock().allow_write(&path);
    }

    if let Some(parent_tid) = parent {
        let recorded = scheduler::with_thread_mut(parent_tid, |t| {
            if let Some(u) = t.user.as_mut() {
                u.exit_records.push((me, status));
                true
            } else {
                false
            }
        })
        .unwrap_or(false);

        if recorded {
            if let Some(Some(sema_ptr)) =
                scheduler::with_thread(parent_tid, |t| t.user.as_ref().map(|u| &u.wait_sema as *const crate::sync::Semaphore))
            {
                unsafe { (*sema_ptr).up() };
            }
        }
    }

    crate::log_info!("process {} exited with status {}", me.0, status);
    scheduler::exit_thread()
}
