//! System call dispatch — the int 0x80 entry point's Rust half.
//!
//! Grounded on the teacher's `dispatch(number, arg0, arg1, arg2)`, called
//! from `interrupts::usermode::syscall_handler_asm` with the same register
//! convention (RAX=number, RDI=arg0, RSI=arg1, RDX=arg2, result in RAX). The
//! teacher's body talked to a single global `scheduler::SCHEDULER.lock().current`
//! process with a hand-rolled fd table; every handler below instead goes
//! through `scheduler::with_thread*` on the calling thread's own `tid`, and
//! the sixteen calls are reworked to drive `process::*`/`vm::mmap`/`fs::VFS`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::fd::{File, FileType};
use crate::scheduler::{self, ThreadId, FD_MAX};
use crate::vm::USER_STACK_TOP;

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_MMAP: u64 = 14;
pub const SYS_MUNMAP: u64 = 15;

const ERROR: u64 = u64::MAX;

/// Central syscall dispatcher, called from the int 0x80 handler.
pub extern "C" fn dispatch(number: u64, arg0: u64, arg1: u64, arg2: u64) -> u64 {
    // The CPU masks IF on the way through an interrupt gate; re-enable it so
    // a long-running syscall (a blocking read, a page fault it triggers) can
    // still be preempted by the timer.
    x86_64::instructions::interrupts::enable();

    let tid = scheduler::current_tid();

    match number {
        SYS_HALT => {
            crate::log_info!("halt syscall: spinning the CPU down.");
            loop {
                x86_64::instructions::hlt();
            }
        }
        SYS_EXIT => crate::process::exit(arg0 as i64),
        SYS_FORK => sys_fork(arg0),
        SYS_EXEC => sys_exec(arg0),
        SYS_WAIT => crate::process::wait(ThreadId(arg0)) as u64,
        SYS_CREATE => sys_create(arg0),
        SYS_REMOVE => sys_remove(arg0),
        SYS_OPEN => sys_open(tid, arg0),
        SYS_FILESIZE => sys_filesize(tid, arg0 as usize),
        SYS_READ => sys_read(tid, arg0 as usize, arg1, arg2 as usize),
        SYS_WRITE => sys_write_call(tid, arg0 as usize, arg1, arg2 as usize),
        SYS_SEEK => sys_seek(tid, arg0 as usize, arg1),
        SYS_TELL => sys_tell(tid, arg0 as usize),
        SYS_CLOSE => sys_close(tid, arg0 as usize),
        SYS_MMAP => sys_mmap(tid, arg0, arg1 as usize, arg2 as usize),
        SYS_MUNMAP => {
            crate::vm::mmap::munmap(tid, arg0);
            0
        }
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            ERROR
        }
    }
}

/// Copy a NUL-terminated string out of user memory. The kernel never
/// switches CR3 on syscall entry, so the calling process's page table is
/// still the active one and these addresses are valid to dereference
/// directly.
unsafe fn user_cstr(ptr: u64) -> Option<String> {
    if ptr == 0 || ptr >= USER_STACK_TOP {
        return None;
    }
    let mut bytes = Vec::new();
    let base = ptr as *const u8;
    for i in 0..4096u64 {
        let b = unsafe { *base.add(i as usize) };
        if b == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(b);
    }
    None
}

unsafe fn user_slice(ptr: u64, len: usize) -> Option<&'static [u8]> {
    if ptr == 0 || len == 0 || ptr.saturating_add(len as u64) > USER_STACK_TOP {
        return None;
    }
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
}

unsafe fn user_slice_mut(ptr: u64, len: usize) -> Option<&'static mut [u8]> {
    if ptr == 0 || len == 0 || ptr.saturating_add(len as u64) > USER_STACK_TOP {
        return None;
    }
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) })
}

fn fd_file(tid: ThreadId, fd: usize) -> Option<Arc<Mutex<File>>> {
    if fd >= FD_MAX {
        return None;
    }
    scheduler::with_thread(tid, |t| t.user.as_ref().and_then(|u| u.fd_table.get(fd).cloned().flatten())).flatten()
}

fn sys_fork(name_ptr: u64) -> u64 {
    let name = unsafe { user_cstr(name_ptr) }.unwrap_or_else(|| String::from("fork"));
    match crate::process::fork(&name) {
        Some(child) => child.0,
        None => ERROR,
    }
}

fn sys_exec(cmdline_ptr: u64) -> u64 {
    let Some(cmdline) = (unsafe { user_cstr(cmdline_ptr) }) else {
        return ERROR;
    };
    match crate::process::exec(&cmdline) {
        Ok(tid) => tid.0,
        Err(e) => {
            crate::log_error!("exec failed: {:?}", e);
            ERROR
        }
    }
}

fn sys_create(path_ptr: u64) -> u64 {
    let Some(path) = (unsafe { user_cstr(path_ptr) }) else {
        return 0;
    };
    crate::fs::VFS.lock().create(&path).is_ok() as u64
}

fn sys_remove(path_ptr: u64) -> u64 {
    let Some(path) = (unsafe { user_cstr(path_ptr) }) else {
        return 0;
    };
    crate::fs::VFS.lock().unlink(&path).is_ok() as u64
}

fn sys_open(tid: ThreadId, path_ptr: u64) -> u64 {
    let Some(path) = (unsafe { user_cstr(path_ptr) }) else {
        return ERROR;
    };
    if !crate::fs::VFS.lock().exists(&path) {
        return ERROR;
    }
    let file = File::new_regular(&path, true, true);
    let slot = scheduler::with_thread_mut(tid, |t| {
        let user = t.user.as_mut()?;
        let idx = user.fd_table.iter().position(|f| f.is_none())?;
        user.fd_table[idx] = Some(file);
        Some(idx)
    })
    .flatten();
    match slot {
        Some(idx) => idx as u64,
        None => ERROR,
    }
}

fn sys_filesize(tid: ThreadId, fd: usize) -> u64 {
    let Some(file) = fd_file(tid, fd) else {
        return ERROR;
    };
    let path = file.lock().path.clone();
    match crate::fs::VFS.lock().lookup(&path) {
        Ok(inode) => inode.size as u64,
        Err(_) => ERROR,
    }
}

fn sys_read(tid: ThreadId, fd: usize, buf_ptr: u64, len: usize) -> u64 {
    let Some(dst) = (unsafe { user_slice_mut(buf_ptr, len) }) else {
        return ERROR;
    };
    let Some(file) = fd_file(tid, fd) else {
        return ERROR;
    };

    let mut file = file.lock();
    if !file.readable {
        return ERROR;
    }

    match &file.file_type {
        FileType::Console => {
            use crate::drivers::keyboard::scancodes::KeyCode;
            let mut n = 0;
            while n < dst.len() {
                match crate::drivers::keyboard::read_char() {
                    KeyCode::Char(c) => {
                        dst[n] = c as u8;
                        n += 1;
                    }
                    KeyCode::Enter => {
                        dst[n] = b'\n';
                        n += 1;
                        break;
                    }
                    _ => {}
                }
            }
            n as u64
        }
        FileType::Regular => {
            let path = file.path.clone();
            let offset = file.offset as usize;
            match crate::fs::VFS.lock().read_file(&path, offset, dst) {
                Ok(n) => {
                    file.offset += n as u64;
                    n as u64
                }
                Err(_) => ERROR,
            }
        }
        FileType::PipeRead(inner) => {
            let inner = inner.clone();
            loop {
                let mut pipe = inner.lock();
                if !pipe.is_empty() {
                    return pipe.read(dst) as u64;
                }
                if pipe.active_writers() == 0 {
                    return 0;
                }
                drop(pipe);
                scheduler::yield_now();
            }
        }
        FileType::PipeWrite(_) | FileType::Directory => ERROR,
    }
}

fn sys_write_call(tid: ThreadId, fd: usize, buf_ptr: u64, len: usize) -> u64 {
    let Some(src) = (unsafe { user_slice(buf_ptr, len) }) else {
        return ERROR;
    };
    let Some(file) = fd_file(tid, fd) else {
        return ERROR;
    };

    let mut file = file.lock();
    if !file.writable {
        return ERROR;
    }

    match &file.file_type {
        FileType::Console => {
            if let Ok(s) = core::str::from_utf8(src) {
                print_no_newline(s);
            }
            src.len() as u64
        }
        FileType::Regular => {
            let path = file.path.clone();
            let offset = file.offset as usize;
            match crate::fs::VFS.lock().write_file(&path, offset, src) {
                Ok(n) => {
                    file.offset += n as u64;
                    n as u64
                }
                Err(_) => ERROR,
            }
        }
        FileType::PipeWrite(inner) => {
            let inner = inner.clone();
            loop {
                let mut pipe = inner.lock();
                if !pipe.is_full() {
                    return pipe.write(src) as u64;
                }
                if pipe.active_readers() == 0 {
                    return ERROR;
                }
                drop(pipe);
                scheduler::yield_now();
            }
        }
        FileType::PipeRead(_) | FileType::Directory => ERROR,
    }
}

fn sys_seek(tid: ThreadId, fd: usize, pos: u64) -> u64 {
    let Some(file) = fd_file(tid, fd) else {
        return ERROR;
    };
    file.lock().seek(pos);
    0
}

fn sys_tell(tid: ThreadId, fd: usize) -> u64 {
    let Some(file) = fd_file(tid, fd) else {
        return ERROR;
    };
    let tell = file.lock().tell();
    tell
}

fn sys_close(tid: ThreadId, fd: usize) -> u64 {
    if fd >= FD_MAX {
        return ERROR;
    }
    scheduler::with_thread_mut(tid, |t| {
        if let Some(u) = t.user.as_mut() {
            u.fd_table[fd] = None;
        }
    });
    0
}

fn sys_mmap(tid: ThreadId, addr: u64, length: usize, fd: usize) -> u64 {
    let Some(file) = fd_file(tid, fd) else {
        return ERROR;
    };
    if matches!(file.lock().file_type, FileType::Console | FileType::PipeRead(_) | FileType::PipeWrite(_)) {
        return ERROR;
    }
    match crate::vm::mmap::mmap(tid, addr, length, file) {
        Ok(base) => base,
        Err(_) => ERROR,
    }
}

/// Print without a trailing newline, mirroring to both the VGA console and
/// the serial log the way `println!`/`log_info!` already do.
fn print_no_newline(s: &str) {
    use core::fmt::Write;
    let _ = crate::vga::WRITER.lock().write_str(s);
    let _ = crate::serial::SERIAL1.lock().write_str(s);
}

pub fn init() {
    crate::log_info!("Syscall interface initialized.");
}
