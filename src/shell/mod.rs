//! Debug console: a tiny kernel-side command loop, analogous to Pintos's own
//! kernel command-line test harness rather than a general-purpose shell with
//! its own filesystem commands. `run <prog> [args...]` is the one command
//! that matters — it drives the real `process::exec` path from kernel
//! context, the same path every syscall-triggered `exec` goes through.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::println;

/// Incremented once per timer tick by `scheduler::tick`'s caller, purely for
/// `uptime`'s benefit — the scheduler's own tick count already drives
/// preemption and doesn't need a second counter, but it isn't public API.
pub static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Parse input line into command + arguments, then dispatch.
pub fn exec_command(input: &str) {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return;
    }

    let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
    let cmd = parts[0];
    let args = if parts.len() > 1 { parts[1] } else { "" };

    match cmd {
        "help" => run_help(),
        "ps" => run_ps(),
        "run" => run_run(args),
        "uptime" => run_uptime(),
        "version" => run_version(),
        _ => println!("{}: command not found", cmd),
    }
}

fn run_help() {
    println!("available commands:");
    println!("  help              show this message");
    println!("  ps                list live threads");
    println!("  run <prog> [args] load and run a user program");
    println!("  uptime            time since boot");
    println!("  version           kernel version");
}

fn run_ps() {
    let tasks = crate::scheduler::list_tasks();
    println!("  TID  STATUS    NAME");
    println!("  ---  --------  ----");
    for (tid, name, status) in &tasks {
        println!("  {:>3}  {:8}  {}", tid, status, name);
    }
}

fn run_run(args: &str) {
    if args.trim().is_empty() {
        println!("usage: run <prog> [args...]");
        return;
    }
    match crate::process::exec(args) {
        Ok(tid) => println!("started '{}' as tid {}", args, tid.0),
        Err(e) => println!("run: failed to load '{}': {:?}", args, e),
    }
}

fn run_uptime() {
    let ticks = TICKS.load(Ordering::Relaxed);
    let total_secs = ticks / 18;
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    println!("up {:02}:{:02}:{:02} ({} ticks)", hours, mins, secs, ticks);
}

fn run_version() {
    println!("{} v{} (x86_64)", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("kernel: Rust no_std + alloc, Multiboot2 boot");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_is_a_no_op() {
        exec_command("   ");
    }

    #[test]
    fn run_with_no_program_does_not_panic() {
        exec_command("run");
        exec_command("run   ");
    }
}
