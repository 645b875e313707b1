//! Boot command-line flags.
//!
//! Grounded on Pintos's own kernel command line, where `-o mlfqs` switches
//! the scheduler from round-robin to the multi-level feedback queue and the
//! remaining tokens name the first program to run. This reads the
//! Multiboot2 command-line tag instead of a `-o`-prefixed argv, since that's
//! what the bootloader hands the kernel, but keeps the same bare `mlfqs`
//! token and "everything else is the init program's argv" split. Called
//! after `memory::init()`, once the heap is up, so the leftover command
//! line can be returned as an owned `String`.

use alloc::string::String;

#[derive(Debug, Clone, Default)]
pub struct BootFlags {
    pub mlfqs: bool,
    /// Whitespace-joined tokens left after stripping `mlfqs`; the program
    /// path and argv handed to `process::create_initd`.
    pub program_cmdline: String,
}

pub fn parse(multiboot_info_addr: usize) -> BootFlags {
    let boot_info = match unsafe { multiboot2::BootInformation::load(multiboot_info_addr as *const _) } {
        Ok(info) => info,
        Err(_) => return BootFlags::default(),
    };

    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");

    let mlfqs = cmdline.split_whitespace().any(|tok| tok == "mlfqs");
    let program_cmdline = cmdline
        .split_whitespace()
        .filter(|&tok| tok != "mlfqs")
        .collect::<alloc::vec::Vec<_>>()
        .join(" ");

    BootFlags { mlfqs, program_cmdline }
}
