//! The supplemental page table's per-page descriptor.
//!
//! Grounded on the tagged-enum style of `fs/fd.rs::FileType` and
//! `scheduler/task.rs::ProcessState` from the teacher: rather than the
//! uninit/anon/file-page subclass hierarchy the original kernel used, each
//! page is one `Page` carrying a `PageKind` and dispatch is a `match`, per
//! the "page descriptor subclassing" redesign note.

use alloc::sync::Arc;
use spin::Mutex;

use crate::fs::fd::File;

/// What a not-yet-resident page is backed by.
pub enum PageKind {
    /// Lazily loaded from an executable segment; becomes `Anon` once loaded
    /// if `read_bytes < PAGE_SIZE` leaves a zero tail that's then writable
    /// independent of the file.
    Uninit { file: Arc<Mutex<File>>, file_offset: u64, read_bytes: u32 },
    /// Demand-zero memory: stack pages beyond the initial page, anonymous
    /// pages materialized by `sbrk`-style growth.
    Anon,
    /// A page of an `mmap`-ed file. Flushed back to `file` on `munmap` or
    /// eviction if `writable` and dirty.
    File { file: Arc<Mutex<File>>, file_offset: u64, read_bytes: u32 },
}

pub struct Page {
    pub vaddr: u64,
    pub writable: bool,
    pub kind: PageKind,
    /// Physical address once loaded, `None` while only described.
    pub frame: Option<u64>,
    pub dirty: bool,
}

impl Page {
    pub fn uninit(vaddr: u64, writable: bool, file: Arc<Mutex<File>>, file_offset: u64, read_bytes: u32) -> Self {
        Page { vaddr, writable, kind: PageKind::Uninit { file, file_offset, read_bytes }, frame: None, dirty: false }
    }

    pub fn anon(vaddr: u64, writable: bool) -> Self {
        Page { vaddr, writable, kind: PageKind::Anon, frame: None, dirty: false }
    }

    pub fn anon_resident(vaddr: u64, writable: bool, frame: u64) -> Self {
        Page { vaddr, writable, kind: PageKind::Anon, frame: Some(frame), dirty: false }
    }

    pub fn file_backed(vaddr: u64, writable: bool, file: Arc<Mutex<File>>, file_offset: u64, read_bytes: u32) -> Self {
        Page { vaddr, writable, kind: PageKind::File { file, file_offset, read_bytes }, frame: None, dirty: false }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.kind, PageKind::File { .. })
    }
}
