//! Memory-mapped files, layered on the supplemental page table's `File`
//! page kind. Grounded on `fs/vfs.rs::read_file`/`write_file` for the page
//! in/flush-out data path.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::fd::File;
use crate::scheduler::{self, ThreadId};
use crate::vm::page::{Page, PageKind};
use crate::vm::{page_floor, PAGE_SIZE, USER_STACK_TOP};

#[derive(Debug)]
pub enum MmapError {
    ZeroLength,
    NotMappable,
    Overlaps,
    OutOfAddressSpace,
}

/// Map `file`'s contents (from offset 0) into the caller's address space
/// starting at `addr`, spanning `enough pages for `length` bytes. Returns the
/// mapping's base address.
pub fn mmap(tid: ThreadId, addr: u64, length: usize, file: Arc<Mutex<File>>) -> Result<u64, MmapError> {
    if length == 0 {
        return Err(MmapError::ZeroLength);
    }
    if addr == 0 || addr % PAGE_SIZE != 0 || addr >= USER_STACK_TOP {
        return Err(MmapError::OutOfAddressSpace);
    }

    let page_count = (length as u64).div_ceil(PAGE_SIZE);

    let result = scheduler::with_thread_mut(tid, |t| {
        let user = t.user.as_mut()?;
        for i in 0..page_count {
            if user.spt.contains(addr + i * PAGE_SIZE) {
                return Some(Err(MmapError::Overlaps));
            }
        }
        for i in 0..page_count {
            let vaddr = addr + i * PAGE_SIZE;
            let file_offset = i * PAGE_SIZE;
            let read_bytes = ((length as u64).saturating_sub(file_offset)).min(PAGE_SIZE) as u32;
            user.spt.insert(Page::file_backed(vaddr, true, file.clone(), file_offset, read_bytes));
        }
        user.mmap_regions.push(addr);
        Some(Ok(addr))
    });

    match result {
        Some(Some(r)) => r,
        _ => Err(MmapError::NotMappable),
    }
}

/// Unmap the region starting at `addr`, writing back any dirty resident
/// pages to their backing file before discarding the mapping.
pub fn munmap(tid: ThreadId, addr: u64) -> bool {
    let removed = scheduler::with_thread_mut(tid, |t| {
        let user = t.user.as_mut()?;
        if !user.mmap_regions.contains(&addr) {
            return Some(false);
        }
        user.mmap_regions.retain(|&a| a != addr);

        let mut vaddr = addr;
        let mut to_free = Vec::new();
        loop {
            let page = match user.spt.get(vaddr) {
                Some(p) if matches!(p.kind, PageKind::File { .. }) && page_floor(p.vaddr) == vaddr => p,
                _ => break,
            };
            if page.dirty {
                if let (Some(frame), PageKind::File { file, file_offset, .. }) = (page.frame, &page.kind) {
                    let path = file.lock().path.clone();
                    let data = unsafe { core::slice::from_raw_parts(frame as *const u8, PAGE_SIZE as usize) };
                    let _ = crate::fs::VFS.lock().write_file(&path, *file_offset as usize, data);
                }
            }
            if let Some(frame) = page.frame {
                to_free.push(frame);
            }
            user.spt.remove(vaddr);
            crate::memory::paging::unmap_user_page(user.page_table, vaddr);
            vaddr += PAGE_SIZE;
        }
        for frame in to_free {
            crate::vm::frame::free(frame);
        }
        Some(true)
    });

    matches!(removed, Some(Some(true)))
}
