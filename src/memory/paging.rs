//! Page table manipulation for user address spaces.
//!
//! The bootloader identity-maps the first 1 GiB of physical memory (see
//! `memory/mod.rs::init`), so every physical address used here is also a
//! valid kernel virtual address — table frames can be read and written
//! through their physical address directly, with no separate offset mapping
//! to maintain.
//!
//! `create_new_page_table`/`deep_clone_process_memory`/`free_user_memory`
//! were called from the teacher's `scheduler/mod.rs::sys_fork`/`exit_current`
//! but not implemented anywhere in the retrieved pack; they're built out here
//! against that same identity-mapping assumption, generalized to work off a
//! `Spt` instead of a flat `(vaddr, size)` allocation list.

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{FrameAllocator, PageTable, PageTableFlags as Flags, PageTableIndex};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::FRAME_ALLOCATOR;

pub unsafe fn init_paging(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    active_level_4_table(physical_memory_offset)
}

unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();
    &mut *page_table_ptr
}

fn table_at(phys: u64) -> &'static mut PageTable {
    unsafe { &mut *(phys as *mut PageTable) }
}

fn alloc_table_frame() -> Option<u64> {
    let frame = FRAME_ALLOCATOR.lock().allocate_frame()?;
    let addr = frame.start_address().as_u64();
    unsafe { core::ptr::write_bytes(addr as *mut u8, 0, 4096) };
    Some(addr)
}

fn indices(vaddr: u64) -> [PageTableIndex; 4] {
    let v = VirtAddr::new(vaddr);
    [v.p4_index(), v.p3_index(), v.p2_index(), v.p1_index()]
}

fn next_table(table: &mut PageTable, index: PageTableIndex, create: bool) -> Option<u64> {
    let entry = &mut table[index];
    if entry.flags().contains(Flags::PRESENT) {
        Some(entry.addr().as_u64())
    } else if create {
        let phys = alloc_table_frame()?;
        entry.set_addr(PhysAddr::new(phys), Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESSIBLE);
        Some(phys)
    } else {
        None
    }
}

/// Walk (optionally creating intermediate tables) to the leaf PTE for
/// `vaddr` within the address space rooted at `p4_phys`.
fn walk(p4_phys: u64, vaddr: u64, create: bool) -> Option<*mut x86_64::structures::paging::page_table::PageTableEntry> {
    let [i4, i3, i2, i1] = indices(vaddr);
    let p3_phys = next_table(table_at(p4_phys), i4, create)?;
    let p2_phys = next_table(table_at(p3_phys), i3, create)?;
    let p1_phys = next_table(table_at(p2_phys), i2, create)?;
    Some(&mut table_at(p1_phys)[i1] as *mut _)
}

/// Allocate a fresh PML4 sharing the kernel's half of the address space
/// (indices 256..512) with the currently active one, so kernel code and data
/// remain mapped after switching `cr3` into a new process.
pub fn create_new_page_table() -> Option<PhysAddr> {
    let new_p4_phys = alloc_table_frame()?;
    let new_p4 = table_at(new_p4_phys);

    let (current_p4_frame, _) = Cr3::read();
    let current_p4 = table_at(current_p4_frame.start_address().as_u64());

    for i in 256..512 {
        let idx = PageTableIndex::new(i as u16);
        new_p4[idx] = current_p4[idx].clone();
    }
    Some(PhysAddr::new(new_p4_phys))
}

/// Map `vaddr` to `frame_phys` in the address space rooted at `p4_phys`,
/// creating intermediate tables as needed.
pub fn map_user_page(p4_phys: u64, vaddr: u64, frame_phys: u64, writable: bool) -> bool {
    let Some(pte_ptr) = walk(p4_phys, vaddr, true) else { return false };
    let pte = unsafe { &mut *pte_ptr };
    let mut flags = Flags::PRESENT | Flags::USER_ACCESSIBLE;
    if writable {
        flags |= Flags::WRITABLE;
    }
    pte.set_addr(PhysAddr::new(frame_phys), flags);
    x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
    true
}

/// Unmap `vaddr`, returning the physical frame it pointed to, if any.
pub fn unmap_user_page(p4_phys: u64, vaddr: u64) -> Option<u64> {
    let pte_ptr = walk(p4_phys, vaddr, false)?;
    let pte = unsafe { &mut *pte_ptr };
    if !pte.flags().contains(Flags::PRESENT) {
        return None;
    }
    let phys = pte.addr().as_u64();
    pte.set_unused();
    x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
    Some(phys)
}

pub fn translate_user_page(p4_phys: u64, vaddr: u64) -> Option<u64> {
    let pte_ptr = walk(p4_phys, vaddr, false)?;
    let pte = unsafe { &*pte_ptr };
    if pte.flags().contains(Flags::PRESENT) {
        Some(pte.addr().as_u64())
    } else {
        None
    }
}

pub fn is_writable(p4_phys: u64, vaddr: u64) -> bool {
    match walk(p4_phys, vaddr, false) {
        Some(pte_ptr) => unsafe { &*pte_ptr }.flags().contains(Flags::WRITABLE),
        None => false,
    }
}

/// Deep-copy every resident mapping described by `spt` from the parent's
/// address space into the child's, allocating independent physical frames.
/// Grounded on `sys_fork`'s (unresolved) call to `deep_clone_process_memory`.
pub fn deep_clone_process_memory(child_p4: u64, parent_p4: u64, resident_pages: &[(u64, bool)]) -> bool {
    for &(vaddr, writable) in resident_pages {
        let Some(parent_frame) = translate_user_page(parent_p4, vaddr) else { continue };
        let Some(child_frame) = alloc_user_frame() else { return false };
        unsafe {
            core::ptr::copy_nonoverlapping(parent_frame as *const u8, child_frame as *mut u8, 4096);
        }
        if !map_user_page(child_p4, vaddr, child_frame, writable) {
            return false;
        }
    }
    true
}

/// Allocate one zeroed physical frame for user data (not a page-table node).
pub fn alloc_user_frame() -> Option<u64> {
    crate::vm::frame::alloc(crate::scheduler::current_tid(), 0)
}

/// Unmap and free every resident user page tracked in `resident_pages`. Does
/// not free the page-table nodes themselves; the PML4 and its interior
/// tables are reclaimed with the frame that held `p4_phys` once the process
/// is fully torn down.
pub fn free_user_memory(p4_phys: u64, resident_pages: &[u64]) {
    for &vaddr in resident_pages {
        if let Some(frame) = unmap_user_page(p4_phys, vaddr) {
            crate::vm::frame::free(frame);
        }
    }
}
