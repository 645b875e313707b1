//! A thin, ownership-carrying wrapper around a user process's page table
//! root. Grounded on the inline `Cr3::read`/`mov cr3` blocks scattered across
//! the teacher's `scheduler/mod.rs` (`sys_fork`, `sys_exec`, `yield_now`),
//! factored here into one type so those three call sites collapse into
//! `AddressSpace::activate`.

use x86_64::PhysAddr;

use crate::memory::paging;

pub struct AddressSpace {
    pml4: PhysAddr,
}

impl AddressSpace {
    /// Create a fresh address space sharing the kernel's half of the page
    /// table tree with the currently active one.
    pub fn new() -> Option<Self> {
        paging::create_new_page_table().map(|pml4| AddressSpace { pml4 })
    }

    /// Wrap an already-built PML4, e.g. the boot address space.
    pub fn from_raw(pml4_phys: u64) -> Self {
        AddressSpace { pml4: PhysAddr::new(pml4_phys) }
    }

    pub fn phys_addr(&self) -> u64 {
        self.pml4.as_u64()
    }

    /// Load this address space into `cr3`. Safe to call from the scheduler
    /// only with interrupts disabled.
    pub fn activate(&self) {
        unsafe {
            core::arch::asm!("mov cr3, {0}", in(reg) self.pml4.as_u64(), options(nostack, preserves_flags));
        }
    }

    pub fn map(&self, vaddr: u64, frame_phys: u64, writable: bool) -> bool {
        paging::map_user_page(self.pml4.as_u64(), vaddr, frame_phys, writable)
    }

    pub fn unmap(&self, vaddr: u64) -> Option<u64> {
        paging::unmap_user_page(self.pml4.as_u64(), vaddr)
    }

    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        paging::translate_user_page(self.pml4.as_u64(), vaddr)
    }

    pub fn is_writable(&self, vaddr: u64) -> bool {
        paging::is_writable(self.pml4.as_u64(), vaddr)
    }

    /// Deep-copy `resident_pages` from `self` into `child`, per §4.4's
    /// "fork copies the parent's resident pages" semantics.
    pub fn clone_into(&self, child: &AddressSpace, resident_pages: &[(u64, bool)]) -> bool {
        paging::deep_clone_process_memory(child.pml4.as_u64(), self.pml4.as_u64(), resident_pages)
    }

    pub fn free_pages(&self, vaddrs: &[u64]) {
        paging::free_user_memory(self.pml4.as_u64(), vaddrs);
    }
}
