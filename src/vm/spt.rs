//! Supplemental page table: per-process record of every page the process
//! knows about, resident or not, keyed by page-aligned virtual address.

use alloc::collections::BTreeMap;

use super::page::{Page, PageKind};
use super::page_floor;

/// Outcome of `Spt::insert`: a page table entry already at that address is
/// left untouched rather than silently clobbered.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

pub struct Spt {
    pages: BTreeMap<u64, Page>,
}

impl Spt {
    pub fn new() -> Self {
        Spt { pages: BTreeMap::new() }
    }

    pub fn insert(&mut self, page: Page) -> InsertOutcome {
        let key = page_floor(page.vaddr);
        if self.pages.contains_key(&key) {
            return InsertOutcome::Duplicate;
        }
        self.pages.insert(key, page);
        InsertOutcome::Inserted
    }

    pub fn get(&self, vaddr: u64) -> Option<&Page> {
        self.pages.get(&page_floor(vaddr))
    }

    pub fn get_mut(&mut self, vaddr: u64) -> Option<&mut Page> {
        self.pages.get_mut(&page_floor(vaddr))
    }

    pub fn remove(&mut self, vaddr: u64) -> Option<Page> {
        self.pages.remove(&page_floor(vaddr))
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        self.pages.contains_key(&page_floor(vaddr))
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Every resident page, as `(vaddr, writable)` — the shape `fork` and
    /// process teardown need for `memory::paging::deep_clone_process_memory`
    /// and `free_user_memory`.
    pub fn resident_pages(&self) -> alloc::vec::Vec<(u64, bool)> {
        self.pages.values().filter(|p| p.is_resident()).map(|p| (p.vaddr, p.writable)).collect()
    }

    pub fn resident_vaddrs(&self) -> alloc::vec::Vec<u64> {
        self.pages.values().filter(|p| p.is_resident()).map(|p| p.vaddr).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Page> {
        self.pages.values_mut()
    }

    /// Duplicate `src` into a fresh `Spt` for a forked child. Resident pages
    /// are expected to have already been physically copied into `child_p4`
    /// by `memory::paging::deep_clone_process_memory`; this walks `src` and
    /// records each page's child-side frame, or for not-yet-loaded pages
    /// just shares the same read-only backing descriptor since their
    /// content hasn't diverged from the file. `translate` maps a resident
    /// page's vaddr to the physical frame it landed on in the child.
    pub fn copy(src: &Spt, mut translate: impl FnMut(u64) -> Option<u64>) -> Spt {
        let mut dst = Spt::new();
        for page in src.iter() {
            if page.frame.is_some() {
                let Some(child_frame) = translate(page.vaddr) else { continue };
                match &page.kind {
                    PageKind::File { file, file_offset, read_bytes } => {
                        let mut p = Page::file_backed(page.vaddr, page.writable, file.clone(), *file_offset, *read_bytes);
                        p.frame = Some(child_frame);
                        p.dirty = page.dirty;
                        dst.insert(p);
                    }
                    _ => {
                        dst.insert(Page::anon_resident(page.vaddr, page.writable, child_frame));
                    }
                }
            } else {
                match &page.kind {
                    PageKind::Uninit { file, file_offset, read_bytes } => {
                        dst.insert(Page::uninit(page.vaddr, page.writable, file.clone(), *file_offset, *read_bytes));
                    }
                    PageKind::File { file, file_offset, read_bytes } => {
                        dst.insert(Page::file_backed(page.vaddr, page.writable, file.clone(), *file_offset, *read_bytes));
                    }
                    PageKind::Anon => {}
                }
            }
        }
        dst
    }

    /// Tear down every page descriptor: unmap each resident page from
    /// `p4_phys` and return its frame to the allocator. Replaces the
    /// process exit path's direct calls into `memory::paging`/`vm::frame`
    /// with the Spt's own teardown, since it's the Spt that knows which
    /// pages it actually holds.
    pub fn kill(&mut self, p4_phys: u64) {
        for vaddr in self.resident_vaddrs() {
            if let Some(frame) = crate::memory::paging::unmap_user_page(p4_phys, vaddr) {
                crate::vm::frame::free(frame);
            }
        }
        self.pages.clear();
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_round_trips_through_page_floor() {
        let mut spt = Spt::new();
        spt.insert(Page::anon(0x1000, true));
        assert!(spt.contains(0x1000));
        assert!(spt.contains(0x1050));
        assert!(!spt.contains(0x2000));
    }

    #[test]
    fn remove_drops_the_descriptor() {
        let mut spt = Spt::new();
        spt.insert(Page::anon(0x4000, false));
        assert!(spt.remove(0x4000).is_some());
        assert!(!spt.contains(0x4000));
    }

    #[test]
    fn duplicate_va_insert_is_rejected() {
        let mut spt = Spt::new();
        assert_eq!(spt.insert(Page::anon(0x1000, true)), InsertOutcome::Inserted);
        assert_eq!(spt.insert(Page::anon(0x1000, false)), InsertOutcome::Duplicate);
        // the original descriptor survives untouched
        assert!(spt.get(0x1000).unwrap().writable);
    }

    #[test]
    fn copy_duplicates_descriptors_rather_than_aliasing_them() {
        let file = crate::fs::fd::File::new_regular("/bin/a", true, false);
        let mut parent = Spt::new();
        parent.insert(Page::uninit(0x2000, false, file, 0, 4096));

        let mut child = Spt::copy(&parent, |_| None);

        child.get_mut(0x2000).unwrap().dirty = true;
        assert!(!parent.get(0x2000).unwrap().dirty);
    }
}
