//! Kernel heap: a fixed-size region carved out of the bootloader's
//! identity-mapped first 1 GiB, backing `alloc::*` for the rest of the
//! kernel.
//!
//! Grounded on the usual `linked_list_allocator` + `#[global_allocator]`
//! idiom (Phil Opp's `blog_os`, which `memory/mod.rs`'s boot sequence and
//! comments are already written against). Because the identity mapping
//! already covers every physical frame the bump allocator can hand out,
//! there's no separate virtual mapping step here the way a non-identity-
//! mapped kernel would need: the frames reserved below are immediately
//! valid at their own physical address.

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::{FrameAllocator, PageTable, Size4KiB};

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(test)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub const HEAP_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub enum HeapInitError {
    OutOfFrames,
    NonContiguous,
}

/// Reserve `HEAP_SIZE` bytes of physical memory from `frame_allocator` and
/// hand the range to the global allocator. `_p4` is accepted (rather than
/// unused) to keep the call site symmetric with a Mapper-based `init_heap`
/// should this kernel ever stop assuming an identity-mapped heap range.
pub fn init_heap(_p4: &mut PageTable, frame_allocator: &mut impl FrameAllocator<Size4KiB>) -> Result<(), HeapInitError> {
    let frame_count = HEAP_SIZE / 4096;

    let mut heap_start = None;
    let mut prev_addr = None;
    for _ in 0..frame_count {
        let frame = frame_allocator.allocate_frame().ok_or(HeapInitError::OutOfFrames)?;
        let addr = frame.start_address().as_u64();
        if heap_start.is_none() {
            heap_start = Some(addr);
        }
        if let Some(prev) = prev_addr {
            if addr != prev + 4096 {
                return Err(HeapInitError::NonContiguous);
            }
        }
        prev_addr = Some(addr);
    }

    let heap_start = heap_start.ok_or(HeapInitError::OutOfFrames)?;
    unsafe {
        ALLOCATOR.lock().init(heap_start as *mut u8, HEAP_SIZE);
    }
    Ok(())
}
