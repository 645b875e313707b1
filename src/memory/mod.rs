pub mod paging;
pub mod frame_allocator;

use frame_allocator::BumpFrameAllocator;
use spin::Mutex;
use lazy_static::lazy_static;
use x86_64::{PhysAddr, VirtAddr};

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> = Mutex::new(BumpFrameAllocator::new());
}

/// Physical memory below this line holds the BIOS data area, the boot
/// sector's trampoline code, and the kernel image's own load address; the
/// bump allocator must never hand any of it out.
const RESERVED_LOW_MEM: u64 = 0x10_0000;

pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe { multiboot2::BootInformation::load(multiboot_info_addr as *const _).expect("Failed to load Multiboot2 info!") };
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    let mut start = u64::MAX;
    let mut end = 0u64;
    for area in memory_map_tag.memory_areas() {
        start = start.min(area.start_address());
        end = end.max(area.end_address());
    }
    start = start.max(RESERVED_LOW_MEM);

    let mut allocator = FRAME_ALLOCATOR.lock();
    unsafe { allocator.init(PhysAddr::new(start), PhysAddr::new(end)) };

    crate::log_info!("Physical Memory Frame Allocator initialized using Multiboot2 Map ({:#x}..{:#x}).", start, end);

    // The bootloader identity-maps the first 1 GiB of physical memory, so
    // physical address 0 is also a valid kernel virtual address.
    let phys_mem_offset = VirtAddr::new(0);
    let mapper = unsafe { paging::init_paging(phys_mem_offset) };
    crate::log_info!("Virtual Memory Paging subsystem initialized.");

    crate::allocator::init_heap(mapper, &mut *allocator).expect("Heap initialization failed");
    crate::log_info!("Heap Allocator initialized successfully.");
}
