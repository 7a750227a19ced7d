#![allow(clippy::cast_possible_truncation)]

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Size (and alignment) of the largest VA block.
pub const BLOCK_SIZE: u64 = 2 * 1024 * 1024;
pub const PAGES_PER_BLOCK: usize = (BLOCK_SIZE / PAGE_SIZE) as usize;

/// Size of the speculative window serviced around a GPU fault.
pub const PREFETCH_SIZE: u64 = 64 * 1024;

#[must_use]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[must_use]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

#[must_use]
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Last byte of the `align`-sized region containing `addr`.
#[must_use]
pub const fn align_end(addr: u64, align: u64) -> u64 {
    align_down(addr, align) + (align - 1)
}

/// Inclusive intervals `[a_start, a_end]` and `[b_start, b_end]` intersect.
#[must_use]
pub const fn overlaps(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start <= b_end && b_start <= a_end
}
