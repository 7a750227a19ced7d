//! Read-only queries over HMM blocks.

use super::policy::Policy;
use super::space::{SpaceState, VaSpace};
use crate::error::{HmmError, HmmResult};
use crate::gpu::{ProcessorId, ProcessorMask};
use crate::utils::page_align_down;

/// The policy range around an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRangeInfo {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub policy: Policy,
}

/// Where one page lives and who maps it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidencyInfo {
    pub resident: ProcessorMask,
    pub mapped: ProcessorMask,
    pub cpu_populated: bool,
}

/// Policy and policy bounds at `addr`, clipped to the block (or the interval
/// a block would get) and the backing mapping.
pub fn va_range_info(space: &VaSpace, state: &SpaceState, addr: u64) -> HmmResult<VaRangeInfo> {
    let addr = page_align_down(addr);
    let vma = space
        .host
        .find_vma(addr)
        .ok_or(HmmError::InvalidAddress(addr))?;
    let (block_start, block_end) = space.range_bounds(state, addr)?;
    let lo = block_start.max(vma.start);
    let hi = block_end.min(vma.end);

    let Some(block) = space.find_block(addr) else {
        return Ok(VaRangeInfo {
            start: lo,
            end: hi,
            policy: Policy::DEFAULT,
        });
    };
    let block_state = block.lock();
    if let Some(node) = block_state.policy.find(addr) {
        return Ok(VaRangeInfo {
            start: node.start.max(lo),
            end: node.end.min(hi),
            policy: node.policy,
        });
    }
    let (start, end) = block_state
        .policy
        .find_hole(addr, lo, hi)
        .unwrap_or((lo, hi));
    Ok(VaRangeInfo {
        start,
        end,
        policy: Policy::DEFAULT,
    })
}

/// Residency of the page at `addr`. Empty when no block covers it.
pub fn residency_info(space: &VaSpace, addr: u64) -> HmmResult<ResidencyInfo> {
    let addr = page_align_down(addr);
    let Some(block) = space.find_block(addr) else {
        return Ok(ResidencyInfo::default());
    };
    let state = block.lock();
    let index = block.page_index(addr);
    let mapped = state
        .mapped
        .iter()
        .filter(|(_, mask)| mask.test(index))
        .map(|(&p, _)| p)
        .collect();
    Ok(ResidencyInfo {
        resident: state.resident_processors(index),
        mapped,
        cpu_populated: state.cpu_pages.contains_key(&index)
            && state.resident_on(ProcessorId::CPU).test(index),
    })
}
