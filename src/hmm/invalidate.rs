//! Host invalidation handling for HMM blocks.

use super::block::{BlockId, BlockState, VaBlock};
use super::page_mask::PageMask;
use crate::gpu::{GpuMmu, Tracker};
use crate::host::{InvalidateResult, InvalidationEvent, InvalidationRange, IntervalNotifier};
use crate::utils::overlaps;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

thread_local! {
    static IGNORE: Cell<Option<BlockId>> = const { Cell::new(None) };
}

/// Marks the current thread as the cause of invalidations on one block.
///
/// Held across host calls made with the block lock held, so the callbacks
/// those calls trigger on the same thread do not try to take it again.
pub struct SelfInvalidationGuard {
    previous: Option<BlockId>,
    // Tied to the thread that set it.
    _not_send: PhantomData<*const ()>,
}

impl SelfInvalidationGuard {
    #[must_use]
    pub fn new(block: &VaBlock) -> Self {
        Self {
            previous: IGNORE.replace(Some(block.id())),
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn is_ignoring(block: BlockId) -> bool {
        IGNORE.get() == Some(block)
    }
}

impl Drop for SelfInvalidationGuard {
    fn drop(&mut self) {
        IGNORE.set(self.previous);
    }
}

/// The callback registered with the host for one block.
pub struct BlockNotifier {
    block: Weak<VaBlock>,
    mmu: Arc<dyn GpuMmu>,
}

impl BlockNotifier {
    #[must_use]
    pub fn new(block: Weak<VaBlock>, mmu: Arc<dyn GpuMmu>) -> Self {
        Self { block, mmu }
    }
}

impl IntervalNotifier for BlockNotifier {
    fn invalidate(&self, range: &InvalidationRange) -> InvalidateResult {
        let Some(block) = self.block.upgrade() else {
            return InvalidateResult::Handled;
        };

        match range.event {
            InvalidationEvent::SoftDirty | InvalidationEvent::Release => {
                return InvalidateResult::Handled;
            }
            InvalidationEvent::Migrate | InvalidationEvent::Exclusive
                if range.owner == Some(block.owner()) =>
            {
                return InvalidateResult::Handled;
            }
            _ => {}
        }

        deliver(&block, range, self.mmu.as_ref())
    }
}

fn deliver(block: &Arc<VaBlock>, range: &InvalidationRange, mmu: &dyn GpuMmu) -> InvalidateResult {
    if block.is_dead() || SelfInvalidationGuard::is_ignoring(block.id()) {
        return InvalidateResult::Handled;
    }
    if !range.blockable {
        return InvalidateResult::Again;
    }

    let successors = {
        let mut state = block.lock();
        invalidate_locked(block, &mut state, range, mmu);
        // Pages above the current end moved to blocks split off this one
        // after the host picked this registration.
        if range.end > block.end() {
            block.successors()
        } else {
            Vec::new()
        }
    };

    for successor in successors {
        if overlaps(successor.start(), successor.end(), range.start, range.end) {
            deliver(&successor, range, mmu);
        }
    }
    InvalidateResult::Handled
}

/// Apply an invalidation to a locked block.
///
/// # Panics
/// Panics if a GPU unmap fails; the GPU would keep a translation the host
/// just revoked.
pub fn invalidate_locked(
    block: &VaBlock,
    state: &mut BlockState,
    range: &InvalidationRange,
    mmu: &dyn GpuMmu,
) {
    let region = block.region_of(range.start, range.end);
    if region.is_empty() {
        return;
    }
    state.bump();

    let (start, end) = block.region_range(region);
    let pages = PageMask::from_region(region);
    let mut tracker = Tracker::new();
    for gpu in state.mapped_processors().gpus().iter() {
        if !state.mapped_on(gpu).intersects(&pages) {
            continue;
        }
        match mmu.unmap(gpu, start, end) {
            Ok(unmapped) => tracker.add(unmapped),
            Err(e) => panic!("failed to unmap {gpu} over {start:#x}-{end:#x}: {e}"),
        }
        state.clear_mapped(gpu, &pages);
    }

    if range.event.drops_host_pages() {
        state.drop_cpu_pages(&pages);
    }
    if range.event == InvalidationEvent::Unmap {
        let gpus: Vec<_> = state.gpu_chunks.keys().copied().collect();
        for gpu in gpus {
            state.drop_gpu_chunks(gpu, &pages);
        }
        state.policy.clear_range(start, end);
    }

    if let Err(e) = tracker.wait() {
        panic!("GPU unmap of {start:#x}-{end:#x} failed: {e}");
    }

    tracing::trace!(
        block = %block,
        start = format_args!("{start:#x}"),
        end = format_args!("{end:#x}"),
        event = ?range.event,
        "invalidated"
    );
}
