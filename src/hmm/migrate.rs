//! Moving block pages between host memory and GPU memory.
//!
//! A migration runs in three phases against the host migration primitive:
//! setup isolates and locks the source pages, the destination pages are
//! allocated and the copy submitted, then the host commits and the block
//! bookkeeping follows whatever actually moved. The block lock is dropped
//! around allocation; the change counter decides whether the result still
//! applies.

use super::block::{BlockState, VaBlock};
use super::invalidate::SelfInvalidationGuard;
use super::page_mask::{PageMask, PageRegion};
use super::space::{SpaceState, VaSpace};
use crate::error::{HmmError, HmmResult};
use crate::gpu::{CopyOp, ProcessorId, Prot, Tracker};
use crate::host::{FaultedPage, MigrateSelect, MigrateVma, Vma};
use crate::page::{ChunkOwner, GpuChunk, PhysPage};
use crate::utils::is_page_aligned;
use parking_lot::MutexGuard;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateCause {
    Fault,
    Replay,
    Eviction,
    Api,
    Prefetch,
    AccessCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateMode {
    /// Only move the data.
    ResidencyOnly,
    /// Also map the destination GPU.
    ResidencyAndMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStatus {
    Migrated(PageMask),
    NothingToDo,
    /// The host already had the pages on the destination's physical pages.
    MismatchedTarget,
}

/// What to migrate, and where.
#[derive(Debug, Clone, Copy)]
pub struct MigrateRequest {
    pub pages: PageMask,
    /// Subset of pages whose failures are silent.
    pub speculative: PageMask,
    pub dest: ProcessorId,
    pub dest_nid: Option<i32>,
    pub cause: MigrateCause,
    pub mode: MigrateMode,
    /// Protection for destination mappings in `ResidencyAndMap` mode.
    pub prot: Prot,
}

impl MigrateRequest {
    #[must_use]
    pub const fn new(pages: PageMask, dest: ProcessorId, cause: MigrateCause) -> Self {
        Self {
            pages,
            speculative: PageMask::new(),
            dest,
            dest_nid: None,
            cause,
            mode: MigrateMode::ResidencyOnly,
            prot: Prot::ReadWrite,
        }
    }

    #[must_use]
    pub const fn speculative(mut self, pages: PageMask) -> Self {
        self.speculative = pages;
        self
    }

    #[must_use]
    pub const fn mode(mut self, mode: MigrateMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn prot(mut self, prot: Prot) -> Self {
        self.prot = prot;
        self
    }

    #[must_use]
    pub const fn dest_nid(mut self, nid: Option<i32>) -> Self {
        self.dest_nid = nid;
        self
    }
}

/// Intent and outcome of one migration attempt.
#[derive(Debug, Clone, Default)]
pub struct MigrationWorkingSet {
    /// Pages asked for and not already at the destination.
    pub requested: PageMask,
    /// Pages the host isolated.
    pub isolated: PageMask,
    /// Isolated pages already backed by the destination's physical page.
    pub same_page: PageMask,
    /// Pages the host committed.
    pub migrated: PageMask,
    /// Non-speculative pages that did not end up at the destination.
    pub unresolved: PageMask,
}

// ===============================================================================================
// Policy hint
// ===============================================================================================

thread_local! {
    static POLICY_HINT: Cell<Option<(u64, u64)>> = const { Cell::new(None) };
}

/// Restricts the regions computed on this thread to `[start, end]`.
pub struct PolicyHint {
    previous: Option<(u64, u64)>,
    _not_send: PhantomData<*const ()>,
}

impl PolicyHint {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            previous: POLICY_HINT.replace(Some((start, end))),
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn current() -> Option<(u64, u64)> {
        POLICY_HINT.get()
    }
}

impl Drop for PolicyHint {
    fn drop(&mut self) {
        POLICY_HINT.set(self.previous);
    }
}

/// The range around `addr` sharing one policy: block, mapping, policy node
/// (or hole) and the thread's hint intersected.
pub(crate) fn policy_region(block: &VaBlock, state: &BlockState, addr: u64, vma: &Vma) -> (u64, u64) {
    let mut lo = block.start().max(vma.start);
    let mut hi = block.end().min(vma.end);
    if let Some(node) = state.policy.find(addr) {
        lo = lo.max(node.start);
        hi = hi.min(node.end);
    } else if let Some((start, end)) = state.policy.find_hole(addr, lo, hi) {
        lo = start;
        hi = end;
    }
    if let Some((start, end)) = PolicyHint::current() {
        lo = lo.max(start);
        hi = hi.min(end);
    }
    (lo.min(addr), hi.max(addr))
}

// ===============================================================================================
// Block migration
// ===============================================================================================

fn single(index: usize) -> PageMask {
    let mut mask = PageMask::new();
    mask.set(index);
    mask
}

fn alloc_dest(space: &VaSpace, request: &MigrateRequest) -> HmmResult<PhysPage> {
    if request.dest.is_cpu() {
        space.host.alloc_page(request.dest_nid).map(PhysPage::Host)
    } else {
        space.gpu_memory.alloc_chunk(request.dest).map(PhysPage::Gpu)
    }
}

fn abort(space: &VaSpace, block: &VaBlock, mut migrate: MigrateVma) {
    for entry in &mut migrate.entries {
        entry.dst = None;
    }
    let _ignore = SelfInvalidationGuard::new(block);
    space.host.migrate_finalize(migrate);
}

fn record_chunk(block: &Arc<VaBlock>, state: &mut BlockState, index: usize, chunk: &Arc<GpuChunk>) {
    chunk.set_owner(Some(ChunkOwner {
        block: Arc::downgrade(block),
        page_index: index,
    }));
    state
        .gpu_chunks
        .entry(chunk.gpu())
        .or_default()
        .insert(index, chunk.clone());
    state.set_resident(chunk.gpu(), &single(index));
}

/// Record what the host reported for pages `first..` of `block`. Returns the
/// pages now known to be in host memory.
pub(crate) fn record_faulted(
    block: &Arc<VaBlock>,
    state: &mut BlockState,
    first: usize,
    faulted: &[FaultedPage],
    pages: &PageMask,
) -> PageMask {
    let mut populated = PageMask::new();
    for (offset, page) in faulted.iter().enumerate() {
        let index = first + offset;
        if !pages.test(index) {
            continue;
        }
        match page {
            FaultedPage::Host(frame) => {
                state.cpu_pages.insert(index, frame.clone());
                state.set_resident(ProcessorId::CPU, &single(index));
                populated.set(index);
            }
            FaultedPage::DevicePrivate(chunk) => {
                let known = state
                    .gpu_chunk(chunk.gpu(), index)
                    .is_some_and(|c| Arc::ptr_eq(c, chunk));
                if !known {
                    state.drop_cpu_pages(&single(index));
                    record_chunk(block, state, index, chunk);
                }
            }
            FaultedPage::Error(e) => {
                tracing::trace!(block = %block, index, error = %e, "host could not supply page");
            }
        }
    }
    populated
}

/// Remove every GPU mapping of `pages`.
///
/// # Panics
/// Panics if a GPU unmap fails.
pub(crate) fn unmap_pages(space: &VaSpace, block: &VaBlock, state: &mut BlockState, pages: &PageMask) {
    let mut tracker = Tracker::new();
    for gpu in state.mapped_processors().gpus().iter() {
        let hit = state.mapped_on(gpu) & *pages;
        for run in hit.runs() {
            let (start, end) = block.region_range(run);
            match space.mmu.unmap(gpu, start, end) {
                Ok(unmapped) => tracker.add(unmapped),
                Err(e) => panic!("failed to unmap {gpu} over {start:#x}-{end:#x}: {e}"),
            }
        }
        state.clear_mapped(gpu, &hit);
    }
    if let Err(e) = tracker.wait() {
        panic!("GPU unmap in {block} failed: {e}");
    }
}

/// Map `pages` on `processor`, wherever they currently live.
pub(crate) fn map_pages(
    space: &VaSpace,
    block: &VaBlock,
    state: &mut BlockState,
    processor: ProcessorId,
    pages: &PageMask,
    prot: Prot,
) -> HmmResult<()> {
    let mut mapped = PageMask::new();
    for index in pages.iter() {
        let Some(page) = state.phys_page(index) else {
            continue;
        };
        space.mmu.map(processor, block.page_addr(index), page, prot)?;
        mapped.set(index);
    }
    state.set_mapped(processor, &mapped);
    Ok(())
}

/// Map `pages` on the GPUs their policy lists as accessed-by, except `skip`.
pub(crate) fn map_accessed_by(
    space: &VaSpace,
    block: &VaBlock,
    state: &mut BlockState,
    pages: &PageMask,
    skip: Option<ProcessorId>,
) -> HmmResult<()> {
    for index in pages.iter() {
        let addr = block.page_addr(index);
        let gpus = state.policy.policy_at(addr).accessed_by.gpus();
        if gpus.is_empty() {
            continue;
        }
        let prot = match space.host.find_vma(addr) {
            Some(vma) if vma.writable => Prot::ReadWrite,
            Some(_) => Prot::ReadOnly,
            None => continue,
        };
        for gpu in gpus.iter().filter(|&gpu| Some(gpu) != skip) {
            map_pages(space, block, state, gpu, &single(index), prot)?;
        }
    }
    Ok(())
}

/// Fault the requested pages into host memory after nothing could be isolated.
fn populate_host(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    state: &mut MutexGuard<'_, BlockState>,
    set: &MigrationWorkingSet,
    request: &MigrateRequest,
) -> HmmResult<MigrateStatus> {
    let token = state.snapshot();
    let mut populated = PageMask::new();
    for run in set.requested.runs() {
        let (start, end) = block.region_range(run);
        let faulted = MutexGuard::unlocked(state, || {
            space.host.range_fault(start, end, false, block.owner())
        });
        state.validate(token)?;
        populated |= record_faulted(block, state, run.first, &faulted?, &set.requested);
    }

    if request.dest.is_cpu() || populated.is_empty() {
        Ok(MigrateStatus::NothingToDo)
    } else {
        // The pages can be isolated now.
        Err(HmmError::MoreProcessingRequired)
    }
}

/// Migrate pages of a locked block.
///
/// The caller holds the space lock and the block's migration lock. The block
/// lock is dropped and retaken around allocation; `MoreProcessingRequired`
/// means the caller should start over.
pub fn migrate_block(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    state: &mut MutexGuard<'_, BlockState>,
    request: &MigrateRequest,
) -> HmmResult<MigrateStatus> {
    let dest = request.dest;
    let valid = PageMask::from_region(block.full_region());
    let wanted = (request.pages | request.speculative) & valid;
    let in_place = state.resident_on(dest) & wanted;

    let mut set = MigrationWorkingSet {
        requested: wanted.andnot(&in_place),
        ..MigrationWorkingSet::default()
    };
    let map_dest = request.mode == MigrateMode::ResidencyAndMap && !dest.is_cpu();

    let (Some(first), Some(last)) = (set.requested.first(), set.requested.iter().last()) else {
        if map_dest {
            map_pages(space, block, state, dest, &in_place, request.prot)?;
        }
        return Ok(MigrateStatus::NothingToDo);
    };
    let region = PageRegion::new(first, last + 1);
    let (start, end) = block.region_range(region);
    let token = state.snapshot();

    // Setup
    let select = if dest.is_cpu() {
        MigrateSelect::TO_HOST
    } else {
        MigrateSelect::TO_DEVICE
    };
    let mut migrate = {
        let _ignore = SelfInvalidationGuard::new(block);
        space.host.migrate_setup(start, end, select, block.owner())?
    };
    for (offset, entry) in migrate.entries.iter().enumerate() {
        let index = region.first + offset;
        if !entry.migrate || !set.requested.test(index) {
            continue;
        }
        set.isolated.set(index);
        if entry.src.as_ref().is_some_and(|src| src.processor() == dest) {
            set.same_page.set(index);
        }
    }

    if set.isolated.is_empty() {
        abort(space, block, migrate);
        return populate_host(space, block, state, &set, request);
    }

    let moving = set.isolated.andnot(&set.same_page);
    unmap_pages(space, block, state, &moving);

    // Allocate and copy
    let allocated: Vec<(usize, HmmResult<PhysPage>)> = MutexGuard::unlocked(state, || {
        moving
            .iter()
            .map(|index| (index, alloc_dest(space, request)))
            .collect()
    });
    if let Err(stale) = state.validate(token) {
        abort(space, block, migrate);
        return Err(stale.into());
    }
    for (index, page) in allocated {
        match page {
            Ok(page) => migrate.entries[index - region.first].dst = Some(page),
            Err(e) if request.speculative.test(index) => {
                tracing::trace!(block = %block, index, error = %e, "dropping speculative page");
            }
            Err(e) => {
                abort(space, block, migrate);
                return Err(e);
            }
        }
    }

    let ops: Vec<CopyOp> = migrate
        .entries
        .iter()
        .filter_map(|entry| {
            let dst = entry.dst.clone()?;
            Some(match entry.src.clone() {
                Some(src) => CopyOp::Copy { src, dst },
                None => CopyOp::Zero { dst },
            })
        })
        .collect();
    let copying = match space.copy.submit(ops) {
        Ok(tracker) => tracker,
        Err(e) => {
            abort(space, block, migrate);
            return Err(e);
        }
    };

    // Finalize
    {
        let _ignore = SelfInvalidationGuard::new(block);
        space.host.migrate_pages(&mut migrate);
    }
    if let Err(e) = copying.wait() {
        panic!("copy engine failed while migrating {block}: {e}");
    }

    for (offset, entry) in migrate.entries.iter().enumerate() {
        let index = region.first + offset;
        if !set.requested.test(index) || set.same_page.test(index) {
            continue;
        }
        if entry.migrate && entry.dst.is_some() {
            set.migrated.set(index);
        } else if !request.speculative.test(index) {
            set.unresolved.set(index);
        }
    }

    let migrated = set.migrated;
    state.drop_cpu_pages(&migrated);
    let gpus: Vec<_> = state.resident.keys().copied().filter(|p| !p.is_cpu()).collect();
    for gpu in gpus {
        state.drop_gpu_chunks(gpu, &migrated);
    }
    for index in migrated.iter() {
        match &migrate.entries[index - region.first].dst {
            Some(PhysPage::Host(frame)) => {
                state.cpu_pages.insert(index, frame.clone());
                state.set_resident(ProcessorId::CPU, &single(index));
            }
            Some(PhysPage::Gpu(chunk)) => record_chunk(block, state, index, chunk),
            None => {}
        }
    }
    for index in set.same_page.iter() {
        if let Some(PhysPage::Gpu(chunk)) = &migrate.entries[index - region.first].src {
            state.drop_cpu_pages(&single(index));
            record_chunk(block, state, index, chunk);
        }
    }

    {
        let _ignore = SelfInvalidationGuard::new(block);
        space.host.migrate_finalize(migrate);
    }

    if map_dest {
        let to_map = set.migrated | set.same_page | in_place;
        map_pages(space, block, state, dest, &to_map, request.prot)?;
    }
    map_accessed_by(
        space,
        block,
        state,
        &set.isolated,
        map_dest.then_some(dest),
    )?;

    tracing::trace!(
        block = %block,
        %dest,
        cause = ?request.cause,
        migrated = ?set.migrated,
        unresolved = ?set.unresolved,
        "migrated block pages"
    );

    if !set.unresolved.is_empty() {
        Err(HmmError::MoreProcessingRequired)
    } else if !set.migrated.is_empty() {
        Ok(MigrateStatus::Migrated(set.migrated))
    } else if !set.same_page.is_empty() {
        Ok(MigrateStatus::MismatchedTarget)
    } else {
        Ok(MigrateStatus::NothingToDo)
    }
}

// ===============================================================================================
// Entry points
// ===============================================================================================

/// Run `attempt` until it stops asking for a retry, at most
/// `max_fault_retries` extra times.
pub(crate) fn with_retries<T>(
    space: &VaSpace,
    mut attempt: impl FnMut() -> HmmResult<T>,
) -> HmmResult<T> {
    let mut retries = 0;
    loop {
        match attempt() {
            Err(e) if e.is_retry() && retries < space.config().max_fault_retries => {
                retries += 1;
            }
            result => return result,
        }
    }
}

/// Move pages of `block` resident on `gpu` (or on any GPU) back to host memory.
pub fn evict_block_pages(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    pages: &PageMask,
    gpu: Option<ProcessorId>,
) -> HmmResult<MigrateStatus> {
    let _migrating = block.migrate_begin_wait();
    let mut state = block.lock();
    let resident = gpu.map_or_else(|| state.gpu_resident(), |gpu| state.resident_on(gpu));
    let pages = *pages & resident;
    if pages.is_empty() {
        return Ok(MigrateStatus::NothingToDo);
    }
    let request = MigrateRequest::new(pages, ProcessorId::CPU, MigrateCause::Eviction);
    migrate_block(space, block, &mut state, &request)
}

/// Evict a whole block off `gpu` (or every GPU). With `unbounded`, retries
/// until the pages are gone.
pub(crate) fn evict_block(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    gpu: Option<ProcessorId>,
    unbounded: bool,
) -> HmmResult<()> {
    let all = PageMask::from_region(block.full_region());
    let mut attempts = 0u32;
    loop {
        match evict_block_pages(space, block, &all, gpu) {
            Ok(_) => {
                let state = block.lock();
                let left = gpu.map_or_else(|| state.gpu_resident(), |gpu| state.resident_on(gpu));
                if left.is_empty() {
                    return Ok(());
                }
            }
            Err(e) if e.is_retry() => {}
            Err(e) => return Err(e),
        }
        attempts += 1;
        if !unbounded && attempts > space.config().max_fault_retries {
            return Err(HmmError::MoreProcessingRequired);
        }
    }
}

/// Evict one GPU chunk on behalf of the GPU memory manager, following its
/// back-pointer to the block holding it.
///
/// Returns `Busy` instead of waiting when the block is already migrating.
pub fn evict_chunk(chunk: &Arc<GpuChunk>) -> HmmResult<()> {
    let mut attempts = 0u32;
    loop {
        let Some(owner) = chunk.owner() else {
            return Ok(());
        };
        let Some(block) = owner.block.upgrade() else {
            return Ok(());
        };
        let space = block.space().ok_or(HmmError::NotFound)?;
        let max_retries = space.config().max_fault_retries;

        let result = {
            let _locked = space.read();
            let Some(_migrating) = block.migrate_begin() else {
                return Err(HmmError::Busy);
            };
            let mut state = block.lock();
            let current = state
                .gpu_chunk(chunk.gpu(), owner.page_index)
                .is_some_and(|c| Arc::ptr_eq(c, chunk));
            if current {
                let request = MigrateRequest::new(
                    single(owner.page_index),
                    ProcessorId::CPU,
                    MigrateCause::Eviction,
                );
                migrate_block(&space, &block, &mut state, &request).map(|_| ())
            } else {
                // Moved by a split since the owner was read.
                Err(HmmError::MoreProcessingRequired)
            }
        };

        match result {
            Err(e) if e.is_retry() && attempts < max_retries => attempts += 1,
            result => return result,
        }
    }
}

/// Migrate `[base, base + len)` to `dest`, one policy region at a time.
pub fn migrate_range(
    space: &VaSpace,
    state: &SpaceState,
    base: u64,
    len: u64,
    dest: ProcessorId,
    mode: MigrateMode,
) -> HmmResult<()> {
    if len == 0 || !is_page_aligned(base) || !is_page_aligned(len) {
        return Err(HmmError::InvalidArgument(format!(
            "unaligned range {base:#x}+{len:#x}"
        )));
    }
    if !state.is_registered(dest) {
        return Err(HmmError::InvalidDevice(dest));
    }

    let end = base.checked_add(len - 1).ok_or_else(|| {
        HmmError::InvalidArgument(format!("range {base:#x}+{len:#x} overflows"))
    })?;
    let _hint = PolicyHint::new(base, end);
    let mut addr = base;
    loop {
        let vma = space
            .host
            .find_vma(addr)
            .ok_or(HmmError::InvalidAddress(addr))?;
        let block = space.find_or_create_block(state, addr, false)?;
        let (_, hi) = policy_region(&block, &block.lock(), addr, &vma);

        if vma.is_migratable() {
            let prot = if vma.writable {
                Prot::ReadWrite
            } else {
                Prot::ReadOnly
            };
            let request = MigrateRequest::new(
                PageMask::from_region(block.region_of(addr, hi)),
                dest,
                MigrateCause::Api,
            )
            .mode(mode)
            .prot(prot);
            with_retries(space, || {
                let _migrating = block.migrate_begin_wait();
                let mut block_state = block.lock();
                migrate_block(space, &block, &mut block_state, &request)
            })?;
        } else if !dest.is_cpu() {
            return Err(HmmError::NotSupported("migrating a shared or special mapping"));
        }

        if hi >= end {
            return Ok(());
        }
        addr = hi + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::fault::AccessType;
    use crate::hmm::policy::ReadDuplication;
    use crate::hmm::space::VaSpaceLocked;
    use crate::host::VmaKind;
    use crate::host::sim::PteKind;
    use crate::test_support::{GPU0, GPU1, Harness};
    use crate::utils::{BLOCK_SIZE, PAGE_SIZE};

    const BASE: u64 = 0x2_0000_0000;

    fn gpu_chunk_at(h: &Harness, gpu: ProcessorId, addr: u64) -> Arc<GpuChunk> {
        match h.mmu.translate(gpu, addr).map(|m| m.page) {
            Some(PhysPage::Gpu(chunk)) => chunk,
            other => panic!("expected device memory at {addr:#x}, found {other:?}"),
        }
    }

    #[test]
    fn policy_hint_nests() {
        assert_eq!(PolicyHint::current(), None);
        {
            let _outer = PolicyHint::new(0x1000, 0x8fff);
            {
                let _inner = PolicyHint::new(0x2000, 0x2fff);
                assert_eq!(PolicyHint::current(), Some((0x2000, 0x2fff)));
            }
            assert_eq!(PolicyHint::current(), Some((0x1000, 0x8fff)));
        }
        assert_eq!(PolicyHint::current(), None);
    }

    #[test]
    fn migrate_range_round_trip_keeps_contents() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE + PAGE_SIZE, b"second page").unwrap();

        let space = h.space.read();
        space
            .migrate_range(BASE, 4 * PAGE_SIZE, GPU0, MigrateMode::ResidencyAndMap)
            .unwrap();
        let block = space.find(BASE).unwrap();
        assert_eq!(block.lock().resident_on(GPU0).iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(block.lock().resident_on(ProcessorId::CPU).is_empty());
        assert_eq!(h.mmu.mapped_pages(GPU0), 4);
        assert_eq!(h.host.pte_kind(BASE + 4 * PAGE_SIZE), PteKind::None);
        let chunk = gpu_chunk_at(&h, GPU0, BASE + PAGE_SIZE);
        assert_eq!(&chunk.data()[..11], b"second page");
        drop(chunk);

        space
            .migrate_range(BASE, 4 * PAGE_SIZE, ProcessorId::CPU, MigrateMode::ResidencyOnly)
            .unwrap();
        assert_eq!(h.host.read(BASE + PAGE_SIZE, 11).unwrap(), b"second page");
        assert_eq!(h.host.read(BASE, 4).unwrap(), [0u8; 4]);
        assert_eq!(h.mmu.mapped_pages(GPU0), 0);
        assert_eq!(block.lock().resident_on(ProcessorId::CPU).count(), 4);
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);

        // Already there.
        space
            .migrate_range(BASE, 4 * PAGE_SIZE, ProcessorId::CPU, MigrateMode::ResidencyOnly)
            .unwrap();
    }

    #[test]
    fn migrate_range_crosses_blocks_and_policy_nodes() {
        let h = Harness::new();
        h.mmap(BASE, 2 * BLOCK_SIZE);
        h.space
            .write()
            .set_read_duplication(BASE + BLOCK_SIZE - 0x2000, 0x1000, ReadDuplication::Enabled)
            .unwrap();

        let space = h.space.read();
        space
            .migrate_range(BASE + BLOCK_SIZE - 0x4000, 0x8000, GPU1, MigrateMode::ResidencyOnly)
            .unwrap();
        assert_eq!(h.space.block_count(), 2);
        for offset in (0..0x8000).step_by(PAGE_SIZE as usize) {
            let addr = BASE + BLOCK_SIZE - 0x4000 + offset;
            assert_eq!(h.host.pte_kind(addr), PteKind::DevicePrivate(GPU1));
        }
        assert_eq!(h.host.pte_kind(BASE + BLOCK_SIZE + 0x4000), PteKind::None);
        assert_eq!(h.mmu.mapped_pages(GPU1), 0);
    }

    #[test]
    fn migrate_range_validates_input() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host
            .mmap(BASE + BLOCK_SIZE, BLOCK_SIZE, true, true, VmaKind::Shared)
            .unwrap();
        let space = h.space.read();
        let mode = MigrateMode::ResidencyOnly;

        assert!(matches!(
            space.migrate_range(BASE + 1, PAGE_SIZE, GPU0, mode),
            Err(HmmError::InvalidArgument(_))
        ));
        assert_eq!(
            space.migrate_range(BASE, PAGE_SIZE, ProcessorId::gpu(5), mode),
            Err(HmmError::InvalidDevice(ProcessorId::gpu(5)))
        );
        assert!(matches!(
            space.migrate_range(BASE + BLOCK_SIZE - PAGE_SIZE, 2 * PAGE_SIZE, GPU0, mode),
            Err(HmmError::NotSupported(_))
        ));
        // Shared memory already lives in host memory.
        space
            .migrate_range(BASE + BLOCK_SIZE - PAGE_SIZE, 2 * PAGE_SIZE, ProcessorId::CPU, mode)
            .unwrap();
        assert_eq!(
            space.migrate_range(BASE + 2 * BLOCK_SIZE, PAGE_SIZE, GPU0, mode),
            Err(HmmError::InvalidAddress(BASE + 2 * BLOCK_SIZE))
        );
        assert!(matches!(
            space.migrate_range(u64::MAX - 0xfff, 2 * PAGE_SIZE, GPU0, mode),
            Err(HmmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn evict_chunk_follows_back_pointer_across_split() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        let addr = BASE + 0x10_0000;
        h.host.write(addr, b"evict me").unwrap();
        h.space
            .read()
            .handle_gpu_fault(addr, GPU0, AccessType::Write)
            .unwrap();
        let chunk = gpu_chunk_at(&h, GPU0, addr);

        let space = h.space.write();
        let block = space.find(BASE).unwrap();
        let upper = space.split_block(&block, addr - 1).unwrap();
        drop(space);
        let owner = chunk.owner().unwrap();
        assert!(Arc::ptr_eq(&owner.block.upgrade().unwrap(), &upper));
        assert_eq!(owner.page_index, 0);

        evict_chunk(&chunk).unwrap();
        assert!(chunk.owner().is_none());
        assert_eq!(h.host.pte_kind(addr), PteKind::Present);
        assert_eq!(h.host.read(addr, 8).unwrap(), b"evict me");
        assert!(upper.lock().gpu_resident().is_empty());
        assert!(h.mmu.translate(GPU0, addr).is_none());

        // Nothing left to do for an unowned chunk.
        evict_chunk(&chunk).unwrap();
    }

    #[test]
    fn evict_chunk_does_not_wait_for_a_running_migration() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.space
            .read()
            .handle_gpu_fault(BASE, GPU0, AccessType::Write)
            .unwrap();
        let chunk = gpu_chunk_at(&h, GPU0, BASE);
        let block = h.space.read().find(BASE).unwrap();

        let migrating = block.migrate_begin_wait();
        assert_eq!(evict_chunk(&chunk), Err(HmmError::Busy));
        assert!(chunk.owner().is_some());
        drop(migrating);

        evict_chunk(&chunk).unwrap();
        assert!(chunk.owner().is_none());
        assert_eq!(h.host.pte_kind(BASE), PteKind::Present);
    }

    #[test]
    fn accessed_by_mappings_follow_the_data() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE, b"watched").unwrap();
        h.space.read().handle_cpu_fault(BASE, false).unwrap();
        h.space
            .write()
            .set_accessed_by(BASE, PAGE_SIZE, GPU0, true)
            .unwrap();
        assert!(matches!(
            h.mmu.translate(GPU0, BASE).map(|m| m.page),
            Some(PhysPage::Host(_))
        ));

        let space = h.space.read();
        space
            .migrate_range(BASE, PAGE_SIZE, GPU1, MigrateMode::ResidencyOnly)
            .unwrap();
        assert_eq!(h.host.pte_kind(BASE), PteKind::DevicePrivate(GPU1));
        let chunk = gpu_chunk_at(&h, GPU0, BASE);
        assert_eq!(chunk.gpu(), GPU1);
        assert_eq!(&chunk.data()[..7], b"watched");
        drop(chunk);
        assert!(h.mmu.translate(GPU1, BASE).is_none());

        space
            .migrate_range(BASE, PAGE_SIZE, ProcessorId::CPU, MigrateMode::ResidencyOnly)
            .unwrap();
        let block = space.find(BASE).unwrap();
        assert!(block.lock().mapped_on(GPU0).test(0));
        let frame = match h.mmu.translate(GPU0, BASE).map(|m| m.page) {
            Some(PhysPage::Host(frame)) => frame,
            other => panic!("expected host memory, found {other:?}"),
        };
        assert!(Arc::ptr_eq(&frame, &block.lock().cpu_pages[&0]));
        assert_eq!(h.host.read(BASE, 7).unwrap(), b"watched");
    }

    #[test]
    fn migration_waits_for_background_copies() {
        let h = Harness::with_background_copies();
        h.mmap(BASE, BLOCK_SIZE);
        for i in 0..16u64 {
            h.host.write(BASE + i * PAGE_SIZE, &i.to_le_bytes()).unwrap();
        }

        let space = h.space.read();
        space
            .migrate_range(BASE, 16 * PAGE_SIZE, GPU0, MigrateMode::ResidencyAndMap)
            .unwrap();
        for i in 0..16u64 {
            let chunk = gpu_chunk_at(&h, GPU0, BASE + i * PAGE_SIZE);
            assert_eq!(&chunk.data()[..8], &i.to_le_bytes());
        }

        space
            .migrate_range(BASE, 16 * PAGE_SIZE, ProcessorId::CPU, MigrateMode::ResidencyOnly)
            .unwrap();
        space
            .handle_gpu_fault(BASE + 3 * PAGE_SIZE, GPU1, AccessType::Read)
            .unwrap();
        assert_eq!(&gpu_chunk_at(&h, GPU1, BASE + 3 * PAGE_SIZE).data()[..8], &3u64.to_le_bytes());
        assert_eq!(h.host.read(BASE + 5 * PAGE_SIZE, 8).unwrap(), 5u64.to_le_bytes());
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);
    }

    #[test]
    fn evict_block_pages_can_target_one_gpu() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        let space = h.space.read();
        space.handle_gpu_fault(BASE, GPU0, AccessType::Write).unwrap();
        space
            .handle_gpu_fault(BASE + PAGE_SIZE, GPU1, AccessType::Write)
            .unwrap();
        let block = space.find(BASE).unwrap();
        let all = PageMask::from_region(block.full_region());

        assert_eq!(
            space.evict_block_pages(&block, &PageMask::from_region(PageRegion::new(4, 8)), None),
            Ok(MigrateStatus::NothingToDo)
        );
        let status = space.evict_block_pages(&block, &all, Some(GPU1)).unwrap();
        assert_eq!(status, MigrateStatus::Migrated([1].into_iter().collect()));
        assert_eq!(h.host.pte_kind(BASE), PteKind::DevicePrivate(GPU0));
        assert_eq!(h.host.pte_kind(BASE + PAGE_SIZE), PteKind::Present);
    }

    #[test]
    fn unregister_gpu_evicts_and_forgets_it() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE, b"on gpu1").unwrap();
        h.space
            .write()
            .set_preferred_location(BASE, 0x2000, Some(GPU1), None)
            .unwrap();
        {
            let space = h.space.read();
            space.handle_gpu_fault(BASE, GPU0, AccessType::Read).unwrap();
            space
                .handle_gpu_fault(BASE + PAGE_SIZE, GPU1, AccessType::Write)
                .unwrap();
        }
        assert_eq!(h.gpu_memory.live_chunks(GPU1), 2);
        assert_eq!(h.mmu.mapped_pages(GPU0), 1);

        let mut space = h.space.write();
        space.unregister_gpu(GPU1).unwrap();
        assert_eq!(h.gpu_memory.live_chunks(GPU1), 0);
        assert_eq!(h.mmu.mapped_pages(GPU0), 0);
        assert_eq!(h.mmu.mapped_pages(GPU1), 0);
        assert_eq!(h.host.read(BASE, 7).unwrap(), b"on gpu1");
        assert!(space.policy_at(BASE).is_default());
        assert!(!space.state().is_registered(GPU1));
    }

    #[test]
    fn reclaim_brings_device_data_home() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE + 0x8000, b"keep").unwrap();
        h.space
            .read()
            .handle_gpu_fault(BASE + 0x8000, GPU0, AccessType::Write)
            .unwrap();

        h.space.write().reclaim(BASE, BASE + BLOCK_SIZE - 1).unwrap();
        assert_eq!(h.space.block_count(), 0);
        assert_eq!(h.host.notifier_count(), 0);
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);
        assert_eq!(h.host.read(BASE + 0x8000, 4).unwrap(), b"keep");
    }
}
