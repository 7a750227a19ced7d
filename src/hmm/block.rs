//! VA blocks: the unit of residency tracking for HMM-managed memory.

use super::page_mask::{PageMask, PageRegion};
use super::policy::PolicyTree;
use super::space::VaSpace;
use crate::error::Stale;
use crate::gpu::{ProcessorId, ProcessorMask};
use crate::host::OwnerToken;
use crate::host::notifier::Subscription;
use crate::page::{ChunkOwner, GpuChunk, HostFrame, PhysPage};
use crate::utils::PAGE_SHIFT;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// Value of a block's change counter, sampled under the block lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotToken(u64);

/// Everything protected by the block lock. Page indices are relative to the
/// block start.
#[derive(Debug, Default)]
pub struct BlockState {
    changed: u64,
    pub resident: BTreeMap<ProcessorId, PageMask>,
    pub mapped: BTreeMap<ProcessorId, PageMask>,
    pub cpu_pages: BTreeMap<usize, Arc<HostFrame>>,
    pub gpu_chunks: BTreeMap<ProcessorId, BTreeMap<usize, Arc<GpuChunk>>>,
    pub policy: PolicyTree,
    pub(crate) inject_split_error: bool,
}

impl BlockState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn snapshot(&self) -> SnapshotToken {
        SnapshotToken(self.changed)
    }

    /// Fails if an invalidation ran since `token` was taken.
    pub const fn validate(&self, token: SnapshotToken) -> Result<(), Stale> {
        if self.changed == token.0 {
            Ok(())
        } else {
            Err(Stale)
        }
    }

    /// Record a change; outstanding snapshots become stale.
    pub fn bump(&mut self) {
        self.changed = self.changed.wrapping_add(1);
    }

    #[must_use]
    pub fn resident_on(&self, processor: ProcessorId) -> PageMask {
        self.resident.get(&processor).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn mapped_on(&self, processor: ProcessorId) -> PageMask {
        self.mapped.get(&processor).copied().unwrap_or_default()
    }

    /// Processors holding a copy of page `index`.
    #[must_use]
    pub fn resident_processors(&self, index: usize) -> ProcessorMask {
        self.resident
            .iter()
            .filter(|(_, mask)| mask.test(index))
            .map(|(&p, _)| p)
            .collect()
    }

    #[must_use]
    pub fn mapped_processors(&self) -> ProcessorMask {
        self.mapped
            .iter()
            .filter(|(_, mask)| !mask.is_empty())
            .map(|(&p, _)| p)
            .collect()
    }

    /// Pages resident on any GPU.
    #[must_use]
    pub fn gpu_resident(&self) -> PageMask {
        self.resident
            .iter()
            .filter(|(p, _)| !p.is_cpu())
            .fold(PageMask::new(), |acc, (_, mask)| acc | *mask)
    }

    pub fn set_resident(&mut self, processor: ProcessorId, pages: &PageMask) {
        *self.resident.entry(processor).or_default() |= *pages;
    }

    pub fn clear_resident(&mut self, processor: ProcessorId, pages: &PageMask) {
        if let Some(mask) = self.resident.get_mut(&processor) {
            *mask = mask.andnot(pages);
            if mask.is_empty() {
                self.resident.remove(&processor);
            }
        }
    }

    pub fn set_mapped(&mut self, processor: ProcessorId, pages: &PageMask) {
        *self.mapped.entry(processor).or_default() |= *pages;
    }

    pub fn clear_mapped(&mut self, processor: ProcessorId, pages: &PageMask) {
        if let Some(mask) = self.mapped.get_mut(&processor) {
            *mask = mask.andnot(pages);
            if mask.is_empty() {
                self.mapped.remove(&processor);
            }
        }
    }

    /// Forget host pages; the references go back to the host.
    pub fn drop_cpu_pages(&mut self, pages: &PageMask) {
        for index in pages.iter() {
            self.cpu_pages.remove(&index);
        }
        self.clear_resident(ProcessorId::CPU, pages);
    }

    /// Release GPU chunks on `gpu` back to the PMM.
    pub fn drop_gpu_chunks(&mut self, gpu: ProcessorId, pages: &PageMask) {
        if let Some(chunks) = self.gpu_chunks.get_mut(&gpu) {
            for index in pages.iter() {
                if let Some(chunk) = chunks.remove(&index) {
                    chunk.set_owner(None);
                }
            }
            if chunks.is_empty() {
                self.gpu_chunks.remove(&gpu);
            }
        }
        self.clear_resident(gpu, pages);
    }

    #[must_use]
    pub fn gpu_chunk(&self, gpu: ProcessorId, index: usize) -> Option<&Arc<GpuChunk>> {
        self.gpu_chunks.get(&gpu).and_then(|chunks| chunks.get(&index))
    }

    /// Where page `index` currently lives.
    #[must_use]
    pub fn phys_page(&self, index: usize) -> Option<PhysPage> {
        self.gpu_chunks
            .values()
            .find_map(|chunks| chunks.get(&index))
            .map(|chunk| PhysPage::Gpu(chunk.clone()))
            .or_else(|| {
                self.cpu_pages
                    .get(&index)
                    .map(|frame| PhysPage::Host(frame.clone()))
            })
    }

    /// Move the pages at and above `index` (address `addr`) into a new state,
    /// renumbered from zero.
    #[must_use]
    pub fn split_off(&mut self, index: usize, addr: u64) -> Self {
        fn split_masks(
            masks: &mut BTreeMap<ProcessorId, PageMask>,
            index: usize,
        ) -> BTreeMap<ProcessorId, PageMask> {
            let mut upper = BTreeMap::new();
            for (&p, mask) in masks.iter_mut() {
                let moved = mask.shift_down(index);
                if !moved.is_empty() {
                    upper.insert(p, moved);
                }
                mask.truncate(index);
            }
            masks.retain(|_, mask| !mask.is_empty());
            upper
        }

        fn rebase<T>(pages: &mut BTreeMap<usize, T>, index: usize) -> BTreeMap<usize, T> {
            pages
                .split_off(&index)
                .into_iter()
                .map(|(i, v)| (i - index, v))
                .collect()
        }

        let mut gpu_chunks = BTreeMap::new();
        for (&gpu, chunks) in &mut self.gpu_chunks {
            let moved = rebase(chunks, index);
            if !moved.is_empty() {
                gpu_chunks.insert(gpu, moved);
            }
        }
        self.gpu_chunks.retain(|_, chunks| !chunks.is_empty());
        self.bump();

        Self {
            changed: 0,
            resident: split_masks(&mut self.resident, index),
            mapped: split_masks(&mut self.mapped, index),
            cpu_pages: rebase(&mut self.cpu_pages, index),
            gpu_chunks,
            policy: self.policy.split_off(addr),
            inject_split_error: false,
        }
    }
}

/// A VA interval of at most 2MB inside one 2MB-aligned region.
///
/// The start never changes; a split moves the end down and hands the rest to
/// a new block.
pub struct VaBlock {
    id: BlockId,
    start: u64,
    end: AtomicU64,
    owner: OwnerToken,
    space: Weak<VaSpace>,
    state: Mutex<BlockState>,
    migrate_lock: Mutex<()>,
    notifier: Mutex<Option<Subscription>>,
    // Blocks split off the top of this one.
    successors: Mutex<Vec<Weak<VaBlock>>>,
    dead: AtomicBool,
}

impl VaBlock {
    pub(crate) fn new(
        start: u64,
        end: u64,
        owner: OwnerToken,
        space: Weak<VaSpace>,
        state: BlockState,
    ) -> Self {
        Self {
            id: BlockId::next(),
            start,
            end: AtomicU64::new(end),
            owner,
            space,
            state: Mutex::new(state),
            migrate_lock: Mutex::new(()),
            notifier: Mutex::new(None),
            successors: Mutex::new(Vec::new()),
            dead: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    pub(crate) fn set_end(&self, end: u64) {
        self.end.store(end, Ordering::Release);
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end()
    }

    #[must_use]
    pub const fn owner(&self) -> OwnerToken {
        self.owner
    }

    #[must_use]
    pub fn space(&self) -> Option<Arc<VaSpace>> {
        self.space.upgrade()
    }

    #[must_use]
    pub fn num_pages(&self) -> usize {
        ((self.end() - self.start + 1) >> PAGE_SHIFT) as usize
    }

    #[must_use]
    pub const fn page_index(&self, addr: u64) -> usize {
        ((addr - self.start) >> PAGE_SHIFT) as usize
    }

    #[must_use]
    pub const fn page_addr(&self, index: usize) -> u64 {
        self.start + ((index as u64) << PAGE_SHIFT)
    }

    #[must_use]
    pub fn full_region(&self) -> PageRegion {
        PageRegion::new(0, self.num_pages())
    }

    /// Pages of `[start, end]` inside the block.
    #[must_use]
    pub fn region_of(&self, start: u64, end: u64) -> PageRegion {
        let lo = start.max(self.start);
        let hi = end.min(self.end());
        if lo > hi {
            return PageRegion::new(0, 0);
        }
        PageRegion::new(self.page_index(lo), self.page_index(hi) + 1)
    }

    /// Address range `[start, end]` of a page region.
    #[must_use]
    pub const fn region_range(&self, region: PageRegion) -> (u64, u64) {
        (
            self.page_addr(region.first),
            self.page_addr(region.outer) - 1,
        )
    }

    pub fn lock(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock()
    }

    /// Start a migration unless one is already running.
    pub fn migrate_begin(&self) -> Option<MutexGuard<'_, ()>> {
        self.migrate_lock.try_lock()
    }

    /// Start a migration, waiting for a running one to finish.
    pub fn migrate_begin_wait(&self) -> MutexGuard<'_, ()> {
        self.migrate_lock.lock()
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub(crate) fn add_successor(&self, block: &Arc<Self>) {
        self.successors.lock().push(Arc::downgrade(block));
    }

    /// Live blocks that were split off this one.
    pub(crate) fn successors(&self) -> Vec<Arc<Self>> {
        self.successors
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn notifier(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.notifier.lock()
    }

    /// Point every GPU chunk in `state` back at this block.
    pub(crate) fn adopt_chunks(self: &Arc<Self>, state: &BlockState) {
        for chunks in state.gpu_chunks.values() {
            for (&page_index, chunk) in chunks {
                chunk.set_owner(Some(ChunkOwner {
                    block: Arc::downgrade(self),
                    page_index,
                }));
            }
        }
    }
}

impl fmt::Debug for VaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaBlock")
            .field("id", &self.id)
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end()))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for VaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.start, self.end())
    }
}
