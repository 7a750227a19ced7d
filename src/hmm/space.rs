//! The HMM side of a process address space: the VA block registry and the
//! operations that change its topology.
//!
//! Lock order, coarse to fine: the space lock ([`VaSpace::read`] or
//! [`VaSpace::write`]), the registry insertion lock, a block's migration lock,
//! then the block lock.

use super::block::{BlockState, VaBlock};
use super::fault::{self, AccessType, FaultRequest};
use super::info::{self, ResidencyInfo, VaRangeInfo};
use super::invalidate::BlockNotifier;
use super::migrate::{self, MigrateMode, MigrateStatus};
use super::page_mask::PageMask;
use super::policy::{Policy, ReadDuplication};
use crate::config::{self, HmmConfig, SpaceFlags};
use crate::error::{HmmError, HmmResult};
use crate::gpu::{CopyEngine, GpuMemory, GpuMmu, ProcessorId, ProcessorMask};
use crate::host::notifier::Subscription;
use crate::host::{HostMm, OwnerToken};
use crate::utils::{BLOCK_SIZE, align_down, align_end, is_page_aligned, page_align_down};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// State protected by the space lock.
#[derive(Debug, Default)]
pub struct SpaceState {
    destroyed: bool,
    gpus: ProcessorMask,
    // Allocations managed outside HMM: start -> inclusive end.
    external: BTreeMap<u64, u64>,
}

impl SpaceState {
    #[must_use]
    pub const fn gpus(&self) -> ProcessorMask {
        self.gpus
    }

    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The CPU is always registered.
    #[must_use]
    pub const fn is_registered(&self, processor: ProcessorId) -> bool {
        processor.is_cpu() || self.gpus.contains(processor)
    }

    fn external_containing(&self, addr: u64) -> Option<(u64, u64)> {
        self.external
            .range(..=addr)
            .next_back()
            .map(|(&start, &end)| (start, end))
            .filter(|&(_, end)| addr <= end)
    }
}

pub struct VaSpace {
    me: Weak<VaSpace>,
    owner: OwnerToken,
    config: HmmConfig,
    flags: SpaceFlags,
    pub(crate) host: Arc<dyn HostMm>,
    pub(crate) gpu_memory: Arc<dyn GpuMemory>,
    pub(crate) mmu: Arc<dyn GpuMmu>,
    pub(crate) copy: Arc<dyn CopyEngine>,
    lock: RwLock<SpaceState>,
    // The registry insertion lock.
    blocks: Mutex<BTreeMap<u64, Arc<VaBlock>>>,
    split_delay: Mutex<Option<Duration>>,
}

impl VaSpace {
    #[must_use]
    pub fn new(
        config: HmmConfig,
        flags: SpaceFlags,
        host: Arc<dyn HostMm>,
        gpu_memory: Arc<dyn GpuMemory>,
        mmu: Arc<dyn GpuMmu>,
        copy: Arc<dyn CopyEngine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            owner: OwnerToken::new(),
            config,
            flags,
            host,
            gpu_memory,
            mmu,
            copy,
            lock: RwLock::new(SpaceState::default()),
            blocks: Mutex::new(BTreeMap::new()),
            split_delay: Mutex::new(None),
        })
    }

    /// Token tagging the host migrations and exclusive grants of this space.
    #[must_use]
    pub const fn owner(&self) -> OwnerToken {
        self.owner
    }

    #[must_use]
    pub const fn config(&self) -> &HmmConfig {
        &self.config
    }

    pub fn read(&self) -> VaSpaceRead<'_> {
        VaSpaceRead {
            space: self,
            state: self.lock.read(),
        }
    }

    pub fn write(&self) -> VaSpaceWrite<'_> {
        VaSpaceWrite {
            space: self,
            state: self.lock.write(),
        }
    }

    /// Whether this space may create blocks right now.
    #[must_use]
    pub fn hmm_enabled(&self, state: &SpaceState) -> bool {
        !state.destroyed
            && config::hmm_enabled(
                self.config.enabled_system_wide(),
                !self.flags.disable_hmm,
                self.config.ats_enabled,
            )
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Every block, in address order.
    #[must_use]
    pub fn blocks(&self) -> Vec<Arc<VaBlock>> {
        self.blocks.lock().values().cloned().collect()
    }

    pub(crate) fn split_delay(&self) -> Option<Duration> {
        *self.split_delay.lock()
    }

    pub(crate) fn find_block(&self, addr: u64) -> Option<Arc<VaBlock>> {
        find_in(&self.blocks.lock(), addr)
    }

    pub(crate) fn blocks_in(&self, start: u64, end: u64) -> Vec<Arc<VaBlock>> {
        let blocks = self.blocks.lock();
        let first = find_in(&blocks, start).map_or(start, |block| block.start());
        blocks
            .range(first..=end.max(first))
            .map(|(_, block)| block.clone())
            .filter(|block| block.start() <= end)
            .collect()
    }

    /// Largest interval inside the 2MB region of `addr` that overlaps no
    /// block and no external allocation.
    fn candidate_interval(
        state: &SpaceState,
        blocks: &BTreeMap<u64, Arc<VaBlock>>,
        addr: u64,
    ) -> HmmResult<(u64, u64)> {
        if state.external_containing(addr).is_some() {
            return Err(HmmError::InvalidAddress(addr));
        }

        let mut lo = align_down(addr, BLOCK_SIZE);
        let mut hi = align_end(addr, BLOCK_SIZE);
        if let Some((_, prev)) = blocks.range(..=addr).next_back() {
            lo = lo.max(prev.end() + 1);
        }
        if let Some((&next, _)) = blocks.range((Bound::Excluded(addr), Bound::Unbounded)).next() {
            hi = hi.min(next - 1);
        }
        if let Some((_, &end)) = state.external.range(..addr).next_back() {
            lo = lo.max(end + 1);
        }
        if let Some((&start, _)) = state
            .external
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
        {
            hi = hi.min(start - 1);
        }
        Ok((lo, hi))
    }

    fn check_mapping(&self, state: &SpaceState, addr: u64, allow_unreadable: bool) -> HmmResult<()> {
        if !self.hmm_enabled(state) {
            return Err(HmmError::InvalidAddress(addr));
        }
        let vma = self
            .host
            .find_vma(addr)
            .ok_or(HmmError::InvalidAddress(addr))?;
        if !vma.readable && !allow_unreadable {
            return Err(HmmError::InvalidAddress(addr));
        }
        Ok(())
    }

    pub(crate) fn range_bounds(&self, state: &SpaceState, addr: u64) -> HmmResult<(u64, u64)> {
        let addr = page_align_down(addr);
        if let Some(block) = self.find_block(addr) {
            return Ok((block.start(), block.end()));
        }
        self.check_mapping(state, addr, true)?;
        Self::candidate_interval(state, &self.blocks.lock(), addr)
    }

    pub(crate) fn find_or_create_block(
        &self,
        state: &SpaceState,
        addr: u64,
        allow_unreadable: bool,
    ) -> HmmResult<Arc<VaBlock>> {
        let addr = page_align_down(addr);
        self.check_mapping(state, addr, allow_unreadable)?;
        if let Some(block) = self.find_block(addr) {
            return Ok(block);
        }

        let fresh = BlockState::new();
        let mut blocks = self.blocks.lock();
        if let Some(block) = find_in(&blocks, addr) {
            // Lost the race; `fresh` is dropped.
            return Ok(block);
        }
        let (start, end) = Self::candidate_interval(state, &blocks, addr)?;
        let block = self.install_block(start, end, fresh)?;
        blocks.insert(start, block.clone());
        tracing::debug!(block = %block, "created HMM block");
        Ok(block)
    }

    /// Build a block and register its notifier over exactly `[start, end]`.
    fn install_block(&self, start: u64, end: u64, state: BlockState) -> HmmResult<Arc<VaBlock>> {
        let block = Arc::new(VaBlock::new(start, end, self.owner, self.me.clone(), state));
        let notifier = Arc::new(BlockNotifier::new(
            Arc::downgrade(&block),
            self.mmu.clone(),
        ));
        let subscription = Subscription::install(self.host.clone(), start, end, notifier)?;
        *block.notifier() = Some(subscription);
        Ok(block)
    }

    /// Take `block` out of service. Waits for its in-flight invalidations.
    fn retire_block(&self, block: &Arc<VaBlock>) {
        self.blocks.lock().remove(&block.start());
        let subscription = block.notifier().take();
        if let Some(subscription) = subscription {
            subscription.remove();
        }
        block.mark_dead();

        let mut state = block.lock();
        let gpus: Vec<_> = state.mapped_processors().gpus().iter().collect();
        let (start, end) = (block.start(), block.end());
        for gpu in gpus {
            if let Err(e) = self.mmu.unmap(gpu, start, end).and_then(|t| t.wait()) {
                panic!("failed to unmap {gpu} while retiring {block}: {e}");
            }
        }
        for chunks in state.gpu_chunks.values() {
            for chunk in chunks.values() {
                chunk.set_owner(None);
            }
        }
        *state = BlockState::new();
        drop(state);
        tracing::debug!(block = %block, "destroyed HMM block");
    }

    fn split_block(&self, block: &Arc<VaBlock>, new_end: u64) -> HmmResult<Arc<VaBlock>> {
        let old_end = block.end();
        if new_end < block.start() || new_end >= old_end || !is_page_aligned(new_end + 1) {
            return Err(HmmError::InvalidArgument(format!(
                "cannot split {block} at {new_end:#x}"
            )));
        }

        let new_start = new_end + 1;
        let mut state = block.lock();
        if std::mem::take(&mut state.inject_split_error) {
            return Err(HmmError::OutOfMemory);
        }

        // Registered before any state moves; a failure leaves `block` intact.
        let upper = self.install_block(new_start, old_end, BlockState::new())?;
        let moved = state.split_off(block.page_index(new_start), new_start);
        upper.adopt_chunks(&moved);
        *upper.lock() = moved;
        block.set_end(new_end);
        block.add_successor(&upper);
        drop(state);
        self.blocks.lock().insert(new_start, upper.clone());

        let subscription = block.notifier().take();
        if let Some(subscription) = subscription {
            let resized = subscription.resize(block.start(), new_end, self.split_delay());
            *block.notifier() = Some(resized);
        }

        tracing::debug!(block = %block, new = %upper, "split HMM block");
        Ok(upper)
    }

    fn reclaim(&self, start: u64, end: u64) -> HmmResult<()> {
        // Both splits happen before anything is removed.
        if let Some(block) = self.find_block(start).filter(|b| b.start() < start) {
            self.split_block(&block, start - 1)?;
        }
        if let Some(block) = self.find_block(end).filter(|b| b.end() > end) {
            self.split_block(&block, end)?;
        }
        for block in self.blocks_in(start, end) {
            migrate::evict_block(self, &block, None, false)?;
            self.retire_block(&block);
        }
        Ok(())
    }

    fn destroy(&self, state: &mut SpaceState) {
        state.destroyed = true;
        for block in self.blocks() {
            self.retire_block(&block);
        }
    }

    /// Apply `update` to the policy of `[base, base + len)`, creating blocks
    /// as needed. Every page of the range must be mapped and outside external
    /// allocations; no policy changes unless every block could be found.
    fn update_policy(
        &self,
        state: &SpaceState,
        base: u64,
        len: u64,
        mut update: impl FnMut(&VaBlock, &mut BlockState, u64, u64) -> HmmResult<()>,
    ) -> HmmResult<()> {
        if len == 0 || !is_page_aligned(base) || !is_page_aligned(len) {
            return Err(HmmError::InvalidArgument(format!(
                "unaligned range {base:#x}+{len:#x}"
            )));
        }
        let end = range_end(base, len)?;

        let mut addr = base;
        loop {
            let vma = self
                .host
                .find_vma(addr)
                .ok_or(HmmError::InvalidAddress(addr))?;
            if vma.end >= end {
                break;
            }
            addr = vma.end + 1;
        }
        if let Some((&start, _)) = state
            .external
            .range(..=end)
            .next_back()
            .filter(|&(_, &e)| e >= base)
        {
            return Err(HmmError::InvalidAddress(start.max(base)));
        }

        let mut segments = Vec::new();
        let mut addr = base;
        loop {
            let block = self.find_or_create_block(state, addr, true)?;
            let seg_end = end.min(block.end());
            segments.push((block, addr, seg_end));
            if seg_end == end {
                break;
            }
            addr = seg_end + 1;
        }

        for (block, start, seg_end) in segments {
            let mut block_state = block.lock();
            update(&*block, &mut block_state, start, seg_end)?;
        }
        Ok(())
    }
}

/// Inclusive end of `[base, base + len)`.
fn range_end(base: u64, len: u64) -> HmmResult<u64> {
    base.checked_add(len - 1)
        .ok_or_else(|| HmmError::InvalidArgument(format!("range {base:#x}+{len:#x} overflows")))
}

fn find_in(blocks: &BTreeMap<u64, Arc<VaBlock>>, addr: u64) -> Option<Arc<VaBlock>> {
    blocks
        .range(..=addr)
        .next_back()
        .map(|(_, block)| block)
        .filter(|block| block.contains(addr))
        .cloned()
}

// ===============================================================================================
// Locked views
// ===============================================================================================

/// Operations available while holding the space lock in either mode.
pub trait VaSpaceLocked {
    fn va_space(&self) -> &VaSpace;
    fn state(&self) -> &SpaceState;

    /// The block containing `addr`.
    fn find(&self, addr: u64) -> Option<Arc<VaBlock>> {
        self.va_space().find_block(addr)
    }

    /// The block containing `addr`, created if the address has a backing
    /// mapping that is readable (or `allow_unreadable` is set).
    fn find_or_create(&self, addr: u64, allow_unreadable: bool) -> HmmResult<Arc<VaBlock>> {
        self.va_space()
            .find_or_create_block(self.state(), addr, allow_unreadable)
    }

    /// The interval [`find_or_create`](Self::find_or_create) would use for
    /// `addr`, without creating anything.
    fn range_bounds(&self, addr: u64) -> HmmResult<(u64, u64)> {
        self.va_space().range_bounds(self.state(), addr)
    }

    fn va_range_info(&self, addr: u64) -> HmmResult<VaRangeInfo> {
        info::va_range_info(self.va_space(), self.state(), addr)
    }

    fn residency_info(&self, addr: u64) -> HmmResult<ResidencyInfo> {
        info::residency_info(self.va_space(), addr)
    }

    /// Resolve a CPU fault, retrying until it converges.
    fn handle_cpu_fault(&self, addr: u64, write: bool) -> HmmResult<()> {
        let access = if write {
            AccessType::Write
        } else {
            AccessType::Read
        };
        fault::handle_fault(
            self.va_space(),
            self.state(),
            &FaultRequest::new(addr, ProcessorId::CPU, access),
        )
    }

    /// Resolve a GPU fault, retrying until it converges.
    fn handle_gpu_fault(&self, addr: u64, gpu: ProcessorId, access: AccessType) -> HmmResult<()> {
        fault::handle_fault(
            self.va_space(),
            self.state(),
            &FaultRequest::new(addr, gpu, access),
        )
    }

    /// A single attempt at servicing a fault. May return
    /// `MoreProcessingRequired`.
    fn service_fault(&self, request: &FaultRequest) -> HmmResult<MigrateStatus> {
        fault::service_fault(self.va_space(), self.state(), request)
    }

    /// Migrate `[base, base + len)` to `dest`.
    fn migrate_range(
        &self,
        base: u64,
        len: u64,
        dest: ProcessorId,
        mode: MigrateMode,
    ) -> HmmResult<()> {
        migrate::migrate_range(self.va_space(), self.state(), base, len, dest, mode)
    }

    /// Move pages of `block` off the GPUs (or just `gpu`) back to host memory.
    fn evict_block_pages(
        &self,
        block: &Arc<VaBlock>,
        pages: &PageMask,
        gpu: Option<ProcessorId>,
    ) -> HmmResult<MigrateStatus> {
        migrate::evict_block_pages(self.va_space(), block, pages, gpu)
    }
}

pub struct VaSpaceRead<'a> {
    space: &'a VaSpace,
    state: RwLockReadGuard<'a, SpaceState>,
}

impl VaSpaceLocked for VaSpaceRead<'_> {
    fn va_space(&self) -> &VaSpace {
        self.space
    }

    fn state(&self) -> &SpaceState {
        &self.state
    }
}

pub struct VaSpaceWrite<'a> {
    space: &'a VaSpace,
    state: RwLockWriteGuard<'a, SpaceState>,
}

impl VaSpaceLocked for VaSpaceWrite<'_> {
    fn va_space(&self) -> &VaSpace {
        self.space
    }

    fn state(&self) -> &SpaceState {
        &self.state
    }
}

impl VaSpaceWrite<'_> {
    /// Shrink `block` to end at `new_end`; the rest becomes a new block.
    pub fn split_block(&self, block: &Arc<VaBlock>, new_end: u64) -> HmmResult<Arc<VaBlock>> {
        self.space.split_block(block, new_end)
    }

    /// Remove every block in `[start, end]`, bringing GPU-resident data back to
    /// host memory first. Blocks straddling the bounds are split.
    pub fn reclaim(&self, start: u64, end: u64) -> HmmResult<()> {
        self.space.reclaim(start, end)
    }

    /// Tear everything down. The space refuses to create blocks afterwards.
    pub fn destroy(&mut self) {
        self.space.destroy(&mut self.state);
    }

    pub fn register_gpu(&mut self, gpu: ProcessorId) -> HmmResult<()> {
        if gpu.is_cpu() {
            return Err(HmmError::InvalidArgument("the CPU is always registered".into()));
        }
        if self.state.gpus.contains(gpu) {
            return Err(HmmError::InvalidArgument(format!("{gpu} already registered")));
        }
        self.state.gpus.set(gpu);
        Ok(())
    }

    /// Evict everything resident on `gpu` and drop its mappings and policy
    /// references. Retries until nothing is left on the GPU.
    pub fn unregister_gpu(&mut self, gpu: ProcessorId) -> HmmResult<()> {
        if gpu.is_cpu() || !self.state.gpus.contains(gpu) {
            return Err(HmmError::InvalidDevice(gpu));
        }

        let mut rounds = 0u64;
        loop {
            let mut remaining = false;
            for block in self.space.blocks() {
                migrate::evict_block(self.space, &block, Some(gpu), true)?;
                remaining |= !block.lock().resident_on(gpu).is_empty();
            }
            if !remaining {
                break;
            }
            rounds += 1;
            tracing::debug!(%gpu, rounds, "pages still resident after eviction pass");
        }

        for block in self.space.blocks() {
            let mut state = block.lock();
            let mapped = state.mapped_on(gpu);
            if !mapped.is_empty() {
                let unmapped = self
                    .space
                    .mmu
                    .unmap(gpu, block.start(), block.end())
                    .and_then(|t| t.wait());
                if let Err(e) = unmapped {
                    panic!("failed to unmap {gpu} from {block}: {e}");
                }
                state.clear_mapped(gpu, &mapped);
            }
            let (start, end) = (block.start(), block.end());
            state.policy.update_range(start, end, |policy| {
                if policy.preferred_location == Some(gpu) {
                    policy.preferred_location = None;
                }
                policy.accessed_by.clear(gpu);
            });
        }

        self.state.gpus.clear(gpu);
        Ok(())
    }

    /// Reserve `[start, end]` for an allocation managed outside HMM,
    /// reclaiming any HMM blocks there first.
    pub fn register_external(&mut self, start: u64, end: u64) -> HmmResult<()> {
        if start > end || !is_page_aligned(start) || !is_page_aligned(end.wrapping_add(1)) {
            return Err(HmmError::InvalidArgument(format!(
                "unaligned range {start:#x}-{end:#x}"
            )));
        }
        let clash = self
            .state
            .external
            .range(..=end)
            .next_back()
            .is_some_and(|(_, &e)| e >= start);
        if clash {
            return Err(HmmError::InvalidArgument(format!(
                "{start:#x}-{end:#x} overlaps an external allocation"
            )));
        }
        self.space.reclaim(start, end)?;
        self.state.external.insert(start, end);
        Ok(())
    }

    pub fn unregister_external(&mut self, start: u64) -> HmmResult<()> {
        self.state
            .external
            .remove(&start)
            .map(|_| ())
            .ok_or(HmmError::NotFound)
    }

    /// Set the preferred location of `[base, base + len)`. `None` clears it.
    pub fn set_preferred_location(
        &self,
        base: u64,
        len: u64,
        location: Option<ProcessorId>,
        cpu_nid: Option<i32>,
    ) -> HmmResult<()> {
        if let Some(location) = location {
            if !self.state.is_registered(location) {
                return Err(HmmError::InvalidDevice(location));
            }
        }
        let nid = location.filter(|l| l.is_cpu()).and(cpu_nid);
        self.space
            .update_policy(&self.state, base, len, |_, state, start, end| {
                state.policy.update_range(start, end, |policy| {
                    policy.preferred_location = location;
                    policy.preferred_cpu_nid = nid;
                });
                Ok(())
            })
    }

    /// Add or remove `processor` from the accessed-by set of `[base, base + len)`.
    ///
    /// Adding a GPU maps the populated pages of the range on it, wherever they
    /// live. Later migrations keep those mappings.
    pub fn set_accessed_by(
        &self,
        base: u64,
        len: u64,
        processor: ProcessorId,
        add: bool,
    ) -> HmmResult<()> {
        if !self.state.is_registered(processor) {
            return Err(HmmError::InvalidDevice(processor));
        }
        self.space
            .update_policy(&self.state, base, len, |block, state, start, end| {
                state.policy.update_range(start, end, |policy| {
                    if add {
                        policy.accessed_by.set(processor);
                    } else {
                        policy.accessed_by.clear(processor);
                    }
                });
                if !add || processor.is_cpu() {
                    return Ok(());
                }
                let pages = PageMask::from_region(block.region_of(start, end));
                migrate::map_accessed_by(self.space, block, state, &pages, None)
            })
    }

    /// Stored and reported; placement ignores it.
    pub fn set_read_duplication(
        &self,
        base: u64,
        len: u64,
        read_duplication: ReadDuplication,
    ) -> HmmResult<()> {
        self.space
            .update_policy(&self.state, base, len, |_, state, start, end| {
                state.policy.update_range(start, end, |policy| {
                    policy.read_duplication = read_duplication;
                });
                Ok(())
            })
    }

    /// Make the next split of the block containing `addr` fail.
    pub fn inject_split_error(&self, addr: u64) -> HmmResult<()> {
        let block = self.find(addr).ok_or(HmmError::NotFound)?;
        block.lock().inject_split_error = true;
        Ok(())
    }

    /// Hold the split invalidation window open for `delay`.
    pub fn set_split_invalidate_delay(&self, delay: Option<Duration>) {
        *self.space.split_delay.lock() = delay;
    }

    /// The policy in effect at `addr`.
    pub fn policy_at(&self, addr: u64) -> Policy {
        self.find(addr)
            .map_or(Policy::DEFAULT, |block| *block.lock().policy.policy_at(addr))
    }
}
