//! Fault servicing for HMM-managed memory.
//!
//! A single service attempt picks a destination from the block policy and
//! either populates host pages, grants device-exclusive access, or runs a
//! migration. Attempts return `MoreProcessingRequired` whenever the block
//! changed while its lock was dropped; [`handle_fault`] re-drives them.

use super::block::{BlockState, VaBlock};
use super::migrate::{
    self, MigrateCause, MigrateMode, MigrateRequest, MigrateStatus, map_pages, policy_region,
    record_faulted, with_retries,
};
use super::page_mask::{PageMask, PageRegion};
use super::space::{SpaceState, VaSpace};
use crate::error::{HmmError, HmmResult};
use crate::gpu::{ProcessorId, Prot};
use crate::host::{FaultedPage, Vma};
use crate::utils::{PREFETCH_SIZE, align_down, align_end, page_align_down};
use parking_lot::MutexGuard;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    /// Strong atomic; GPUs get device-exclusive access for these.
    Atomic,
}

impl AccessType {
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRequest {
    pub addr: u64,
    pub processor: ProcessorId,
    pub access: AccessType,
}

impl FaultRequest {
    #[must_use]
    pub const fn new(addr: u64, processor: ProcessorId, access: AccessType) -> Self {
        Self {
            addr,
            processor,
            access,
        }
    }
}

fn prot_for(vma: &Vma, access: AccessType) -> Prot {
    match access {
        AccessType::Atomic => Prot::ReadWriteAtomic,
        _ if vma.writable => Prot::ReadWrite,
        _ => Prot::ReadOnly,
    }
}

/// Service a fault, retrying while attempts ask for it.
pub fn handle_fault(space: &VaSpace, state: &SpaceState, request: &FaultRequest) -> HmmResult<()> {
    let status = with_retries(space, || service_fault(space, state, request)).inspect_err(|e| {
        tracing::warn!(
            addr = format_args!("{:#x}", request.addr),
            processor = %request.processor,
            error = %e,
            "fault could not be serviced"
        );
    })?;
    tracing::trace!(
        addr = format_args!("{:#x}", request.addr),
        processor = %request.processor,
        ?status,
        "fault serviced"
    );
    Ok(())
}

/// One attempt at servicing a fault on the page containing `request.addr`.
pub fn service_fault(
    space: &VaSpace,
    state: &SpaceState,
    request: &FaultRequest,
) -> HmmResult<MigrateStatus> {
    let processor = request.processor;
    if !state.is_registered(processor) {
        return Err(HmmError::InvalidDevice(processor));
    }
    let addr = page_align_down(request.addr);
    let vma = space
        .host
        .find_vma(addr)
        .ok_or(HmmError::InvalidAddress(request.addr))?;
    if !vma.readable || (request.access.is_write() && !vma.writable) {
        return Err(HmmError::InvalidAddress(request.addr));
    }

    let block = space.find_or_create_block(state, addr, false)?;
    let _migrating = block.migrate_begin_wait();
    let mut block_state = block.lock();

    let index = block.page_index(addr);
    let region = PageRegion::new(index, index + 1);
    let pages = PageMask::from_region(region);
    let policy = *block_state.policy.policy_at(addr);
    let prot = prot_for(&vma, request.access);

    let dest = if processor.is_cpu() {
        ProcessorId::CPU
    } else {
        policy
            .preferred_location
            .filter(|&p| state.is_registered(p))
            .unwrap_or(processor)
    };

    if !processor.is_cpu() && request.access == AccessType::Atomic && dest == processor {
        return service_exclusive(space, &block, &mut block_state, processor, region, &vma);
    }
    if dest.is_cpu() || !vma.is_migratable() {
        return service_in_host(space, &block, &mut block_state, request, region, prot);
    }

    let mut speculative = PageMask::new();
    if space.config().fault_prefetch {
        let (lo, hi) = policy_region(&block, &block_state, addr, &vma);
        let start = align_down(addr, PREFETCH_SIZE).max(lo);
        let end = align_end(addr, PREFETCH_SIZE).min(hi);
        speculative = PageMask::from_region(block.region_of(start, end)).andnot(&pages);
    }
    let mode = if dest == processor {
        MigrateMode::ResidencyAndMap
    } else {
        MigrateMode::ResidencyOnly
    };
    let migration = MigrateRequest::new(pages, dest, MigrateCause::Fault)
        .speculative(speculative)
        .mode(mode)
        .prot(prot)
        .dest_nid(policy.preferred_cpu_nid);
    let status = migrate::migrate_block(space, &block, &mut block_state, &migration)?;

    if dest != processor {
        // Remote mapping of wherever the policy put the data.
        map_pages(space, &block, &mut block_state, processor, &pages, prot)?;
    }
    Ok(status)
}

/// Bring GPU-resident pages of `pages` back to host memory.
fn evict_to_host(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    state: &mut MutexGuard<'_, BlockState>,
    pages: &PageMask,
) -> HmmResult<()> {
    let on_gpu = state.gpu_resident() & *pages;
    if on_gpu.is_empty() {
        return Ok(());
    }
    let request = MigrateRequest::new(on_gpu, ProcessorId::CPU, MigrateCause::Fault);
    migrate::migrate_block(space, block, state, &request)?;
    if (state.gpu_resident() & *pages).is_empty() {
        Ok(())
    } else {
        Err(HmmError::MoreProcessingRequired)
    }
}

/// Populate host pages and, for a GPU fault, map them remotely.
fn service_in_host(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    state: &mut MutexGuard<'_, BlockState>,
    request: &FaultRequest,
    region: PageRegion,
    prot: Prot,
) -> HmmResult<MigrateStatus> {
    let pages = PageMask::from_region(region);
    evict_to_host(space, block, state, &pages)?;

    let token = state.snapshot();
    let (start, end) = block.region_range(region);
    let faulted = MutexGuard::unlocked(state, || {
        space
            .host
            .range_fault(start, end, request.access.is_write(), block.owner())
    });
    state.validate(token)?;
    let faulted = faulted?;

    for page in &faulted {
        match page {
            FaultedPage::Host(_) => {}
            FaultedPage::Error(e) => return Err(e.clone()),
            // Went back to the device while unlocked.
            FaultedPage::DevicePrivate(_) => return Err(HmmError::MoreProcessingRequired),
        }
    }
    record_faulted(block, state, region.first, &faulted, &pages);

    if !request.processor.is_cpu() {
        map_pages(space, block, state, request.processor, &pages, prot)?;
    }
    Ok(MigrateStatus::NothingToDo)
}

/// Give `gpu` device-exclusive access to host-resident pages.
fn service_exclusive(
    space: &VaSpace,
    block: &Arc<VaBlock>,
    state: &mut MutexGuard<'_, BlockState>,
    gpu: ProcessorId,
    region: PageRegion,
    vma: &Vma,
) -> HmmResult<MigrateStatus> {
    if !vma.supports_exclusive() {
        return Err(HmmError::NotSupported(
            "device-exclusive access outside private anonymous memory",
        ));
    }
    let pages = PageMask::from_region(region);
    evict_to_host(space, block, state, &pages)?;

    let token = state.snapshot();
    let (start, end) = block.region_range(region);
    let owner = block.owner();
    let granted = MutexGuard::unlocked(state, || {
        space.host.make_device_exclusive(start, end, owner)
    })?;
    if let Err(stale) = state.validate(token) {
        for (index, frame) in region_pages(region).zip(&granted) {
            if frame.is_some() {
                space.host.release_exclusive(block.page_addr(index), owner);
            }
        }
        return Err(stale.into());
    }

    let mut exclusive = PageMask::new();
    for (index, frame) in region_pages(region).zip(granted) {
        let Some(frame) = frame else {
            continue;
        };
        state.cpu_pages.insert(index, frame);
        exclusive.set(index);
    }
    state.set_resident(ProcessorId::CPU, &exclusive);
    map_pages(space, block, state, gpu, &exclusive, Prot::ReadWriteAtomic)?;

    if pages.andnot(&exclusive).is_empty() {
        Ok(MigrateStatus::NothingToDo)
    } else {
        Err(HmmError::MoreProcessingRequired)
    }
}

fn region_pages(region: PageRegion) -> std::ops::Range<usize> {
    region.first..region.outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HmmConfig;
    use crate::hmm::space::VaSpaceLocked;
    use crate::host::sim::{PteKind, SimHook};
    use crate::host::{InvalidationEvent, VmaKind};
    use crate::page::PhysPage;
    use crate::test_support::{GPU0, GPU1, Harness};
    use crate::utils::BLOCK_SIZE;

    const BASE: u64 = 0x8000_0000;

    fn gpu_page(h: &Harness, gpu: ProcessorId, addr: u64) -> Option<PhysPage> {
        h.mmu.translate(gpu, addr).map(|m| m.page)
    }

    #[test]
    fn gpu_write_then_cpu_read_round_trips_data() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE + 0x3000, b"hello device").unwrap();

        let space = h.space.read();
        space
            .handle_gpu_fault(BASE + 0x3010, GPU0, AccessType::Write)
            .unwrap();

        assert_eq!(h.space.block_count(), 1);
        assert_eq!(h.host.pte_kind(BASE + 0x3000), PteKind::DevicePrivate(GPU0));
        let mapping = h.mmu.translate(GPU0, BASE + 0x3000).unwrap();
        assert_eq!(mapping.prot, Prot::ReadWrite);
        let Some(PhysPage::Gpu(chunk)) = gpu_page(&h, GPU0, BASE + 0x3000) else {
            panic!("GPU0 should map device memory");
        };
        assert_eq!(&chunk.data()[..12], b"hello device");
        chunk.data()[..5].copy_from_slice(b"HELLO");

        let info = space.residency_info(BASE + 0x3000).unwrap();
        assert!(info.resident.contains(GPU0));
        assert!(!info.resident.contains(ProcessorId::CPU));
        assert!(info.mapped.contains(GPU0));

        space.handle_cpu_fault(BASE + 0x3000, false).unwrap();
        assert_eq!(h.host.pte_kind(BASE + 0x3000), PteKind::Present);
        assert_eq!(h.host.read(BASE + 0x3000, 12).unwrap(), b"HELLO device");
        assert!(h.mmu.translate(GPU0, BASE + 0x3000).is_none());
        drop(chunk);
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);

        let info = space.residency_info(BASE + 0x3000).unwrap();
        assert_eq!(info.resident.iter().collect::<Vec<_>>(), vec![ProcessorId::CPU]);
        assert!(info.mapped.is_empty());
        assert!(info.cpu_populated);
    }

    #[test]
    fn preferred_location_directs_data_and_maps_remotely() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.space
            .write()
            .set_preferred_location(BASE, 0x10_000, Some(GPU1), None)
            .unwrap();

        let space = h.space.read();
        space
            .handle_gpu_fault(BASE + 0x1000, GPU0, AccessType::Read)
            .unwrap();
        assert_eq!(h.host.pte_kind(BASE + 0x1000), PteKind::DevicePrivate(GPU1));
        let Some(PhysPage::Gpu(chunk)) = gpu_page(&h, GPU0, BASE + 0x1000) else {
            panic!("GPU0 should map GPU1 memory");
        };
        assert_eq!(chunk.gpu(), GPU1);
        assert!(h.mmu.translate(GPU1, BASE + 0x1000).is_none());

        // Outside the node the default policy applies.
        space
            .handle_gpu_fault(BASE + 0x20_000, GPU0, AccessType::Read)
            .unwrap();
        assert_eq!(h.host.pte_kind(BASE + 0x20_000), PteKind::DevicePrivate(GPU0));
        let info = space.va_range_info(BASE + 0x20_000).unwrap();
        assert!(info.policy.is_default());
        assert_eq!(info.start, BASE + 0x10_000);
    }

    #[test]
    fn cpu_preferred_location_keeps_data_in_host_memory() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.space
            .write()
            .set_preferred_location(BASE, BLOCK_SIZE, Some(ProcessorId::CPU), Some(0))
            .unwrap();
        h.space
            .read()
            .handle_gpu_fault(BASE, GPU0, AccessType::Write)
            .unwrap();
        assert_eq!(h.host.pte_kind(BASE), PteKind::Present);
        assert!(matches!(gpu_page(&h, GPU0, BASE), Some(PhysPage::Host(_))));
    }

    #[test]
    fn munmap_while_unlocked_forces_retry() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        let host = h.host.clone();
        h.host.on_next(SimHook::RangeFault, move || {
            host.munmap(BASE, 0x10_000);
        });

        let space = h.space.read();
        let request = FaultRequest::new(BASE + 0x2000, ProcessorId::CPU, AccessType::Read);
        assert_eq!(
            space.service_fault(&request),
            Err(HmmError::MoreProcessingRequired)
        );
        let block = space.find(BASE).unwrap();
        assert!(block.lock().cpu_pages.is_empty());
        assert_eq!(
            space.handle_cpu_fault(BASE + 0x2000, false),
            Err(HmmError::InvalidAddress(BASE + 0x2000))
        );
    }

    #[test]
    fn racing_invalidation_converges_after_retry() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        let host = h.host.clone();
        h.gpu_memory.on_next_alloc(move || {
            host.invalidate_range(BASE, BASE + BLOCK_SIZE - 1, InvalidationEvent::Invalidate, true);
        });

        let space = h.space.read();
        let request = FaultRequest::new(BASE, GPU0, AccessType::Write);
        assert_eq!(
            space.service_fault(&request),
            Err(HmmError::MoreProcessingRequired)
        );
        assert_eq!(h.host.pte_kind(BASE), PteKind::None);
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);

        space.handle_gpu_fault(BASE, GPU0, AccessType::Write).unwrap();
        assert_eq!(h.host.pte_kind(BASE), PteKind::DevicePrivate(GPU0));
    }

    #[test]
    fn vetoed_page_is_surfaced_then_recovers() {
        let h = Harness::with_config(HmmConfig::new().max_fault_retries(2));
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE, b"pinned").unwrap();
        h.host.pin(BASE);

        let space = h.space.read();
        assert_eq!(
            space.handle_gpu_fault(BASE, GPU0, AccessType::Read),
            Err(HmmError::MoreProcessingRequired)
        );
        assert_eq!(h.host.pte_kind(BASE), PteKind::Present);
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);

        h.host.unpin(BASE);
        space.handle_gpu_fault(BASE, GPU0, AccessType::Read).unwrap();
        assert_eq!(h.host.pte_kind(BASE), PteKind::DevicePrivate(GPU0));
    }

    #[test]
    fn prefetch_window_failures_are_silent() {
        let h = Harness::with_config(HmmConfig::new().fault_prefetch());
        h.mmap(BASE, BLOCK_SIZE);
        let space = h.space.read();
        space
            .handle_gpu_fault(BASE + 0x5000, GPU0, AccessType::Read)
            .unwrap();
        let block = space.find(BASE).unwrap();
        assert_eq!(block.lock().resident_on(GPU0).count(), 16);
        assert_eq!(h.mmu.mapped_pages(GPU0), 16);

        // Second window: the first allocation fails on a speculative page.
        h.gpu_memory.fail_next_alloc();
        space
            .handle_gpu_fault(BASE + 0x1_f000, GPU0, AccessType::Read)
            .unwrap();
        let resident = block.lock().resident_on(GPU0);
        assert!(resident.test(block.page_index(BASE + 0x1_f000)));
        assert!(!resident.test(block.page_index(BASE + 0x1_0000)));
        assert_eq!(resident.count(), 31);
    }

    #[test]
    fn faulting_page_allocation_failure_is_reported() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.gpu_memory.fail_next_alloc();
        assert_eq!(
            h.space.read().handle_gpu_fault(BASE, GPU0, AccessType::Read),
            Err(HmmError::OutOfMemory)
        );
        assert_eq!(h.host.pte_kind(BASE), PteKind::None);
    }

    #[test]
    fn atomic_fault_grants_exclusive_access_until_cpu_touches_it() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE + 0x4000, b"counter").unwrap();

        let space = h.space.read();
        space
            .handle_gpu_fault(BASE + 0x4000, GPU0, AccessType::Atomic)
            .unwrap();
        assert_eq!(h.host.pte_kind(BASE + 0x4000), PteKind::Exclusive);
        let mapping = h.mmu.translate(GPU0, BASE + 0x4000).unwrap();
        assert_eq!(mapping.prot, Prot::ReadWriteAtomic);

        h.host.write(BASE + 0x4000, b"C").unwrap();
        assert_eq!(h.host.pte_kind(BASE + 0x4000), PteKind::Present);
        assert!(h.mmu.translate(GPU0, BASE + 0x4000).is_none());
        assert_eq!(h.host.read(BASE + 0x4000, 7).unwrap(), b"Counter");
    }

    #[test]
    fn atomic_fault_brings_device_data_home_first() {
        let h = Harness::new();
        h.mmap(BASE, BLOCK_SIZE);
        h.host.write(BASE, b"abc").unwrap();
        let space = h.space.read();
        space.handle_gpu_fault(BASE, GPU0, AccessType::Write).unwrap();
        space.handle_gpu_fault(BASE, GPU0, AccessType::Atomic).unwrap();

        assert_eq!(h.host.pte_kind(BASE), PteKind::Exclusive);
        assert_eq!(h.host.frame_at(BASE).unwrap().data()[..3], *b"abc");
        assert_eq!(h.gpu_memory.live_chunks(GPU0), 0);
    }

    #[test]
    fn shared_mappings_are_mapped_remotely_but_never_exclusive() {
        let h = Harness::new();
        h.host
            .mmap(BASE, BLOCK_SIZE, true, true, VmaKind::Shared)
            .unwrap();
        let space = h.space.read();
        space.handle_gpu_fault(BASE, GPU0, AccessType::Write).unwrap();
        assert_eq!(h.host.pte_kind(BASE), PteKind::Present);
        assert!(matches!(gpu_page(&h, GPU0, BASE), Some(PhysPage::Host(_))));

        assert!(matches!(
            space.handle_gpu_fault(BASE, GPU0, AccessType::Atomic),
            Err(HmmError::NotSupported(_))
        ));
    }

    #[test]
    fn fault_checks_access_and_registration() {
        let h = Harness::new();
        h.host
            .mmap(BASE, BLOCK_SIZE, true, false, VmaKind::Anonymous)
            .unwrap();
        let space = h.space.read();
        assert_eq!(
            space.handle_cpu_fault(BASE, true),
            Err(HmmError::InvalidAddress(BASE))
        );
        assert_eq!(
            space.handle_gpu_fault(BASE, ProcessorId::gpu(7), AccessType::Read),
            Err(HmmError::InvalidDevice(ProcessorId::gpu(7)))
        );
        space.handle_gpu_fault(BASE, GPU0, AccessType::Read).unwrap();
        assert_eq!(h.mmu.translate(GPU0, BASE).unwrap().prot, Prot::ReadOnly);
    }
}
