//! An in-process model of the host memory manager.
//!
//! Tracks VMAs and a per-page table, delivers interval notifications the way
//! the host does (synchronously, on the thread that changes the page tables,
//! never while holding its own locks) and implements the migration and
//! device-exclusive primitives on top of it.

use super::{
    FaultedPage, HostMm, IntervalNotifier, InvalidateResult, InvalidationEvent,
    InvalidationRange, MigrateEntry, MigrateSelect, MigrateVma, NotifierHandle, OwnerToken, Vma,
    VmaKind,
};
use crate::error::{HmmError, HmmResult};
use crate::gpu::ProcessorId;
use crate::page::{GpuChunk, HostFrame, PhysPage};
use crate::utils::{PAGE_SIZE, is_page_aligned, overlaps, page_align_down};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type Hook = Box<dyn FnOnce() + Send>;

/// Points at which a test can run code inside a host primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimHook {
    RangeFault,
    MigrateSetup,
    MakeExclusive,
    AllocPage,
}

enum Pte {
    Present(Arc<HostFrame>),
    Swapped(Box<[u8]>),
    DevicePrivate {
        owner: OwnerToken,
        chunk: Arc<GpuChunk>,
    },
    Exclusive {
        owner: OwnerToken,
        frame: Arc<HostFrame>,
    },
}

/// What a page-table entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteKind {
    None,
    Present,
    Swapped,
    DevicePrivate(ProcessorId),
    Exclusive,
}

struct Registration {
    start: u64,
    end: u64,
    notifier: Arc<dyn IntervalNotifier>,
    // Readers are running callbacks; `false` once unregistered.
    live: Arc<RwLock<bool>>,
}

#[derive(Default)]
struct SimState {
    vmas: BTreeMap<u64, Vma>,
    ptes: BTreeMap<u64, Pte>,
    registrations: BTreeMap<u64, Registration>,
    next_handle: u64,
    // Page -> migration cookie holding it isolated.
    isolated: BTreeMap<u64, u64>,
    pinned: BTreeSet<u64>,
}

impl SimState {
    fn find_vma(&self, addr: u64) -> Option<Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| *vma)
            .filter(|vma| vma.contains(addr))
    }
}

pub struct SimHost {
    state: Mutex<SimState>,
    next_pfn: AtomicU64,
    next_cookie: AtomicU64,
    hooks: Mutex<Vec<(SimHook, Hook)>>,
    fail_alloc: AtomicBool,
}

fn pages(start: u64, end: u64) -> impl Iterator<Item = u64> {
    (start..=end).step_by(PAGE_SIZE as usize)
}

impl SimHost {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
            next_pfn: AtomicU64::new(0x100),
            next_cookie: AtomicU64::new(1),
            hooks: Mutex::new(Vec::new()),
            fail_alloc: AtomicBool::new(false),
        })
    }

    // ===========================================================================================
    // Address space changes
    // ===========================================================================================

    /// Create a VMA over `[start, start + len)`.
    pub fn mmap(
        &self,
        start: u64,
        len: u64,
        readable: bool,
        writable: bool,
        kind: VmaKind,
    ) -> HmmResult<Vma> {
        if len == 0 || !is_page_aligned(start) || !is_page_aligned(len) {
            return Err(HmmError::InvalidArgument(format!(
                "unaligned mapping {start:#x}+{len:#x}"
            )));
        }
        let vma = Vma {
            start,
            end: start + len - 1,
            readable,
            writable,
            kind,
        };

        let mut state = self.state.lock();
        if state
            .vmas
            .values()
            .any(|v| overlaps(v.start, v.end, vma.start, vma.end))
        {
            return Err(HmmError::InvalidArgument(format!(
                "mapping {start:#x}+{len:#x} overlaps an existing one"
            )));
        }
        state.vmas.insert(start, vma);
        Ok(vma)
    }

    /// Remove every mapping in `[start, start + len)`, trimming partially
    /// covered VMAs.
    pub fn munmap(&self, start: u64, len: u64) {
        let end = start + len - 1;
        self.notify(start, end, InvalidationEvent::Unmap, None, true);

        let mut state = self.state.lock();
        let doomed: Vec<u64> = state.ptes.range(start..=end).map(|(&a, _)| a).collect();
        for addr in doomed {
            state.ptes.remove(&addr);
        }

        let hit: Vec<Vma> = state
            .vmas
            .values()
            .filter(|v| overlaps(v.start, v.end, start, end))
            .copied()
            .collect();
        for vma in hit {
            state.vmas.remove(&vma.start);
            if vma.start < start {
                state.vmas.insert(
                    vma.start,
                    Vma {
                        end: start - 1,
                        ..vma
                    },
                );
            }
            if vma.end > end {
                state.vmas.insert(
                    end + 1,
                    Vma {
                        start: end + 1,
                        ..vma
                    },
                );
            }
        }
    }

    /// Push a resident page out to swap.
    pub fn swap_out(&self, addr: u64) {
        let addr = page_align_down(addr);
        let present = matches!(self.state.lock().ptes.get(&addr), Some(Pte::Present(_)));
        if !present {
            return;
        }
        self.notify(addr, addr + PAGE_SIZE - 1, InvalidationEvent::Clear, None, true);

        let mut state = self.state.lock();
        if state.isolated.contains_key(&addr) {
            return;
        }
        if let Some(Pte::Present(frame)) = state.ptes.remove(&addr) {
            let data = frame.data().clone();
            state.ptes.insert(addr, Pte::Swapped(data));
        }
    }

    /// Pinned pages are isolated by migrations but never moved.
    pub fn pin(&self, addr: u64) {
        self.state.lock().pinned.insert(page_align_down(addr));
    }

    pub fn unpin(&self, addr: u64) {
        self.state.lock().pinned.remove(&page_align_down(addr));
    }

    /// Deliver an invalidation with no owner, as an unrelated agent would.
    pub fn invalidate_range(
        &self,
        start: u64,
        end: u64,
        event: InvalidationEvent,
        blockable: bool,
    ) -> InvalidateResult {
        self.notify(start, end, event, None, blockable)
    }

    // ===========================================================================================
    // CPU access
    // ===========================================================================================

    /// Store `bytes` at `addr` as the CPU would.
    ///
    /// # Errors
    /// `InvalidAddress` without a writable mapping, `Busy` if a page lives in
    /// device memory (the driver's CPU fault handler must bring it back first).
    pub fn write(&self, addr: u64, bytes: &[u8]) -> HmmResult<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let va = addr + offset as u64;
            let page = page_align_down(va);
            #[allow(clippy::cast_possible_truncation)]
            let in_page = (va - page) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let len = (PAGE_SIZE as usize - in_page).min(bytes.len() - offset);

            let frame = self.cpu_page(page, true)?;
            frame.data()[in_page..in_page + len].copy_from_slice(&bytes[offset..offset + len]);
            offset += len;
        }
        Ok(())
    }

    /// Load `len` bytes from `addr` as the CPU would.
    pub fn read(&self, addr: u64, len: usize) -> HmmResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let va = addr + out.len() as u64;
            let page = page_align_down(va);
            #[allow(clippy::cast_possible_truncation)]
            let in_page = (va - page) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let take = (PAGE_SIZE as usize - in_page).min(len - out.len());

            let frame = self.cpu_page(page, false)?;
            out.extend_from_slice(&frame.data()[in_page..in_page + take]);
        }
        Ok(out)
    }

    fn cpu_page(&self, page: u64, write: bool) -> HmmResult<Arc<HostFrame>> {
        let (frame, restored) = {
            let mut state = self.state.lock();
            let allowed = state
                .find_vma(page)
                .is_some_and(|v| v.readable && (!write || v.writable));
            if !allowed {
                return Err(HmmError::InvalidAddress(page));
            }
            match state.ptes.remove(&page) {
                None => {
                    let frame = self.new_frame(0);
                    state.ptes.insert(page, Pte::Present(frame.clone()));
                    (frame, false)
                }
                Some(Pte::Present(frame)) => {
                    state.ptes.insert(page, Pte::Present(frame.clone()));
                    (frame, false)
                }
                Some(Pte::Swapped(data)) => {
                    let frame = self.new_frame(0);
                    frame.data().copy_from_slice(&data);
                    state.ptes.insert(page, Pte::Present(frame.clone()));
                    (frame, false)
                }
                Some(Pte::Exclusive { frame, .. }) => {
                    state.ptes.insert(page, Pte::Present(frame.clone()));
                    (frame, true)
                }
                Some(pte @ Pte::DevicePrivate { .. }) => {
                    state.ptes.insert(page, pte);
                    return Err(HmmError::Busy);
                }
            }
        };

        if restored {
            // Revoking device-exclusive access has no owner.
            self.notify(page, page + PAGE_SIZE - 1, InvalidationEvent::Exclusive, None, true);
        }
        Ok(frame)
    }

    // ===========================================================================================
    // Introspection and test hooks
    // ===========================================================================================

    #[must_use]
    pub fn pte_kind(&self, addr: u64) -> PteKind {
        match self.state.lock().ptes.get(&page_align_down(addr)) {
            None => PteKind::None,
            Some(Pte::Present(_)) => PteKind::Present,
            Some(Pte::Swapped(_)) => PteKind::Swapped,
            Some(Pte::DevicePrivate { chunk, .. }) => PteKind::DevicePrivate(chunk.gpu()),
            Some(Pte::Exclusive { .. }) => PteKind::Exclusive,
        }
    }

    /// The host frame currently mapped at `addr`, if any.
    #[must_use]
    pub fn frame_at(&self, addr: u64) -> Option<Arc<HostFrame>> {
        match self.state.lock().ptes.get(&page_align_down(addr)) {
            Some(Pte::Present(frame) | Pte::Exclusive { frame, .. }) => Some(frame.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn notifier_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    /// Run `hook` the next time `point` is reached.
    pub fn on_next(&self, point: SimHook, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().push((point, Box::new(hook)));
    }

    pub fn fail_next_alloc(&self) {
        self.fail_alloc.store(true, Ordering::SeqCst);
    }

    fn run_hook(&self, point: SimHook) {
        let hook = {
            let mut hooks = self.hooks.lock();
            hooks
                .iter()
                .position(|(p, _)| *p == point)
                .map(|i| hooks.remove(i).1)
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn new_frame(&self, nid: i32) -> Arc<HostFrame> {
        Arc::new(HostFrame::new(
            self.next_pfn.fetch_add(1, Ordering::Relaxed),
            nid,
        ))
    }

    fn notify(
        &self,
        start: u64,
        end: u64,
        event: InvalidationEvent,
        owner: Option<OwnerToken>,
        blockable: bool,
    ) -> InvalidateResult {
        let targets: Vec<_> = {
            let state = self.state.lock();
            state
                .registrations
                .values()
                .filter(|r| overlaps(r.start, r.end, start, end))
                .map(|r| (r.notifier.clone(), r.live.clone()))
                .collect()
        };

        let range = InvalidationRange {
            start,
            end,
            event,
            owner,
            blockable,
        };
        let mut result = InvalidateResult::Handled;
        for (notifier, live) in targets {
            let live = live.read_recursive();
            if *live && notifier.invalidate(&range) == InvalidateResult::Again {
                result = InvalidateResult::Again;
            }
        }
        result
    }
}

impl HostMm for SimHost {
    fn find_vma(&self, addr: u64) -> Option<Vma> {
        self.state.lock().find_vma(addr)
    }

    fn alloc_page(&self, nid: Option<i32>) -> HmmResult<Arc<HostFrame>> {
        self.run_hook(SimHook::AllocPage);
        if self.fail_alloc.swap(false, Ordering::SeqCst) {
            return Err(HmmError::OutOfMemory);
        }
        Ok(self.new_frame(nid.unwrap_or(0)))
    }

    fn range_fault(
        &self,
        start: u64,
        end: u64,
        write: bool,
        owner: OwnerToken,
    ) -> HmmResult<Vec<FaultedPage>> {
        self.run_hook(SimHook::RangeFault);

        let exclusive: Vec<u64> = {
            let state = self.state.lock();
            state
                .ptes
                .range(start..=end)
                .filter(|(_, pte)| matches!(pte, Pte::Exclusive { .. }))
                .map(|(&addr, _)| addr)
                .collect()
        };
        for addr in exclusive {
            // Faulting on a device-exclusive entry restores it first.
            let _ = self.cpu_page(addr, false);
        }

        let mut state = self.state.lock();
        let mut out = Vec::new();
        for addr in pages(start, end) {
            let allowed = state
                .find_vma(addr)
                .is_some_and(|v| v.readable && (!write || v.writable));
            if !allowed || state.isolated.contains_key(&addr) {
                let err = if allowed {
                    HmmError::Busy
                } else {
                    HmmError::InvalidAddress(addr)
                };
                out.push(FaultedPage::Error(err));
                continue;
            }

            let page = match state.ptes.remove(&addr) {
                None => {
                    let frame = self.new_frame(0);
                    state.ptes.insert(addr, Pte::Present(frame.clone()));
                    FaultedPage::Host(frame)
                }
                Some(Pte::Present(frame) | Pte::Exclusive { frame, .. }) => {
                    state.ptes.insert(addr, Pte::Present(frame.clone()));
                    FaultedPage::Host(frame)
                }
                Some(Pte::Swapped(data)) => {
                    let frame = self.new_frame(0);
                    frame.data().copy_from_slice(&data);
                    state.ptes.insert(addr, Pte::Present(frame.clone()));
                    FaultedPage::Host(frame)
                }
                Some(Pte::DevicePrivate { owner: o, chunk }) => {
                    let page = if o == owner {
                        FaultedPage::DevicePrivate(chunk.clone())
                    } else {
                        FaultedPage::Error(HmmError::Busy)
                    };
                    state
                        .ptes
                        .insert(addr, Pte::DevicePrivate { owner: o, chunk });
                    page
                }
            };
            out.push(page);
        }
        Ok(out)
    }

    fn migrate_setup(
        &self,
        start: u64,
        end: u64,
        select: MigrateSelect,
        owner: OwnerToken,
    ) -> HmmResult<MigrateVma> {
        if start > end || !is_page_aligned(start) || !is_page_aligned(end + 1) {
            return Err(HmmError::InvalidArgument(format!(
                "bad migration range {start:#x}-{end:#x}"
            )));
        }
        self.run_hook(SimHook::MigrateSetup);
        self.notify(start, end, InvalidationEvent::Migrate, Some(owner), true);

        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let mut entries = Vec::new();
        for addr in pages(start, end) {
            let mut entry = MigrateEntry::default();
            let migratable = state.find_vma(addr).is_some_and(|v| v.is_migratable());
            if migratable && !state.isolated.contains_key(&addr) {
                match state.ptes.get(&addr) {
                    None if select.system => entry.migrate = true,
                    Some(Pte::Present(frame)) if select.system => {
                        entry.src = Some(PhysPage::Host(frame.clone()));
                        entry.migrate = true;
                    }
                    Some(Pte::DevicePrivate { owner: o, chunk })
                        if select.device_private && *o == owner =>
                    {
                        entry.src = Some(PhysPage::Gpu(chunk.clone()));
                        entry.migrate = true;
                    }
                    _ => {}
                }
            }
            if entry.migrate {
                state.isolated.insert(addr, cookie);
            }
            entries.push(entry);
        }

        Ok(MigrateVma {
            start,
            end,
            owner,
            cookie,
            entries,
        })
    }

    fn migrate_pages(&self, migrate: &mut MigrateVma) {
        let mut state = self.state.lock();
        let owner = migrate.owner;
        for (addr, entry) in pages(migrate.start, migrate.end).zip(migrate.entries.iter_mut()) {
            if !entry.migrate {
                continue;
            }
            let Some(dst) = entry.dst.clone() else {
                entry.migrate = false;
                continue;
            };

            let unchanged = match (state.ptes.get(&addr), &entry.src) {
                (None, None) => true,
                (Some(Pte::Present(frame)), Some(PhysPage::Host(src))) => Arc::ptr_eq(frame, src),
                (Some(Pte::DevicePrivate { chunk, .. }), Some(PhysPage::Gpu(src))) => {
                    Arc::ptr_eq(chunk, src)
                }
                _ => false,
            };
            let mapped = state.find_vma(addr).is_some();
            if !mapped || !unchanged || state.pinned.contains(&addr) {
                entry.migrate = false;
                continue;
            }

            let pte = match dst {
                PhysPage::Host(frame) => Pte::Present(frame),
                PhysPage::Gpu(chunk) => Pte::DevicePrivate { owner, chunk },
            };
            state.ptes.insert(addr, pte);
        }
    }

    fn migrate_finalize(&self, migrate: MigrateVma) {
        let mut state = self.state.lock();
        for addr in pages(migrate.start, migrate.end) {
            if state.isolated.get(&addr) == Some(&migrate.cookie) {
                state.isolated.remove(&addr);
            }
        }
    }

    fn make_device_exclusive(
        &self,
        start: u64,
        end: u64,
        owner: OwnerToken,
    ) -> HmmResult<Vec<Option<Arc<HostFrame>>>> {
        self.run_hook(SimHook::MakeExclusive);
        {
            let state = self.state.lock();
            for addr in pages(start, end) {
                let vma = state
                    .find_vma(addr)
                    .ok_or(HmmError::InvalidAddress(addr))?;
                if !vma.supports_exclusive() {
                    return Err(HmmError::NotSupported("device exclusive access"));
                }
            }
        }
        self.notify(start, end, InvalidationEvent::Exclusive, Some(owner), true);

        let mut state = self.state.lock();
        let mut granted = Vec::new();
        for addr in pages(start, end) {
            if state.isolated.contains_key(&addr) {
                granted.push(None);
                continue;
            }
            let frame = match state.ptes.remove(&addr) {
                None => Some(self.new_frame(0)),
                Some(Pte::Present(frame)) => Some(frame),
                Some(Pte::Swapped(data)) => {
                    let frame = self.new_frame(0);
                    frame.data().copy_from_slice(&data);
                    Some(frame)
                }
                Some(Pte::Exclusive { owner: o, frame }) if o == owner => Some(frame),
                Some(other) => {
                    state.ptes.insert(addr, other);
                    None
                }
            };
            if let Some(frame) = &frame {
                state.ptes.insert(
                    addr,
                    Pte::Exclusive {
                        owner,
                        frame: frame.clone(),
                    },
                );
            }
            granted.push(frame);
        }
        Ok(granted)
    }

    fn release_exclusive(&self, addr: u64, owner: OwnerToken) {
        let mut state = self.state.lock();
        let addr = page_align_down(addr);
        match state.ptes.remove(&addr) {
            Some(Pte::Exclusive { owner: o, frame }) if o == owner => {
                state.ptes.insert(addr, Pte::Present(frame));
            }
            Some(other) => {
                state.ptes.insert(addr, other);
            }
            None => {}
        }
    }

    fn register_notifier(
        &self,
        start: u64,
        end: u64,
        notifier: Arc<dyn IntervalNotifier>,
    ) -> HmmResult<NotifierHandle> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let id = state.next_handle;
        state.registrations.insert(
            id,
            Registration {
                start,
                end,
                notifier,
                live: Arc::new(RwLock::new(true)),
            },
        );
        Ok(NotifierHandle(id))
    }

    fn unregister_notifier(&self, handle: NotifierHandle) {
        let registration = self.state.lock().registrations.remove(&handle.0);
        if let Some(registration) = registration {
            // Waits for callbacks that already picked this registration up.
            *registration.live.write() = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x10_0000;

    fn host_with_anon() -> Arc<SimHost> {
        let host = SimHost::new();
        host.mmap(BASE, 16 * PAGE_SIZE, true, true, VmaKind::Anonymous)
            .unwrap();
        host
    }

    #[test]
    fn write_read_and_swap() {
        let host = host_with_anon();
        host.write(BASE + 10, b"abc").unwrap();
        assert_eq!(host.pte_kind(BASE), PteKind::Present);
        host.swap_out(BASE);
        assert_eq!(host.pte_kind(BASE), PteKind::Swapped);
        assert_eq!(host.read(BASE + 10, 3).unwrap(), b"abc");
        assert_eq!(host.pte_kind(BASE), PteKind::Present);
    }

    #[test]
    fn munmap_trims_vma() {
        let host = host_with_anon();
        host.munmap(BASE + 4 * PAGE_SIZE, 4 * PAGE_SIZE);
        assert!(host.find_vma(BASE).is_some());
        assert!(host.find_vma(BASE + 4 * PAGE_SIZE).is_none());
        assert_eq!(
            host.find_vma(BASE + 8 * PAGE_SIZE).map(|v| v.start),
            Some(BASE + 8 * PAGE_SIZE)
        );
        assert!(host.write(BASE + 5 * PAGE_SIZE, b"x").is_err());
    }

    #[test]
    fn migration_to_device_and_back() {
        let host = host_with_anon();
        let owner = OwnerToken::new();
        let gpu = ProcessorId::gpu(0);
        host.write(BASE, b"data").unwrap();

        let mut migrate = host
            .migrate_setup(BASE, BASE + PAGE_SIZE - 1, MigrateSelect::TO_DEVICE, owner)
            .unwrap();
        assert_eq!(migrate.isolated(), 1);
        let chunk = Arc::new(GpuChunk::new(gpu, 0));
        let src = migrate.entries[0].src.clone().unwrap();
        PhysPage::Gpu(chunk.clone()).write(&src.read());
        migrate.entries[0].dst = Some(PhysPage::Gpu(chunk));
        host.migrate_pages(&mut migrate);
        assert!(migrate.entries[0].migrate);
        host.migrate_finalize(migrate);
        assert_eq!(host.pte_kind(BASE), PteKind::DevicePrivate(gpu));
        assert_eq!(host.read(BASE, 4), Err(HmmError::Busy));

        let faulted = host
            .range_fault(BASE, BASE + PAGE_SIZE - 1, false, owner)
            .unwrap();
        assert!(matches!(faulted[0], FaultedPage::DevicePrivate(_)));
    }

    #[test]
    fn pinned_pages_are_vetoed() {
        let host = host_with_anon();
        let owner = OwnerToken::new();
        host.write(BASE, b"x").unwrap();
        host.pin(BASE);

        let mut migrate = host
            .migrate_setup(BASE, BASE + PAGE_SIZE - 1, MigrateSelect::TO_DEVICE, owner)
            .unwrap();
        migrate.entries[0].dst = Some(PhysPage::Gpu(Arc::new(GpuChunk::new(
            ProcessorId::gpu(0),
            0,
        ))));
        host.migrate_pages(&mut migrate);
        assert!(!migrate.entries[0].migrate);
        host.migrate_finalize(migrate);
        assert_eq!(host.pte_kind(BASE), PteKind::Present);
    }

    #[test]
    fn exclusive_rejected_on_shared_mapping() {
        let host = SimHost::new();
        host.mmap(BASE, PAGE_SIZE, true, true, VmaKind::Shared)
            .unwrap();
        let err = host
            .make_device_exclusive(BASE, BASE + PAGE_SIZE - 1, OwnerToken::new())
            .unwrap_err();
        assert!(matches!(err, HmmError::NotSupported(_)));
    }
}
