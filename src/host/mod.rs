//! The host virtual memory manager, as used by the HMM layer.

pub mod notifier;
pub mod sim;

use crate::error::{HmmError, HmmResult};
use crate::page::{GpuChunk, HostFrame, PhysPage};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of memory behind a VMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// Private anonymous memory. The only kind pages can migrate out of.
    Anonymous,
    /// Shared or file backed memory.
    Shared,
    /// `VM_PFNMAP`, `VM_MIXEDMAP`, hugetlbfs and similar special mappings.
    Special,
}

/// A host virtual memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub kind: VmaKind,
}

impl Vma {
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.end
    }

    #[must_use]
    pub fn is_migratable(&self) -> bool {
        self.kind == VmaKind::Anonymous
    }

    /// Device-exclusive entries cannot be installed in shared or special mappings.
    #[must_use]
    pub fn supports_exclusive(&self) -> bool {
        self.kind == VmaKind::Anonymous
    }
}

/// Identifies who caused a host page-table change.
///
/// Each address space hands its own token to the migration and exclusive access
/// primitives so it can recognize the invalidations it caused itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerToken(u64);

impl OwnerToken {
    #[must_use]
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the host is invalidating a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// Generic page-table change.
    Invalidate,
    /// The range is being unmapped.
    Unmap,
    /// Pages are being cleared, e.g. by reclaim.
    Clear,
    /// Soft-dirty tracking; no translation change.
    SoftDirty,
    /// The whole address space is going away; an `Unmap` follows.
    Release,
    /// Pages are being made exclusive to a device.
    Exclusive,
    /// Pages are being isolated for migration.
    Migrate,
}

impl InvalidationEvent {
    /// Host pages in the range are going away and must be queried again.
    #[must_use]
    pub const fn drops_host_pages(self) -> bool {
        matches!(self, Self::Unmap | Self::Clear)
    }
}

/// A single notification delivered to an [`IntervalNotifier`].
#[derive(Debug, Clone, Copy)]
pub struct InvalidationRange {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub event: InvalidationEvent,
    /// Set for `Migrate` and `Exclusive` events started by a device driver.
    pub owner: Option<OwnerToken>,
    /// The callback is allowed to sleep.
    pub blockable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateResult {
    Handled,
    /// The callback would have to block; the host retries from a sleepable context.
    Again,
}

/// Receives invalidations for a registered interval.
pub trait IntervalNotifier: Send + Sync {
    fn invalidate(&self, range: &InvalidationRange) -> InvalidateResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierHandle(pub u64);

/// Per-page result of [`HostMm::range_fault`].
#[derive(Debug, Clone)]
pub enum FaultedPage {
    Host(Arc<HostFrame>),
    /// The page lives in device-private memory owned by the requester.
    DevicePrivate(Arc<GpuChunk>),
    Error(HmmError),
}

/// Which source pages [`HostMm::migrate_setup`] collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateSelect {
    pub system: bool,
    pub device_private: bool,
}

impl MigrateSelect {
    pub const TO_DEVICE: Self = Self {
        system: true,
        device_private: true,
    };
    pub const TO_HOST: Self = Self {
        system: false,
        device_private: true,
    };
}

/// One page of a migration.
#[derive(Debug, Clone, Default)]
pub struct MigrateEntry {
    /// `None` for a page that was never populated; the destination is zero filled.
    pub src: Option<PhysPage>,
    /// Set by the host when the page was isolated, cleared if it refuses to move it.
    pub migrate: bool,
    /// Destination page supplied by the driver.
    pub dst: Option<PhysPage>,
}

/// A migration in flight between `migrate_setup` and `migrate_finalize`.
#[derive(Debug)]
pub struct MigrateVma {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub owner: OwnerToken,
    /// Host private; identifies the pages this migration holds isolated.
    pub cookie: u64,
    pub entries: Vec<MigrateEntry>,
}

impl MigrateVma {
    /// Number of pages the host isolated.
    #[must_use]
    pub fn isolated(&self) -> usize {
        self.entries.iter().filter(|e| e.migrate).count()
    }
}

/// Host memory management primitives.
pub trait HostMm: Send + Sync {
    fn find_vma(&self, addr: u64) -> Option<Vma>;

    /// Allocate a host page, optionally on a specific NUMA node.
    fn alloc_page(&self, nid: Option<i32>) -> HmmResult<Arc<HostFrame>>;

    /// Make `[start, end]` present in host page tables, faulting as needed.
    ///
    /// May sleep. Pages in device-private memory of `owner` are reported
    /// rather than faulted back.
    fn range_fault(
        &self,
        start: u64,
        end: u64,
        write: bool,
        owner: OwnerToken,
    ) -> HmmResult<Vec<FaultedPage>>;

    /// Isolate and lock the source pages of `[start, end]`.
    ///
    /// Delivers a `Migrate` invalidation tagged with `owner` before collecting.
    fn migrate_setup(
        &self,
        start: u64,
        end: u64,
        select: MigrateSelect,
        owner: OwnerToken,
    ) -> HmmResult<MigrateVma>;

    /// Install the destination pages. Clears `migrate` for pages the host refused.
    fn migrate_pages(&self, migrate: &mut MigrateVma);

    /// Unlock everything and drop the references to whichever side lost.
    fn migrate_finalize(&self, migrate: MigrateVma);

    /// Give a device exclusive access to `[start, end]`.
    ///
    /// Returns the granted host page for each page, or `None` where access
    /// was not granted.
    fn make_device_exclusive(
        &self,
        start: u64,
        end: u64,
        owner: OwnerToken,
    ) -> HmmResult<Vec<Option<Arc<HostFrame>>>>;

    /// Restore normal CPU access to a page made exclusive by `owner`.
    fn release_exclusive(&self, addr: u64, owner: OwnerToken);

    fn register_notifier(
        &self,
        start: u64,
        end: u64,
        notifier: Arc<dyn IntervalNotifier>,
    ) -> HmmResult<NotifierHandle>;

    /// Remove a registration, waiting for in-flight callbacks to return.
    fn unregister_notifier(&self, handle: NotifierHandle);
}
