//! In-process GPU memory and page-table models.

use super::tracker::Tracker;
use super::{GpuMemory, GpuMmu, ProcessorId, Prot};
use crate::error::{HmmError, HmmResult};
use crate::page::{GpuChunk, PhysPage};
use crate::utils::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Hook = Box<dyn FnOnce() + Send>;

/// A fixed-capacity GPU memory pool per GPU.
pub struct SimGpuMemory {
    capacity_pages: usize,
    next_address: AtomicU64,
    chunks: Mutex<BTreeMap<ProcessorId, Vec<Weak<GpuChunk>>>>,
    fail_next: AtomicBool,
    hook: Mutex<Option<Hook>>,
}

impl SimGpuMemory {
    #[must_use]
    pub fn new(capacity_pages: usize) -> Self {
        Self {
            capacity_pages,
            next_address: AtomicU64::new(0),
            chunks: Mutex::new(BTreeMap::new()),
            fail_next: AtomicBool::new(false),
            hook: Mutex::new(None),
        }
    }

    /// Chunks on `gpu` still referenced by someone.
    #[must_use]
    pub fn live_chunks(&self, gpu: ProcessorId) -> usize {
        self.chunks
            .lock()
            .get(&gpu)
            .map_or(0, |chunks| chunks.iter().filter(|c| c.strong_count() > 0).count())
    }

    /// Make the next allocation fail with `OutOfMemory`.
    pub fn fail_next_alloc(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Run `hook` at the start of the next allocation.
    pub fn on_next_alloc(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl GpuMemory for SimGpuMemory {
    fn alloc_chunk(&self, gpu: ProcessorId) -> HmmResult<Arc<GpuChunk>> {
        if let Some(hook) = self.hook.lock().take() {
            hook();
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(HmmError::OutOfMemory);
        }

        let mut chunks = self.chunks.lock();
        let list = chunks.entry(gpu).or_default();
        list.retain(|c| c.strong_count() > 0);
        if list.len() >= self.capacity_pages {
            return Err(HmmError::OutOfMemory);
        }

        let address = self.next_address.fetch_add(PAGE_SIZE, Ordering::Relaxed);
        let chunk = Arc::new(GpuChunk::new(gpu, address));
        list.push(Arc::downgrade(&chunk));
        Ok(chunk)
    }
}

/// One GPU page-table entry.
#[derive(Debug, Clone)]
pub struct GpuMapping {
    pub page: PhysPage,
    pub prot: Prot,
}

/// GPU page tables for every GPU, keyed by `(gpu, va)`.
#[derive(Default)]
pub struct SimGpuMmu {
    mappings: Mutex<BTreeMap<(ProcessorId, u64), GpuMapping>>,
    fail_unmap: AtomicBool,
}

impl SimGpuMmu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn translate(&self, gpu: ProcessorId, va: u64) -> Option<GpuMapping> {
        self.mappings.lock().get(&(gpu, va)).cloned()
    }

    #[must_use]
    pub fn mapped_pages(&self, gpu: ProcessorId) -> usize {
        self.mappings.lock().keys().filter(|(g, _)| *g == gpu).count()
    }

    /// Make every following unmap fail.
    pub fn fail_unmaps(&self) {
        self.fail_unmap.store(true, Ordering::SeqCst);
    }
}

impl GpuMmu for SimGpuMmu {
    fn map(&self, gpu: ProcessorId, va: u64, page: PhysPage, prot: Prot) -> HmmResult<()> {
        self.mappings
            .lock()
            .insert((gpu, va), GpuMapping { page, prot });
        Ok(())
    }

    fn unmap(&self, gpu: ProcessorId, start: u64, end: u64) -> HmmResult<Tracker> {
        if self.fail_unmap.load(Ordering::SeqCst) {
            return Err(HmmError::Busy);
        }
        self.mappings
            .lock()
            .retain(|&(g, va), _| g != gpu || va < start || va > end);
        Ok(Tracker::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_release() {
        let gpu = ProcessorId::gpu(0);
        let memory = SimGpuMemory::new(2);
        let a = memory.alloc_chunk(gpu).unwrap();
        let _b = memory.alloc_chunk(gpu).unwrap();
        assert_eq!(memory.alloc_chunk(gpu).unwrap_err(), HmmError::OutOfMemory);
        drop(a);
        assert_eq!(memory.live_chunks(gpu), 1);
        assert!(memory.alloc_chunk(gpu).is_ok());
    }

    #[test]
    fn unmap_clears_range_only() {
        let gpu = ProcessorId::gpu(1);
        let mmu = SimGpuMmu::new();
        let chunk = Arc::new(GpuChunk::new(gpu, 0));
        for va in [0x1000, 0x2000, 0x3000] {
            mmu.map(gpu, va, PhysPage::Gpu(chunk.clone()), Prot::ReadWrite)
                .unwrap();
        }
        mmu.unmap(gpu, 0x2000, 0x2fff).unwrap().wait().unwrap();
        assert!(mmu.translate(gpu, 0x1000).is_some());
        assert!(mmu.translate(gpu, 0x2000).is_none());
        assert_eq!(mmu.mapped_pages(gpu), 2);
    }
}
