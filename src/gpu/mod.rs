pub mod copy;
pub mod sim;
pub mod tracker;

use crate::error::HmmResult;
use crate::page::{GpuChunk, PhysPage};
use std::fmt;
use std::sync::Arc;

pub use copy::{CopyEngine, CopyOp, MemcpyEngine};
pub use tracker::Tracker;

/// Identifies a processor that can hold or map memory. Zero is the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(u8);

impl ProcessorId {
    pub const CPU: Self = Self(0);
    pub const MAX_PROCESSORS: usize = 64;

    /// The `index`th GPU.
    ///
    /// # Panics
    /// Panics if `index` does not fit in a [`ProcessorMask`].
    #[must_use]
    pub const fn gpu(index: u8) -> Self {
        assert!((index as usize) < Self::MAX_PROCESSORS - 1);
        Self(index + 1)
    }

    #[must_use]
    pub const fn is_cpu(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn gpu_index(self) -> Option<u8> {
        if self.is_cpu() { None } else { Some(self.0 - 1) }
    }

    const fn bit(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gpu_index() {
            None => write!(f, "cpu"),
            Some(index) => write!(f, "gpu{index}"),
        }
    }
}

/// A set of processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ProcessorMask(u64);

impl ProcessorMask {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn with(self, id: ProcessorId) -> Self {
        Self(self.0 | id.bit())
    }

    #[must_use]
    pub const fn without(self, id: ProcessorId) -> Self {
        Self(self.0 & !id.bit())
    }

    pub fn set(&mut self, id: ProcessorId) {
        self.0 |= id.bit();
    }

    pub fn clear(&mut self, id: ProcessorId) {
        self.0 &= !id.bit();
    }

    #[must_use]
    pub const fn contains(self, id: ProcessorId) -> bool {
        self.0 & id.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// The same set with the CPU removed.
    #[must_use]
    pub const fn gpus(self) -> Self {
        self.without(ProcessorId::CPU)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(self) -> impl Iterator<Item = ProcessorId> {
        (0..ProcessorId::MAX_PROCESSORS as u8)
            .map(ProcessorId)
            .filter(move |id| self.contains(*id))
    }
}

impl FromIterator<ProcessorId> for ProcessorMask {
    fn from_iter<I: IntoIterator<Item = ProcessorId>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Access permission of a GPU mapping, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Prot {
    ReadOnly,
    ReadWrite,
    ReadWriteAtomic,
}

/// GPU physical memory manager, as seen by the HMM layer.
///
/// Chunks are returned to the allocator when the last `Arc` is dropped, so the
/// HMM layer only ever releases references.
pub trait GpuMemory: Send + Sync {
    /// Allocate one page-sized chunk of memory on `gpu`.
    fn alloc_chunk(&self, gpu: ProcessorId) -> HmmResult<Arc<GpuChunk>>;
}

/// GPU page-table updates.
pub trait GpuMmu: Send + Sync {
    /// Map one page at `va` on `gpu`.
    fn map(&self, gpu: ProcessorId, va: u64, page: PhysPage, prot: Prot) -> HmmResult<()>;

    /// Remove every translation of `gpu` in `[start, end]`.
    ///
    /// The returned tracker completes once the TLBs are invalidated.
    fn unmap(&self, gpu: ProcessorId, start: u64, end: u64) -> HmmResult<Tracker>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_mask() {
        let gpu0 = ProcessorId::gpu(0);
        let gpu3 = ProcessorId::gpu(3);
        let mask: ProcessorMask = [ProcessorId::CPU, gpu0, gpu3].into_iter().collect();
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.gpus().iter().collect::<Vec<_>>(), vec![gpu0, gpu3]);
        assert!(!mask.without(gpu0).contains(gpu0));
        assert_eq!(gpu3.to_string(), "gpu3");
        assert_eq!(ProcessorId::CPU.to_string(), "cpu");
    }

    #[test]
    fn prot_ordering() {
        assert!(Prot::ReadOnly < Prot::ReadWrite);
        assert!(Prot::ReadWrite < Prot::ReadWriteAtomic);
    }
}
