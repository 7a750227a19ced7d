//! Handles to physical pages on either side of a migration.

use crate::gpu::ProcessorId;
use crate::hmm::block::VaBlock;
use crate::utils::PAGE_SIZE;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};

#[allow(clippy::cast_possible_truncation)]
fn zeroed_page() -> Box<[u8]> {
    vec![0u8; PAGE_SIZE as usize].into_boxed_slice()
}

/// A page of host (CPU) memory.
pub struct HostFrame {
    pfn: u64,
    nid: i32,
    data: Mutex<Box<[u8]>>,
}

impl HostFrame {
    #[must_use]
    pub fn new(pfn: u64, nid: i32) -> Self {
        Self {
            pfn,
            nid,
            data: Mutex::new(zeroed_page()),
        }
    }

    #[must_use]
    pub const fn pfn(&self) -> u64 {
        self.pfn
    }

    /// NUMA node the frame was allocated from.
    #[must_use]
    pub const fn nid(&self) -> i32 {
        self.nid
    }

    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }
}

impl fmt::Debug for HostFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFrame")
            .field("pfn", &format_args!("{:#x}", self.pfn))
            .field("nid", &self.nid)
            .finish_non_exhaustive()
    }
}

/// Reverse mapping from a GPU chunk to the block page that holds it.
#[derive(Debug, Clone)]
pub struct ChunkOwner {
    pub block: Weak<VaBlock>,
    pub page_index: usize,
}

/// A page-sized chunk of GPU memory handed out by the PMM.
pub struct GpuChunk {
    gpu: ProcessorId,
    address: u64,
    data: Mutex<Box<[u8]>>,
    owner: Mutex<Option<ChunkOwner>>,
}

impl GpuChunk {
    #[must_use]
    pub fn new(gpu: ProcessorId, address: u64) -> Self {
        Self {
            gpu,
            address,
            data: Mutex::new(zeroed_page()),
            owner: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn gpu(&self) -> ProcessorId {
        self.gpu
    }

    /// Physical address within the GPU's memory.
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    #[must_use]
    pub fn owner(&self) -> Option<ChunkOwner> {
        self.owner.lock().clone()
    }

    pub fn set_owner(&self, owner: Option<ChunkOwner>) {
        *self.owner.lock() = owner;
    }
}

impl fmt::Debug for GpuChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuChunk")
            .field("gpu", &self.gpu)
            .field("address", &format_args!("{:#x}", self.address))
            .finish_non_exhaustive()
    }
}

/// Either kind of physical page.
#[derive(Debug, Clone)]
pub enum PhysPage {
    Host(Arc<HostFrame>),
    Gpu(Arc<GpuChunk>),
}

impl PhysPage {
    #[must_use]
    pub fn processor(&self) -> ProcessorId {
        match self {
            Self::Host(_) => ProcessorId::CPU,
            Self::Gpu(chunk) => chunk.gpu(),
        }
    }

    /// Both handles name the same physical page.
    #[must_use]
    pub fn same_page(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Host(a), Self::Host(b)) => Arc::ptr_eq(a, b),
            (Self::Gpu(a), Self::Gpu(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    #[must_use]
    pub fn read(&self) -> Vec<u8> {
        match self {
            Self::Host(frame) => frame.data().to_vec(),
            Self::Gpu(chunk) => chunk.data().to_vec(),
        }
    }

    /// Overwrite the page. `bytes` shorter than a page leaves the tail untouched.
    pub fn write(&self, bytes: &[u8]) {
        let mut data = match self {
            Self::Host(frame) => frame.data(),
            Self::Gpu(chunk) => chunk.data(),
        };
        let len = bytes.len().min(data.len());
        data[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn zero(&self) {
        let mut data = match self {
            Self::Host(frame) => frame.data(),
            Self::Gpu(chunk) => chunk.data(),
        };
        data.fill(0);
    }
}
