//! Shared fixtures for unit tests.

use crate::config::{HmmConfig, SpaceFlags};
use crate::gpu::ProcessorId;
use crate::gpu::copy::MemcpyEngine;
use crate::gpu::sim::{SimGpuMemory, SimGpuMmu};
use crate::hmm::space::VaSpace;
use crate::host::VmaKind;
use crate::host::sim::SimHost;
use std::sync::{Arc, Once};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

pub const GPU0: ProcessorId = ProcessorId::gpu(0);
pub const GPU1: ProcessorId = ProcessorId::gpu(1);

const GPU_PAGES: usize = 4096;

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .try_init();
    });
}

/// A space over simulated host and GPU memory with two GPUs registered.
pub struct Harness {
    pub host: Arc<SimHost>,
    pub gpu_memory: Arc<SimGpuMemory>,
    pub mmu: Arc<SimGpuMmu>,
    pub space: Arc<VaSpace>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HmmConfig::new())
    }

    pub fn with_config(config: HmmConfig) -> Self {
        Self::build(config, MemcpyEngine::inline())
    }

    /// Copies complete on a worker thread, after `submit` has returned.
    pub fn with_background_copies() -> Self {
        Self::build(HmmConfig::new(), MemcpyEngine::background())
    }

    fn build(config: HmmConfig, copy: MemcpyEngine) -> Self {
        init_tracing();
        let host = SimHost::new();
        let gpu_memory = Arc::new(SimGpuMemory::new(GPU_PAGES));
        let mmu = Arc::new(SimGpuMmu::new());
        let space = VaSpace::new(
            config,
            SpaceFlags::default(),
            host.clone(),
            gpu_memory.clone(),
            mmu.clone(),
            Arc::new(copy),
        );
        {
            let mut locked = space.write();
            locked.register_gpu(GPU0).unwrap();
            locked.register_gpu(GPU1).unwrap();
        }
        Self {
            host,
            gpu_memory,
            mmu,
            space,
        }
    }

    /// Map private anonymous read-write memory.
    pub fn mmap(&self, start: u64, len: u64) {
        self.host
            .mmap(start, len, true, true, VmaKind::Anonymous)
            .unwrap();
    }
}
