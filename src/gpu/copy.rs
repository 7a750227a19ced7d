use super::tracker::Tracker;
use crate::error::HmmResult;
use crate::page::PhysPage;
use std::thread;

/// One page worth of copy-engine work.
#[derive(Debug, Clone)]
pub enum CopyOp {
    Copy { src: PhysPage, dst: PhysPage },
    Zero { dst: PhysPage },
}

impl CopyOp {
    fn execute(&self) {
        match self {
            Self::Copy { src, dst } => {
                if !src.same_page(dst) {
                    dst.write(&src.read());
                }
            }
            Self::Zero { dst } => dst.zero(),
        }
    }
}

/// Asynchronous page copies.
pub trait CopyEngine: Send + Sync {
    /// Queue `ops`; the returned tracker completes when all of them landed.
    fn submit(&self, ops: Vec<CopyOp>) -> HmmResult<Tracker>;
}

/// CPU `memcpy` backed copy engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemcpyEngine {
    background: bool,
}

impl MemcpyEngine {
    /// Copies complete before `submit` returns.
    #[must_use]
    pub const fn inline() -> Self {
        Self { background: false }
    }

    /// Copies run on a worker thread; callers must wait on the tracker.
    #[must_use]
    pub const fn background() -> Self {
        Self { background: true }
    }
}

impl CopyEngine for MemcpyEngine {
    fn submit(&self, ops: Vec<CopyOp>) -> HmmResult<Tracker> {
        if ops.is_empty() {
            return Ok(Tracker::new());
        }

        if !self.background {
            ops.iter().for_each(CopyOp::execute);
            return Ok(Tracker::new());
        }

        let (tracker, entry) = Tracker::pending();
        thread::spawn(move || {
            ops.iter().for_each(CopyOp::execute);
            // Pages are released by the time waiters wake.
            drop(ops);
            entry.complete(Ok(()));
        });
        Ok(tracker)
    }
}
