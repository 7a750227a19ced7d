use crate::error::{HmmError, HmmResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// One outstanding asynchronous operation.
#[derive(Debug, Default)]
pub struct TrackerEntry {
    status: Mutex<Option<HmmResult<()>>>,
    done: Condvar,
}

impl TrackerEntry {
    /// Signal completion. Later completions are ignored.
    pub fn complete(&self, result: HmmResult<()>) {
        let mut status = self.status.lock();
        if status.is_none() {
            *status = Some(result);
            self.done.notify_all();
        }
    }

    fn wait(&self) -> HmmResult<()> {
        let mut status = self.status.lock();
        while status.is_none() {
            self.done.wait(&mut status);
        }
        status.clone().unwrap_or(Err(HmmError::Busy))
    }

    fn is_done(&self) -> bool {
        self.status.lock().is_some()
    }
}

/// A set of outstanding asynchronous operations that can be waited on.
///
/// An empty tracker is already complete.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    entries: Vec<Arc<TrackerEntry>>,
}

impl Tracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker with a single pending entry, and the entry used to complete it.
    #[must_use]
    pub fn pending() -> (Self, Arc<TrackerEntry>) {
        let entry = Arc::new(TrackerEntry::default());
        (
            Self {
                entries: vec![entry.clone()],
            },
            entry,
        )
    }

    /// Fold another tracker's work into this one.
    pub fn add(&mut self, other: Self) {
        self.entries.extend(other.entries);
        // Successfully completed entries carry no information.
        self.entries
            .retain(|entry| !matches!(*entry.status.lock(), Some(Ok(()))));
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.entries.iter().all(|entry| entry.is_done())
    }

    /// Block until everything completed, returning the first error seen.
    pub fn wait(&self) -> HmmResult<()> {
        let mut result = Ok(());
        for entry in &self.entries {
            if let Err(e) = entry.wait() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_tracker_is_complete() {
        let tracker = Tracker::new();
        assert!(tracker.is_done());
        assert_eq!(tracker.wait(), Ok(()));
    }

    #[test]
    fn wait_blocks_until_completion() {
        let (tracker, entry) = Tracker::pending();
        assert!(!tracker.is_done());
        let worker = thread::spawn(move || entry.complete(Ok(())));
        assert_eq!(tracker.wait(), Ok(()));
        worker.join().unwrap();
    }

    #[test]
    fn merged_errors_survive() {
        let (mut tracker, ok) = Tracker::pending();
        let (failed, err) = Tracker::pending();
        err.complete(Err(HmmError::OutOfMemory));
        tracker.add(failed);
        ok.complete(Ok(()));
        assert_eq!(tracker.wait(), Err(HmmError::OutOfMemory));
    }
}
