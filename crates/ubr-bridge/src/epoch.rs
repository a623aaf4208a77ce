//! Epoch-based deferred reclamation.
//!
//! The data plane never takes the control lock. Instead, every frame pins
//! the current epoch for as long as it may hold references obtained from
//! published tables. The control plane unpublishes a record first and then
//! hands the final release to [`Epoch::retire`]; the release runs once the
//! global epoch has moved two steps past the retiring epoch, at which point
//! no reader that could have observed the record is still running.
//!
//! Two reader counters are kept, one per epoch parity. Advancing from `e` to
//! `e + 1` requires the counter for parity `e - 1` to be zero.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

type Release = Box<dyn FnOnce() + Send + 'static>;

struct Retired {
    epoch: u64,
    release: Release,
}

/// Reclamation domain shared by the port table, the VLAN database and the FDB.
pub struct Epoch {
    global: AtomicU64,
    readers: [AtomicUsize; 2],
    retired: Mutex<Vec<Retired>>,
    pending: AtomicUsize,
}

/// A pinned reader. Dropping it ends the read-side critical section.
#[must_use = "the epoch is only pinned while the guard is alive"]
pub struct EpochGuard<'a> {
    domain: &'a Epoch,
    slot: usize,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.domain.readers[self.slot].fetch_sub(1, Ordering::Release);
    }
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            retired: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Current global epoch.
    pub fn current(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    /// Number of retired releases not yet run.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Enters a read-side critical section.
    pub fn pin(&self) -> EpochGuard<'_> {
        loop {
            let epoch = self.global.load(Ordering::SeqCst);
            let slot = (epoch & 1) as usize;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            if self.global.load(Ordering::SeqCst) == epoch {
                return EpochGuard { domain: self, slot };
            }
            // Raced with an advance; the counter we bumped may belong to the
            // parity being drained.
            self.readers[slot].fetch_sub(1, Ordering::Release);
        }
    }

    /// Queues `release` to run once every reader that might observe the
    /// retired object has left its critical section. The object must already
    /// be unreachable from published state.
    pub fn retire<F>(&self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let epoch = self.global.load(Ordering::SeqCst);
        self.retired.lock().push(Retired {
            epoch,
            release: Box::new(release),
        });
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn try_advance(&self) -> bool {
        let epoch = self.global.load(Ordering::SeqCst);
        let draining = ((epoch + 1) & 1) as usize;
        if self.readers[draining].load(Ordering::SeqCst) != 0 {
            return false;
        }
        self.global
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Advances the epoch where possible and runs every release that has
    /// become safe. Never waits for readers. Returns the number of releases run.
    pub fn try_reclaim(&self) -> usize {
        if self.pending() == 0 {
            return 0;
        }

        for _ in 0..2 {
            if !self.try_advance() {
                break;
            }
        }

        let now = self.current();
        let ready: Vec<Retired> = {
            let mut retired = self.retired.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = retired
                .drain(..)
                .partition(|r| r.epoch + 2 <= now);
            *retired = waiting;
            ready
        };

        let count = ready.len();
        for r in ready {
            (r.release)();
        }
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::AcqRel);
            trace!(epoch = now, released = count, "epoch reclaim");
        }
        count
    }

    /// Waits until every queued release has run, or `timeout` elapses.
    ///
    /// Must not be called while the caller holds an [`EpochGuard`].
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.try_reclaim();
            if self.pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Epoch")
            .field("global", &self.current())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_release_runs_without_readers() {
        let epoch = Epoch::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        epoch.retire(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(epoch.pending(), 1);
        assert_eq!(epoch.try_reclaim(), 1);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(epoch.pending(), 0);
    }

    #[test]
    fn test_pinned_reader_delays_release() {
        let epoch = Epoch::new();
        let done = Arc::new(AtomicBool::new(false));

        let guard = epoch.pin();
        let flag = done.clone();
        epoch.retire(move || flag.store(true, Ordering::SeqCst));

        for _ in 0..5 {
            epoch.try_reclaim();
        }
        assert!(!done.load(Ordering::SeqCst));

        drop(guard);
        assert!(epoch.quiesce(Duration::from_secs(1)));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_pinned_after_retire_does_not_block() {
        let epoch = Epoch::new();
        epoch.retire(|| {});
        // One advance happens, then a reader pins the new epoch.
        assert!(epoch.try_advance());
        let _late = epoch.pin();
        // The late reader is in the newer parity and does not hold the
        // retired object back.
        assert!(epoch.try_advance());
        assert_eq!(epoch.try_reclaim(), 1);
    }

    #[test]
    fn test_concurrent_pin_and_reclaim() {
        let epoch = Arc::new(Epoch::new());
        let released = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let epoch = epoch.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _g = epoch.pin();
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let released = released.clone();
            epoch.retire(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
            epoch.try_reclaim();
        }

        for r in readers {
            r.join().unwrap();
        }
        assert!(epoch.quiesce(Duration::from_secs(5)));
        assert_eq!(released.load(Ordering::SeqCst), 100);
    }
}
