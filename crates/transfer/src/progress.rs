use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked with the cumulative number of bytes transferred.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Cumulative byte counter shared by every chunk worker of one transfer.
///
/// Chunks complete in any order, but the callback only ever sees a
/// non-decreasing sequence capped at the total size: the increment and the
/// notification happen under the same lock.
pub struct ProgressState {
    completed: AtomicU64,
    inner: Mutex<Reported>,
    callback: Option<ProgressCallback>,
}

struct Reported {
    total: Option<u64>,
    last: u64,
}

impl ProgressState {
    pub fn new(total: Option<u64>, callback: Option<ProgressCallback>) -> Self {
        Self {
            completed: AtomicU64::new(0),
            inner: Mutex::new(Reported { total, last: 0 }),
            callback,
        }
    }

    /// Records `n` more bytes and notifies the callback. Returns the value
    /// reported.
    pub fn add(&self, n: u64) -> u64 {
        let mut reported = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = self.completed.fetch_add(n, Ordering::AcqRel) + n;
        let value = reported.total.map_or(raw, |total| raw.min(total)).max(reported.last);
        reported.last = value;
        if let Some(cb) = &self.callback {
            cb(value);
        }
        value
    }

    /// Sets the total once it becomes known (downloads learn it from the
    /// first response).
    pub fn set_total(&self, total: u64) {
        let mut reported = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reported.total = Some(total);
    }

    pub fn total(&self) -> Option<u64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }

    /// Raw bytes recorded so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressState")
            .field("completed", &self.completed())
            .field("total", &self.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (ProgressCallback, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ProgressCallback = Arc::new(move |v| sink.lock().unwrap().push(v));
        (cb, seen)
    }

    #[test]
    fn add_accumulates() {
        let (cb, seen) = recording();
        let progress = ProgressState::new(Some(30), Some(cb));
        assert_eq!(progress.add(10), 10);
        assert_eq!(progress.add(20), 30);
        assert_eq!(*seen.lock().unwrap(), vec![10, 30]);
        assert_eq!(progress.completed(), 30);
    }

    #[test]
    fn never_reports_past_total() {
        let (cb, seen) = recording();
        let progress = ProgressState::new(Some(25), Some(cb));
        progress.add(20);
        progress.add(20);
        assert_eq!(*seen.lock().unwrap(), vec![20, 25]);
    }

    #[test]
    fn zero_add_still_notifies() {
        let (cb, seen) = recording();
        let progress = ProgressState::new(Some(0), Some(cb));
        progress.add(0);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[test]
    fn total_learned_later() {
        let progress = ProgressState::new(None, None);
        assert_eq!(progress.total(), None);
        progress.set_total(100);
        assert_eq!(progress.total(), Some(100));
    }

    #[test]
    fn concurrent_adds_are_monotonic() {
        use std::thread;

        let (cb, seen) = recording();
        let progress = Arc::new(ProgressState::new(Some(10 * 100 * 3), Some(cb)));
        let mut handles = vec![];

        for _ in 0..10 {
            let p = Arc::clone(&progress);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    p.add(3);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1000);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 3000);
    }
}
