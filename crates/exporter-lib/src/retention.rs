//! Retention of exited processes
//!
//! Tracks exit timestamps so scrape consumers can still observe a
//! process's final counters for a grace period after it exits.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Exit-time bookkeeping, separate from the record store. Safe for
/// concurrent readers and one writer.
pub struct RetentionTracker {
    exited: RwLock<HashMap<u32, Instant>>,
    retention: Duration,
}

impl RetentionTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            exited: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Mark a process as exited. Idempotent: the first call freezes the
    /// exit time.
    pub fn mark_exited(&self, pid: u32) {
        let mut exited = self.exited.write().unwrap();
        exited.entry(pid).or_insert_with(|| {
            debug!(pid, "Marked process as exited");
            Instant::now()
        });
    }

    pub fn is_exited(&self, pid: u32) -> bool {
        self.exited.read().unwrap().contains_key(&pid)
    }

    /// Whether an exited process is still inside the retention window.
    /// A zero retention evicts immediately.
    pub fn should_retain(&self, pid: u32) -> bool {
        match self.exited.read().unwrap().get(&pid) {
            Some(exited_at) => exited_at.elapsed() < self.retention,
            None => false,
        }
    }

    /// Drop entries past the retention window, returning how many were
    /// removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut exited = self.exited.write().unwrap();
        let before = exited.len();
        exited.retain(|_, exited_at| exited_at.elapsed() < self.retention);
        let removed = before - exited.len();
        if removed > 0 {
            debug!(removed, remaining = exited.len(), "Cleaned up expired processes");
        }
        removed
    }

    /// All PIDs currently in retention.
    pub fn exited_pids(&self) -> Vec<u32> {
        self.exited.read().unwrap().keys().copied().collect()
    }

    pub fn exit_time(&self, pid: u32) -> Option<Instant> {
        self.exited.read().unwrap().get(&pid).copied()
    }

    pub fn len(&self) -> usize {
        self.exited.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_exited_is_idempotent() {
        let tracker = RetentionTracker::new(Duration::from_secs(60));

        tracker.mark_exited(100);
        let first = tracker.exit_time(100).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        tracker.mark_exited(100);

        assert_eq!(tracker.exit_time(100).unwrap(), first);
    }

    #[test]
    fn test_zero_retention_evicts_immediately() {
        let tracker = RetentionTracker::new(Duration::ZERO);

        tracker.mark_exited(100);
        assert!(tracker.is_exited(100));
        assert!(!tracker.should_retain(100));

        assert_eq!(tracker.cleanup_expired(), 1);
        assert!(!tracker.is_exited(100));
    }

    #[test]
    fn test_should_retain_within_window() {
        let tracker = RetentionTracker::new(Duration::from_secs(60));

        tracker.mark_exited(100);
        assert!(tracker.should_retain(100));
        assert!(!tracker.should_retain(200));
    }

    #[test]
    fn test_retention_expiry() {
        let tracker = RetentionTracker::new(Duration::from_millis(50));

        tracker.mark_exited(100);
        assert!(tracker.should_retain(100));

        std::thread::sleep(Duration::from_millis(70));
        assert!(!tracker.should_retain(100));
        assert_eq!(tracker.cleanup_expired(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_partial_cleanup_keeps_fresh_entries() {
        let tracker = RetentionTracker::new(Duration::from_millis(120));

        tracker.mark_exited(100);
        std::thread::sleep(Duration::from_millis(80));
        tracker.mark_exited(200);
        std::thread::sleep(Duration::from_millis(60));

        // 100 is past the window, 200 is not.
        assert_eq!(tracker.cleanup_expired(), 1);
        assert!(!tracker.is_exited(100));
        assert!(tracker.is_exited(200));
        assert!(tracker.should_retain(200));
    }

    #[test]
    fn test_exited_pids_lists_everything_in_retention() {
        let tracker = RetentionTracker::new(Duration::from_secs(60));

        tracker.mark_exited(100);
        tracker.mark_exited(200);

        let mut pids = tracker.exited_pids();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 200]);
    }
}
