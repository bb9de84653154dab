//! Bounded backlog of capture files waiting to be turned into flow tables.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::capture::flow_csv_path;
use crate::error::{Result, SleuthError};

/// Work queue over a capture directory.
///
/// Pending captures are `*.pcap` files that have settled (not modified for
/// `settle`), have no flow CSV yet and have not been consumed. When more than
/// `capacity` are pending the oldest are deleted to keep the disk from
/// filling during a traffic burst.
#[derive(Debug)]
pub struct CaptureQueue {
    pcap_dir: PathBuf,
    csv_dir: PathBuf,
    capacity: usize,
    settle: Duration,
    pending: VecDeque<PathBuf>,
    consumed: HashSet<PathBuf>,
}

impl CaptureQueue {
    pub fn new(pcap_dir: &Path, csv_dir: &Path, capacity: usize, settle: Duration) -> Self {
        CaptureQueue {
            pcap_dir: pcap_dir.to_path_buf(),
            csv_dir: csv_dir.to_path_buf(),
            capacity,
            settle,
            pending: VecDeque::new(),
            consumed: HashSet::new(),
        }
    }

    /// Rescans the capture directory; pending inputs are ordered oldest first.
    /// A missing directory just means nothing is pending yet. Consumed
    /// entries whose file is gone are forgotten, so the set stays bounded by
    /// what is on disk.
    pub fn refresh(&mut self) -> Result<&VecDeque<PathBuf>> {
        self.pending.clear();
        self.consumed.retain(|p| p.exists());
        let entries = match fs::read_dir(&self.pcap_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(&self.pending),
            Err(e) => return Err(SleuthError::io(&self.pcap_dir, e)),
        };
        let now = SystemTime::now();
        let mut found: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "pcap"))
            .filter(|p| !self.consumed.contains(p))
            .filter(|p| !flow_csv_path(p, &self.csv_dir).exists())
            .filter_map(|p| {
                let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((modified, p))
            })
            .filter(|(modified, p)| {
                let settled = now
                    .duration_since(*modified)
                    .is_ok_and(|age| age >= self.settle);
                if !settled {
                    debug!("{:?} is still being written", p);
                }
                settled
            })
            .collect();
        found.sort();
        self.pending = found.into_iter().map(|(_, p)| p).collect();
        Ok(&self.pending)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes the next pending input, oldest first.
    pub fn pop(&mut self) -> Option<PathBuf> {
        self.pending.pop_front()
    }

    pub fn mark_consumed(&mut self, path: &Path) {
        self.pending.retain(|p| p != path);
        self.consumed.insert(path.to_path_buf());
    }

    pub fn is_consumed(&self, path: &Path) -> bool {
        self.consumed.contains(path)
    }

    /// Deletes the oldest pending inputs beyond capacity and returns them.
    /// Evicted files are marked consumed even if deletion failed.
    pub fn evict_overflow(&mut self) -> Vec<PathBuf> {
        let excess = self.pending.len().saturating_sub(self.capacity);
        if excess == 0 {
            return Vec::new();
        }
        warn!(
            "Backlog of {} captures exceeds {}; dropping {} oldest",
            self.pending.len(),
            self.capacity,
            excess
        );
        let evicted: Vec<PathBuf> = self.pending.drain(..excess).collect();
        for path in &evicted {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to delete {:?}: {}", path, e);
            }
            self.consumed.insert(path.clone());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_modified(mtime).unwrap();
        path
    }

    #[test]
    fn test_refresh_orders_and_filters() {
        let dir = tempdir().unwrap();
        let pcap_dir = dir.path().join("pcap");
        let csv_dir = dir.path().join("csv");
        fs::create_dir_all(&pcap_dir).unwrap();
        fs::create_dir_all(&csv_dir).unwrap();
        let newer = touch(&pcap_dir, "b.pcap", 60);
        let older = touch(&pcap_dir, "c.pcap", 120);
        touch(&pcap_dir, "fresh.pcap", 0);
        touch(&pcap_dir, "done.pcap", 300);
        touch(&pcap_dir, "notes.txt", 300);
        fs::write(csv_dir.join("done.csv"), "header\n").unwrap();

        let mut queue = CaptureQueue::new(&pcap_dir, &csv_dir, 50, Duration::from_secs(10));
        let pending: Vec<PathBuf> = queue.refresh().unwrap().iter().cloned().collect();
        assert_eq!(pending, vec![older.clone(), newer.clone()]);

        queue.mark_consumed(&older);
        assert!(queue.is_consumed(&older));
        queue.refresh().unwrap();
        assert_eq!(queue.pop(), Some(newer));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_evict_overflow_drops_oldest() {
        let dir = tempdir().unwrap();
        let oldest = touch(dir.path(), "1.pcap", 400);
        let middle = touch(dir.path(), "2.pcap", 300);
        let newest = touch(dir.path(), "3.pcap", 200);

        let mut queue = CaptureQueue::new(dir.path(), dir.path(), 1, Duration::from_secs(10));
        queue.refresh().unwrap();
        let evicted = queue.evict_overflow();
        assert_eq!(evicted, vec![oldest.clone(), middle.clone()]);
        assert!(!oldest.exists());
        assert!(!middle.exists());
        assert!(newest.exists());
        assert_eq!(queue.pending().collect::<Vec<_>>(), vec![newest.as_path()]);

        // evicted files never come back
        queue.refresh().unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.evict_overflow().is_empty());
    }

    #[test]
    fn test_deleted_captures_are_forgotten() {
        let dir = tempdir().unwrap();
        let kept = touch(dir.path(), "kept.pcap", 300);
        let removed = touch(dir.path(), "removed.pcap", 200);

        let mut queue = CaptureQueue::new(dir.path(), dir.path(), 50, Duration::from_secs(10));
        queue.refresh().unwrap();
        queue.mark_consumed(&kept);
        queue.mark_consumed(&removed);
        fs::remove_file(&removed).unwrap();

        assert!(queue.refresh().unwrap().is_empty());
        assert!(queue.is_consumed(&kept));
        assert!(!queue.is_consumed(&removed));
        assert_eq!(queue.consumed.len(), 1);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let mut queue = CaptureQueue::new(&dir.path().join("nope"), dir.path(), 5, Duration::ZERO);
        assert!(queue.refresh().unwrap().is_empty());
    }
}
