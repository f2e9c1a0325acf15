//! Janitor for conversation attachments: TTL sweep plus a quota trim that
//! drops the oldest files until usage falls back under a target ratio.
//! Never on the query hot path; failures are logged and the next pass
//! retries. The periodic driver lives in `application::background`.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

const CLEANUP_THRESHOLD_RATIO: f64 = 0.9;
const TARGET_RATIO: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct FileJanitor {
    base_dir: PathBuf,
    ttl: Duration,
    max_storage_bytes: u64,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub bytes_reclaimed: u64,
}

impl FileJanitor {
    pub fn new(base_dir: PathBuf, ttl: Duration, max_storage_bytes: u64) -> Self {
        Self {
            base_dir,
            ttl,
            max_storage_bytes,
        }
    }

    /// One full pass: expire by TTL, then trim to quota if still needed.
    pub fn run_once(&self) -> CleanupReport {
        let mut report = self.sweep_expired();

        let size = self.directory_size();
        let threshold = (self.max_storage_bytes as f64 * CLEANUP_THRESHOLD_RATIO) as u64;
        if size > threshold {
            let target = (self.max_storage_bytes as f64 * TARGET_RATIO) as u64;
            let trim = self.trim_to(target);
            report.files_deleted += trim.files_deleted;
            report.bytes_reclaimed += trim.bytes_reclaimed;
        }

        if report.files_deleted > 0 {
            info!(
                deleted = report.files_deleted,
                reclaimed = report.bytes_reclaimed,
                "janitor pass finished"
            );
        }
        report
    }

    /// Remove files whose modification time is older than the TTL, and
    /// any conversation directory left empty by the sweep.
    pub fn sweep_expired(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = SystemTime::now();

        for (path, modified, size) in self.all_files() {
            let expired = now
                .duration_since(modified)
                .map(|age| age > self.ttl)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    report.files_deleted += 1;
                    report.bytes_reclaimed += size;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "janitor failed to remove file"),
            }
        }

        self.remove_empty_dirs();
        report
    }

    /// Delete oldest-first until total usage drops to `target` bytes.
    pub fn trim_to(&self, target: u64) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut files = self.all_files();
        files.sort_by_key(|(_, modified, _)| *modified);

        let mut current = files.iter().map(|(_, _, size)| size).sum::<u64>();
        for (path, _, size) in files {
            if current <= target {
                break;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    current = current.saturating_sub(size);
                    report.files_deleted += 1;
                    report.bytes_reclaimed += size;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "janitor failed to trim file"),
            }
        }

        self.remove_empty_dirs();
        report
    }

    pub fn directory_size(&self) -> u64 {
        self.all_files().iter().map(|(_, _, size)| size).sum()
    }

    fn all_files(&self) -> Vec<(PathBuf, SystemTime, u64)> {
        let mut files = Vec::new();
        collect_files(&self.base_dir, &mut files);
        files
    }

    fn remove_empty_dirs(&self) {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                // remove_dir fails on non-empty directories, which is the point
                let _ = std::fs::remove_dir(&path);
            }
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime, u64)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if let Ok(metadata) = entry.metadata() {
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((path, modified, metadata.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_fresh_files_survive_the_ttl_sweep() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "conv1/a.txt", b"aaaa");

        let janitor = FileJanitor::new(dir.path().to_path_buf(), Duration::from_secs(3600), 1024);
        let report = janitor.sweep_expired();
        assert_eq!(report.files_deleted, 0);
        assert!(dir.path().join("conv1/a.txt").exists());
    }

    #[test]
    fn test_zero_ttl_expires_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "conv1/a.txt", b"aaaa");
        write_file(dir.path(), "conv2/b.txt", b"bbbb");
        std::thread::sleep(Duration::from_millis(5));

        let janitor = FileJanitor::new(dir.path().to_path_buf(), Duration::ZERO, 1024);
        let report = janitor.sweep_expired();
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.bytes_reclaimed, 8);
        // emptied conversation directories go too
        assert!(!dir.path().join("conv1").exists());
    }

    #[test]
    fn test_trim_removes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_file(dir.path(), "conv1/old.txt", &[0u8; 60]);
        std::thread::sleep(Duration::from_millis(20));
        let new = write_file(dir.path(), "conv1/new.txt", &[0u8; 60]);

        let janitor = FileJanitor::new(dir.path().to_path_buf(), Duration::from_secs(3600), 200);
        let report = janitor.trim_to(100);
        assert_eq!(report.files_deleted, 1);
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[test]
    fn test_run_once_honours_the_quota_threshold() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "conv1/a.bin", &[0u8; 50]);
        write_file(dir.path(), "conv1/b.bin", &[0u8; 50]);

        // quota 1000: usage 100 is far below the 90% threshold, no trim
        let janitor = FileJanitor::new(dir.path().to_path_buf(), Duration::from_secs(3600), 1000);
        let report = janitor.run_once();
        assert_eq!(report.files_deleted, 0);
        assert_eq!(janitor.directory_size(), 100);
    }
}
