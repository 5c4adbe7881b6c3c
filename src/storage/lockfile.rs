//! Per-job lock file
//!
//! Only one ingester may write results for a job at a time: two would
//! interleave interim deletions and commits for the same buckets.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Lock file holding the owning process id, removed on drop
#[derive(Debug)]
pub struct JobLock {
    lock_path: PathBuf,
    job_id: String,
    owned: bool,
}

impl JobLock {
    const LOCK_SUFFIX: &'static str = ".lock";

    /// Acquire the lock for `job_id` under `data_dir`.
    ///
    /// Fails if a live process already holds it. A lock left behind by a
    /// process that no longer exists is removed.
    pub fn acquire<P: AsRef<Path>>(data_dir: P, job_id: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let lock_path = data_dir.join(format!("{job_id}{}", Self::LOCK_SUFFIX));
        let pid = std::process::id();

        // create_new makes the check and the claim one step; a stale lock
        // is removed and the claim retried once
        let mut attempts = 0;
        let mut file = loop {
            attempts += 1;
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(file) => break file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts < 2 => {
                    Self::clear_if_stale(&lock_path, job_id)?;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    bail!("Job '{job_id}' lock was claimed by another ingester while starting");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create job lock: {}", lock_path.display())
                    });
                }
            }
        };
        writeln!(file, "{pid}").context("Failed to write PID to job lock")?;

        tracing::debug!(job_id, pid, path = %lock_path.display(), "Acquired job lock");

        Ok(Self {
            lock_path,
            job_id: job_id.to_string(),
            owned: true,
        })
    }

    /// Remove the lock at `lock_path` if its holder is gone, fail otherwise
    fn clear_if_stale(lock_path: &Path, job_id: &str) -> Result<()> {
        match Self::holder(lock_path) {
            Ok(Some(pid)) => bail!(
                "Job '{job_id}' is already being ingested (PID: {pid})\n\
                 \n\
                 Stop the other ingester, or if none is running remove the stale lock:\n\
                    rm {}",
                lock_path.display()
            ),
            Ok(None) => {
                tracing::info!(job_id, "Removing stale job lock");
                match fs::remove_file(lock_path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => {
                        Err(e).context("Failed to remove stale job lock")
                    }
                    _ => Ok(()),
                }
            }
            // Released between our claim and the read: try again
            Err(_) if !lock_path.exists() => Ok(()),
            // A lock just created by another ingester is empty until its PID is written
            Err(e) => bail!(
                "Job '{job_id}' lock is unreadable ({e:#}); if no ingester is running remove it:\n\
                    rm {}",
                lock_path.display()
            ),
        }
    }

    /// PID of the live process holding the lock, or `None` if it is stale
    fn holder(lock_path: &Path) -> Result<Option<u32>> {
        let contents = fs::read_to_string(lock_path).context("Failed to read job lock")?;
        let pid: u32 = contents
            .trim()
            .parse()
            .context("Failed to parse PID from job lock")?;

        // Our own PID means this process already holds the job
        if pid == std::process::id() || Self::is_process_running(pid) {
            Ok(Some(pid))
        } else {
            Ok(None)
        }
    }

    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        // Assume the holder is alive when we cannot tell
        true
    }

    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to remove job lock");
            } else {
                tracing::debug!(job_id = %self.job_id, "Released job lock");
            }
            self.owned = false;
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_lock() {
        let temp_dir = tempdir().unwrap();
        let lock = JobLock::acquire(temp_dir.path(), "farequote").unwrap();

        assert!(lock.path().exists());
        assert!(lock.path().ends_with("farequote.lock"));

        let contents = fs::read_to_string(lock.path()).unwrap();
        let pid: u32 = contents.trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = tempdir().unwrap();
        let lock_path;

        {
            let lock = JobLock::acquire(temp_dir.path(), "job").unwrap();
            lock_path = lock.path().to_path_buf();
            assert!(lock_path.exists());
        }

        assert!(!lock_path.exists());
    }

    #[test]
    fn test_same_job_cannot_be_locked_twice() {
        let temp_dir = tempdir().unwrap();
        let _held = JobLock::acquire(temp_dir.path(), "job").unwrap();
        assert!(JobLock::acquire(temp_dir.path(), "job").is_err());
        assert!(JobLock::acquire(temp_dir.path(), "other-job").is_ok());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        use std::sync::{Arc, Barrier};

        let temp_dir = tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = temp_dir.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    JobLock::acquire(&dir, "job").ok()
                })
            })
            .collect();

        let held: Vec<JobLock> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(held.len(), 1);
    }

    #[test]
    fn test_unreadable_lock_is_not_taken_over() {
        let temp_dir = tempdir().unwrap();
        let lock_path = temp_dir.path().join("job.lock");
        fs::write(&lock_path, "").unwrap();

        assert!(JobLock::acquire(temp_dir.path(), "job").is_err());
        assert!(lock_path.exists());
    }

    #[test]
    fn test_stale_lock_removed() {
        let temp_dir = tempdir().unwrap();
        let lock_path = temp_dir.path().join("job.lock");

        fs::write(&lock_path, "999999999\n").unwrap();

        let lock = JobLock::acquire(temp_dir.path(), "job").unwrap();
        assert!(lock.path().exists());
    }
}
