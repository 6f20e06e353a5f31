//! Cooperative, stale-aware file locking for shipper cycle coordination.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;

use crate::error::{AgentError, Result};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Holds an exclusive lock on `path` for as long as it lives. A background
/// task rewrites a liveness timestamp into the file every `REFRESH_INTERVAL`
/// so other processes can tell a held lock from an abandoned one.
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    refresh_task: Option<tokio::task::JoinHandle<()>>,
}

impl FileLock {
    /// Try to acquire `path`, retrying up to `max_retries` times at
    /// `retry_interval` apart. A lock file whose liveness timestamp is
    /// older than `stale_after` is treated as abandoned and removed so a
    /// fresh attempt can proceed without waiting out the full retry budget.
    pub async fn acquire(
        path: PathBuf,
        stale_after: Duration,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let mut attempt = 0u32;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;

            if file.try_lock_exclusive().is_ok() {
                write_heartbeat(&file)?;
                let refresh_task = spawn_refresh(file.try_clone()?);
                return Ok(Self {
                    path,
                    file: Some(file),
                    refresh_task: Some(refresh_task),
                });
            }
            drop(file);

            if is_stale(&path, stale_after) {
                let _ = fs::remove_file(&path);
                continue;
            }

            attempt += 1;
            if attempt >= max_retries {
                return Err(AgentError::LockBusy(path.display().to_string()));
            }
            tokio::time::sleep(retry_interval).await;
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

fn write_heartbeat(file: &File) -> Result<()> {
    let mut file = file.try_clone()?;
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{millis}")?;
    file.flush()?;
    Ok(())
}

fn spawn_refresh(file: File) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REFRESH_INTERVAL).await;
            if write_heartbeat(&file).is_err() {
                break;
            }
        }
    })
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_drop_releases_for_next_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let lock = FileLock::acquire(
            path.clone(),
            Duration::from_secs(30),
            Duration::from_millis(10),
            5,
        )
        .await
        .unwrap();
        drop(lock);

        let second = FileLock::acquire(
            path,
            Duration::from_secs(30),
            Duration::from_millis(10),
            5,
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        fs::write(&path, "0").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(old)).ok();

        let lock = FileLock::acquire(
            path,
            Duration::from_secs(30),
            Duration::from_millis(10),
            5,
        )
        .await;
        assert!(lock.is_ok());
    }
}
