//! Filesystem usage probing, shared by the segment store and the
//! disk-pressure manager.

use std::path::Path;

use nix::sys::statvfs::statvfs;

use crate::error::{AgentError, Result};
use crate::model::StoreUsage;

/// Statvfs the nearest existing ancestor of `path` and report total/used/
/// available bytes for that filesystem.
pub fn disk_usage(path: &Path) -> Result<StoreUsage> {
    let probe = nearest_existing(path);
    let stat = statvfs(&probe)
        .map_err(|e| AgentError::Storage(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let block_size = stat.fragment_size().max(1) as u64;
    let total = stat.blocks() as u64 * block_size;
    let available = stat.blocks_available() as u64 * block_size;
    let used = total.saturating_sub(available);
    let percent_used = if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    };
    Ok(StoreUsage {
        total,
        used,
        available,
        percent_used,
        block_size,
    })
}

fn nearest_existing(path: &Path) -> std::path::PathBuf {
    let mut cur = path;
    loop {
        if cur.exists() {
            return cur.to_path_buf();
        }
        match cur.parent() {
            Some(parent) => cur = parent,
            None => return std::path::PathBuf::from("/"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_of_existing_tempdir_is_sane() {
        let dir = tempfile::tempdir().unwrap();
        let usage = disk_usage(dir.path()).unwrap();
        assert!(usage.total > 0);
        assert!(usage.percent_used >= 0.0 && usage.percent_used <= 100.0);
    }

    #[test]
    fn usage_walks_up_to_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does/not/exist/yet");
        let usage = disk_usage(&missing).unwrap();
        assert!(usage.total > 0);
    }
}
