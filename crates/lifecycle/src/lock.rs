use crate::error::{LifecycleError, Result};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Exclusive per-scan lock; released when dropped.
///
/// Serializes apply, rollback and verification bookkeeping for one scan's file set,
/// across tasks and across processes sharing the data directory.
pub struct ScanLock {
    file: File,
    path: PathBuf,
}

impl ScanLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScanLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_path(lock_dir: &Path, scan_id: &str) -> PathBuf {
    lock_dir.join(format!("{scan_id}.lock"))
}

pub async fn acquire_scan_lock(lock_dir: &Path, scan_id: &str) -> Result<ScanLock> {
    let path = lock_path(lock_dir, scan_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let scan_id = scan_id.to_string();
    tokio::task::spawn_blocking(move || -> Result<ScanLock> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| LifecycleError::Lock(format!("open {}: {err}", path.display())))?;

        let start = Instant::now();
        file.lock_exclusive()
            .map_err(|err| LifecycleError::Lock(format!("acquire {}: {err}", path.display())))?;
        log::debug!(
            "scan {scan_id}: lock acquired after {}ms",
            start.elapsed().as_millis()
        );

        Ok(ScanLock { file, path })
    })
    .await
    .map_err(|err| LifecycleError::Lock(format!("join lock task: {err}")))?
}
