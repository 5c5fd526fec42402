use anyhow::Context;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::EngineError;

/// Exclusive claim on one workflow across processes.
///
/// Held for as long as a process is driving the workflow. Recovery skips
/// workflows whose lock is held elsewhere; the lock is released when the
/// value is dropped or the process dies.
#[derive(Debug)]
pub struct WorkflowLock {
    file: File,
    path: PathBuf,
}

impl WorkflowLock {
    /// Try to claim `workflow_id`. `Ok(None)` means another process holds it.
    pub fn try_acquire(lock_dir: &Path, workflow_id: &str) -> Result<Option<Self>, EngineError> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("Failed to create {}", lock_dir.display()))?;
        let path = lock_path(lock_dir, workflow_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock {}", path.display()))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to lock {}", path.display()))
                .into()),
        }
    }

    /// Claim `workflow_id` or fail with [`EngineError::WorkflowLocked`].
    pub fn acquire(lock_dir: &Path, workflow_id: &str) -> Result<Self, EngineError> {
        Self::try_acquire(lock_dir, workflow_id)?
            .ok_or_else(|| EngineError::WorkflowLocked(workflow_id.to_string()))
    }

    /// Whether another holder currently has `workflow_id`.
    pub fn is_held(lock_dir: &Path, workflow_id: &str) -> Result<bool, EngineError> {
        if !lock_path(lock_dir, workflow_id).exists() {
            return Ok(false);
        }
        Ok(Self::try_acquire(lock_dir, workflow_id)?.is_none())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkflowLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(lock_dir: &Path, workflow_id: &str) -> PathBuf {
    lock_dir.join(format!("{}.lock", workflow_id))
}
