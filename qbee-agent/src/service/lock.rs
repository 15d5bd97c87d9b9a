use anyhow::{Context, Result};
use fs2::FileExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Preferred lock locations; the first one whose directory can be used
/// wins. tmpfs paths come first so stale locks vanish on reboot.
const LOCK_DIRS: &[&str] = &["/run/qbee", "/var/run/qbee"];
const LOCK_NAME: &str = "config.lock";

/// Pick the lock path for this device, falling back to the agent directory
/// when no tmpfs location is writable.
pub fn lock_path(app_dir: &Path) -> PathBuf {
    for dir in LOCK_DIRS {
        let dir = Path::new(dir);
        if dir.is_dir() || std::fs::create_dir_all(dir).is_ok() {
            return dir.join(LOCK_NAME);
        }
    }
    app_dir.join(LOCK_NAME)
}

pub enum LockState {
    Acquired(ExecuteLock),
    /// Another process currently runs configuration.
    Busy,
}

/// Exclusive cross-process lock held for the duration of one reconciliation
/// run. Backed by an advisory file lock; a lock file older than the run
/// timeout is reclaimed.
pub struct ExecuteLock {
    file: Option<std::fs::File>,
    path: PathBuf,
}

impl ExecuteLock {
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<LockState> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }

        match Self::try_acquire(path) {
            Ok(Some(lock)) => return Ok(LockState::Acquired(lock)),
            Ok(None) => {}
            Err(e) => return Err(e),
        }

        // The lock is held. Respect it while it is younger than the run
        // timeout, reclaim it otherwise.
        let age = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok());
        if let Some(age) = age {
            if age >= stale_after {
                tracing::warn!("reclaiming stale lock {}", path.display());
                let _ = std::fs::remove_file(path);
                if let Some(lock) = Self::try_acquire(path)? {
                    return Ok(LockState::Acquired(lock));
                }
            }
        }

        Ok(LockState::Busy)
    }

    fn try_acquire(path: &Path) -> Result<Option<ExecuteLock>> {
        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        // Freshen the file so other processes can judge staleness.
        file.set_len(0)?;
        let _ = writeln!(
            file,
            "{} {}",
            std::process::id(),
            chrono::Utc::now().timestamp()
        );
        let _ = file.sync_all();

        Ok(Some(ExecuteLock {
            file: Some(file),
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for ExecuteLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.lock");

        let state = ExecuteLock::acquire(&path, HOUR).unwrap();
        let lock = match state {
            LockState::Acquired(lock) => lock,
            LockState::Busy => panic!("fresh lock should be acquirable"),
        };
        assert!(path.exists());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_holder_sees_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.lock");

        let _held = match ExecuteLock::acquire(&path, HOUR).unwrap() {
            LockState::Acquired(lock) => lock,
            LockState::Busy => panic!("fresh lock should be acquirable"),
        };

        assert!(matches!(
            ExecuteLock::acquire(&path, HOUR).unwrap(),
            LockState::Busy
        ));
    }

    #[test]
    fn test_unheld_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.lock");

        // A crashed process left the file behind; no advisory lock is held.
        std::fs::write(&path, "4242 0").unwrap();

        assert!(matches!(
            ExecuteLock::acquire(&path, HOUR).unwrap(),
            LockState::Acquired(_)
        ));
    }

    #[test]
    fn test_lock_path_falls_back_to_app_dir() {
        // Unprivileged processes cannot create /run/qbee; expect either a
        // tmpfs path (when it already exists) or the app-dir fallback.
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(dir.path());
        assert!(path.ends_with("config.lock"));
    }
}
