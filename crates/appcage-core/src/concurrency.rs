//! Inter-process coordination built on flock(2).
//!
//! Every live session holds a shared lock on the environment's holders file.
//! The kernel drops it when the owning process dies, so the set of holders
//! cannot be corrupted by `kill -9`. Whether a session is the first to join or
//! the last to leave is decided by probing that file for an exclusive lock,
//! which only succeeds when nobody else holds it. Probes happen only while
//! holding the controller lock, so no two processes decide at once.

use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

/// Exclusive lock serializing start/stop decisions for one environment.
pub struct ControllerLock {
    lock_file: File,
}

impl ControllerLock {
    /// Wait up to `timeout` for the lock.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        let deadline = Instant::now() + timeout;
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { lock_file: file });
            }
            if Instant::now() >= deadline {
                return Err(CoreError::LockTimeout {
                    path: lock_path.to_path_buf(),
                    secs: timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for the lock with no deadline.
    pub fn acquire_blocking(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ControllerLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// One live session's hold on the environment.
pub struct LivenessToken {
    lock_file: File,
    path: PathBuf,
}

impl LivenessToken {
    /// Join the holders. Returns the token and whether no one else was live.
    /// Call only while holding the controller lock.
    pub fn join(holders_path: &Path) -> Result<(Self, bool), CoreError> {
        let file = open_lock_file(holders_path)?;
        let first = file.try_lock_exclusive().is_ok();
        // Downgrades our exclusive probe, or joins the existing shared holders.
        file.try_lock_shared().map_err(|e| {
            CoreError::Busy(format!(
                "could not join holders of {}: {e}",
                holders_path.display()
            ))
        })?;
        debug!("joined holders of {} (first: {first})", holders_path.display());
        Ok((
            Self {
                lock_file: file,
                path: holders_path.to_path_buf(),
            },
            first,
        ))
    }

    /// Leave the holders. Returns whether this was the last live session.
    /// Call only while holding the controller lock.
    pub fn release(self) -> bool {
        // A failed upgrade may drop our shared lock, which is fine: we are
        // leaving either way.
        let last = self.lock_file.try_lock_exclusive().is_ok();
        debug!("left holders of {} (last: {last})", self.path.display());
        last
    }
}

impl Drop for LivenessToken {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Whether any session currently holds the environment.
pub fn has_live_holders(holders_path: &Path) -> Result<bool, CoreError> {
    let file = open_lock_file(holders_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            Ok(false)
        }
        Err(_) => Ok(true),
    }
}

static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

/// SIGINT, SIGTERM and SIGHUP terminate the attached command, and a repeated
/// signal kills it. The process itself never exits from here: the session
/// always leaves through the normal path so the last holder stops the
/// environment.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if INTERRUPTS.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\ninterrupted, stopping the attached command...");
        } else {
            eprintln!("\ninterrupted again, killing the attached command...");
        }
    });
}

/// Number of termination signals received so far.
pub fn interrupt_count() -> u32 {
    INTERRUPTS.load(Ordering::SeqCst)
}

pub fn shutdown_requested() -> bool {
    interrupt_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_lock_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.lock");
        let _held = ControllerLock::acquire(&path, Duration::from_secs(1)).unwrap();
        assert!(ControllerLock::try_acquire(&path).unwrap().is_none());
    }

    #[test]
    fn controller_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.lock");
        let _held = ControllerLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let err = ControllerLock::acquire(&path, Duration::from_millis(120))
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
    }

    #[test]
    fn blocking_acquire_waits_past_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.lock");
        let held = ControllerLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            drop(held);
        });
        let started = Instant::now();
        let _lock = ControllerLock::acquire_blocking(&path).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        releaser.join().unwrap();
    }

    #[test]
    fn controller_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.lock");
        {
            let _lock = ControllerLock::acquire(&path, Duration::from_secs(1)).unwrap();
        }
        assert!(ControllerLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn first_and_last_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holders.lock");
        assert!(!has_live_holders(&path).unwrap());

        let (a, a_first) = LivenessToken::join(&path).unwrap();
        let (b, b_first) = LivenessToken::join(&path).unwrap();
        assert!(a_first);
        assert!(!b_first);
        assert!(has_live_holders(&path).unwrap());

        assert!(!a.release());
        assert!(has_live_holders(&path).unwrap());
        assert!(b.release());
        assert!(!has_live_holders(&path).unwrap());
    }

    #[test]
    fn dropped_token_no_longer_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holders.lock");
        {
            let (_token, first) = LivenessToken::join(&path).unwrap();
            assert!(first);
        }
        let (_token, first) = LivenessToken::join(&path).unwrap();
        assert!(first);
    }
}
