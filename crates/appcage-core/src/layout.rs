use crate::CoreError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Overrides the runtime root; used by tests and unusual setups.
pub const RUNTIME_DIR_ENV: &str = "APPCAGE_RUNTIME_DIR";

/// Per-environment runtime artifacts: lock files, network ledger, backend state.
///
/// Everything here is ephemeral. It lives under the invoking user's runtime
/// directory so a reboot clears it, and it is keyed by the invoking user even
/// when the control program runs elevated.
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$APPCAGE_RUNTIME_DIR`, or `/run/user/<uid>/appcage`.
    pub fn for_user(uid: u32) -> Self {
        match std::env::var_os(RUNTIME_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(format!("/run/user/{uid}/appcage")),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn env_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Shared-locked by every live session.
    #[inline]
    pub fn holders_lock(&self, name: &str) -> PathBuf {
        self.env_dir(name).join("holders.lock")
    }

    /// Serializes start/stop decisions.
    #[inline]
    pub fn controller_lock(&self, name: &str) -> PathBuf {
        self.env_dir(name).join("controller.lock")
    }

    #[inline]
    pub fn network_ledger(&self, name: &str) -> PathBuf {
        self.env_dir(name).join("network.json")
    }

    #[inline]
    pub fn state_dir(&self, name: &str) -> PathBuf {
        self.env_dir(name).join("state")
    }

    /// Create the environment's directory and lock files.
    ///
    /// When running as root on behalf of another user, ownership is handed
    /// to that user so later unprivileged invocations can take the locks.
    pub fn initialize(&self, name: &str, owner: Option<u32>) -> Result<(), CoreError> {
        let env_dir = self.env_dir(name);
        let state_dir = self.state_dir(name);
        fs::create_dir_all(&state_dir)?;
        for lock in [self.holders_lock(name), self.controller_lock(name)] {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock)?;
        }
        if let Some(uid) = owner {
            for path in [
                self.root.clone(),
                env_dir,
                state_dir,
                self.holders_lock(name),
                self.controller_lock(name),
            ] {
                std::os::unix::fs::chown(&path, Some(uid), None)?;
            }
        }
        Ok(())
    }
}
