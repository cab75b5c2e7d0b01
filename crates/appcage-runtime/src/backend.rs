use crate::command::HostCommand;
use crate::mounts::BindEntry;
use crate::privilege::PrivilegeRouter;
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to boot one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpec {
    pub machine: String,
    pub folder: PathBuf,
    pub binds: Vec<BindEntry>,
    /// Produced by network setup.
    pub network_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub boot_timeout: Duration,
}

/// A command to run inside a running environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub machine: String,
    /// Run as this account; `None` runs as root.
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    pub argv: Vec<String>,
    pub pty: bool,
}

pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether lifecycle commands need host root.
    fn requires_privilege(&self) -> bool;

    fn is_running(&self, machine: &str) -> Result<bool, RuntimeError>;

    /// Boot and block until the environment reports running.
    fn start(&self, spec: &StartSpec) -> Result<(), RuntimeError>;

    /// Stop and block until the environment is gone. Stopping a stopped
    /// environment succeeds.
    fn stop(&self, machine: &str) -> Result<(), RuntimeError>;

    /// Run a command to completion and return its exit code unchanged.
    /// `interrupts` counts termination requests: the first terminates the
    /// command, a second kills it.
    fn attach(&self, req: &AttachRequest, interrupts: &dyn Fn() -> u32)
        -> Result<i32, RuntimeError>;

    /// Start a command without waiting for it.
    fn spawn_detached(&self, req: &AttachRequest) -> Result<(), RuntimeError>;

    fn start_command(&self, spec: &StartSpec) -> HostCommand;

    fn stop_command(&self, machine: &str) -> HostCommand;

    fn attach_command(&self, req: &AttachRequest) -> HostCommand;
}

pub fn select_backend(
    name: &str,
    router: Arc<PrivilegeRouter>,
    state_dir: &Path,
) -> Result<Box<dyn ContainerBackend>, RuntimeError> {
    match name {
        "nspawn" => Ok(Box::new(crate::nspawn::NspawnBackend::new(router))),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new(state_dir))),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

/// Check that every required bind source is present right before start.
pub(crate) fn check_required_binds(binds: &[BindEntry]) -> Result<(), RuntimeError> {
    match binds.iter().find(|b| b.required && !b.source.exists()) {
        Some(missing) => Err(RuntimeError::Mount(format!(
            "{} is missing",
            missing.source.display()
        ))),
        None => Ok(()),
    }
}
