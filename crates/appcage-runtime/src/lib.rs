//! Host-facing execution layer for appcage environments.
//!
//! This crate implements everything that touches the host: the pluggable
//! `ContainerBackend` trait with systemd-nspawn and mock backends, network
//! provisioning per `NetworkMode`, resolution of capability flags into bind
//! mounts (`mounts::resolve`), privilege routing through sudo or pkexec, the
//! private nested display for gui-private, and prerequisite checking.

pub mod backend;
pub mod command;
pub mod host;
pub mod mock;
pub mod mounts;
pub mod network;
pub mod nspawn;
pub mod prereq;
pub mod privilege;
pub mod xephyr;

pub use backend::{select_backend, AttachRequest, ContainerBackend, StartSpec};
pub use command::HostCommand;
pub use host::HostContext;
pub use mounts::{resolve, BindEntry, BindKind, ResolvedMounts};
pub use network::{
    select_network_host, Artifact, NetAction, NetworkError, NetworkHost, NetworkLedger,
    NetworkProvisioner, NetworkSetup,
};
pub use prereq::{check_all_prereqs, check_prereqs, format_missing, MissingPrereq};
pub use privilege::{Elevation, PrivilegeError, PrivilegeRouter};
pub use xephyr::PrivateDisplay;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("environment '{0}' is already running")]
    AlreadyRunning(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("environment failed to start: {0}")]
    Startup(String),
    #[error("private display failed: {0}")]
    Display(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}
