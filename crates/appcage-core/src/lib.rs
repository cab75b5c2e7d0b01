//! Session coordination for appcage environments.
//!
//! This crate ties the schema and runtime layers together: the
//! `SessionCoordinator` counts live invocations with advisory-lock liveness
//! tokens and performs first-in start / last-out teardown, `++` argument
//! parsing turns a control program invocation into an `Invocation`, and the
//! `FleetUpdateCoordinator` drives maintenance across sibling control programs.

pub mod concurrency;
pub mod fleet;
pub mod invocation;
pub mod layout;
pub mod session;

pub use concurrency::{
    has_live_holders, install_signal_handler, interrupt_count, shutdown_requested, ControllerLock,
    LivenessToken,
};
pub use fleet::{
    discover, FleetReport, FleetUpdateCoordinator, ProcessRunner, TargetOutcome, TargetRunner,
};
pub use invocation::{parse_invocation, Action, Invocation};
pub use layout::RuntimeLayout;
pub use session::{
    Profile, SessionCoordinator, SessionHandle, SessionOptions, SessionPlan, StopOutcome,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] appcage_schema::ConfigError),
    #[error("{0}")]
    Runtime(#[from] appcage_runtime::RuntimeError),
    #[error("timed out after {secs}s waiting for {}; another invocation is starting or stopping the environment, retry later", path.display())]
    LockTimeout { path: PathBuf, secs: u64 },
    #[error("environment busy: {0}")]
    Busy(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
