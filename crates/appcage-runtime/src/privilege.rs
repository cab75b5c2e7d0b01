use crate::command::{command_exists, exit_code, HostCommand};
use crate::RuntimeError;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

/// Names a file the re-executed program creates before doing anything else.
pub const REEXEC_MARKER_VAR: &str = "APPCAGE_REEXEC_MARKER";

/// Variables carried across a pkexec re-exec, which otherwise starts from a
/// clean environment.
const PRESERVED_VARS: &[&str] = &[
    "HOME",
    "DISPLAY",
    "XAUTHORITY",
    "DBUS_SESSION_BUS_ADDRESS",
    "TERM",
    "LANG",
    "LANGUAGE",
];

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("elevation helper '{0}' is not installed")]
    Unavailable(String),
    #[error("elevation through {0} was denied")]
    Denied(String),
    #[error("graphical elevation requires re-running under pkexec")]
    ReexecRequired,
    #[error("failed to run elevation helper: {0}")]
    Io(#[from] std::io::Error),
}

/// How host-privileged commands are executed for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Already root, or the backend needs no privilege.
    Direct,
    /// sudo, authorized once with `sudo -v` and then used non-interactively.
    Terminal,
    /// pkexec, which re-executes the whole control program once.
    Graphical,
}

impl Elevation {
    pub fn select(gui: bool, euid: u32) -> Self {
        if euid == 0 {
            Self::Direct
        } else if gui {
            Self::Graphical
        } else {
            Self::Terminal
        }
    }

    pub fn helper(self) -> Option<&'static str> {
        match self {
            Self::Direct => None,
            Self::Terminal => Some("sudo"),
            Self::Graphical => Some("pkexec"),
        }
    }
}

/// Funnels every privileged host command of a session through a single
/// elevation strategy chosen at construction.
#[derive(Debug)]
pub struct PrivilegeRouter {
    elevation: Elevation,
    sudo: String,
    authorized: AtomicBool,
}

impl PrivilegeRouter {
    pub fn new(elevation: Elevation) -> Self {
        Self {
            elevation,
            sudo: "sudo".to_owned(),
            authorized: AtomicBool::new(elevation == Elevation::Direct),
        }
    }

    /// Use another sudo-compatible program for terminal elevation.
    #[must_use]
    pub fn with_sudo(mut self, program: impl Into<String>) -> Self {
        self.sudo = program.into();
        self
    }

    pub fn direct() -> Self {
        Self::new(Elevation::Direct)
    }

    pub fn elevation(&self) -> Elevation {
        self.elevation
    }

    /// Obtain elevation before any side effect. Prompts at most once.
    pub fn authorize(&self) -> Result<(), PrivilegeError> {
        if self.authorized.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.elevation {
            Elevation::Direct => {}
            Elevation::Terminal => {
                if !command_exists(&self.sudo) {
                    return Err(PrivilegeError::Unavailable(self.sudo.clone()));
                }
                debug!("authorizing with {} -v", self.sudo);
                let status = Command::new(&self.sudo).arg("-v").status()?;
                if !status.success() {
                    return Err(PrivilegeError::Denied(self.sudo.clone()));
                }
            }
            Elevation::Graphical => return Err(PrivilegeError::ReexecRequired),
        }
        self.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Authorize again before privileged work that follows a long attached
    /// command. Cached sudo credentials are refreshed silently while valid;
    /// the user is prompted only once they have expired.
    pub fn reauthorize(&self) -> Result<(), PrivilegeError> {
        if self.elevation != Elevation::Terminal || !self.authorized.load(Ordering::SeqCst) {
            return self.authorize();
        }
        let fresh = Command::new(&self.sudo)
            .args(["-n", "-v"])
            .status()
            .is_ok_and(|s| s.success());
        if fresh {
            return Ok(());
        }
        debug!("{} credentials expired, authorizing again", self.sudo);
        self.authorized.store(false, Ordering::SeqCst);
        self.authorize()
    }

    /// The command as it will actually be executed.
    pub fn wrap(&self, cmd: &HostCommand) -> HostCommand {
        match self.elevation {
            Elevation::Direct => cmd.clone(),
            Elevation::Terminal => cmd.prefixed(&self.sudo, &["-n"]),
            Elevation::Graphical => cmd.prefixed("pkexec", &[]),
        }
    }

    pub fn command(&self, cmd: &HostCommand) -> Command {
        self.wrap(cmd).to_command()
    }

    pub fn output(&self, cmd: &HostCommand) -> Result<Output, RuntimeError> {
        let wrapped = self.wrap(cmd);
        debug!("privileged: {wrapped}");
        Ok(wrapped.to_command().output()?)
    }

    /// Run to completion, failing on a non-zero exit.
    pub fn run(&self, cmd: &HostCommand) -> Result<(), RuntimeError> {
        let output = self.output(cmd)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::ExecFailed(format!(
                "'{cmd}' exited with {}: {}",
                exit_code(output.status),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Environment carried into a pkexec re-exec.
pub fn preserved_env() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(k, _)| {
            PRESERVED_VARS.contains(&k.as_str()) || k.starts_with("LC_") || k.starts_with("APPCAGE_")
        })
        .collect()
}

pub fn pkexec_command(exe: &Path, args: &[String], env: &[(String, String)]) -> HostCommand {
    HostCommand::new("pkexec")
        .arg("/usr/bin/env")
        .args(env.iter().map(|(k, v)| format!("{k}={v}")))
        .arg(exe.display().to_string())
        .args(args.iter().cloned())
}

/// Run this program again under pkexec and return its exit code.
///
/// pkexec exits 126 when the dialog is dismissed and 127 when authorization
/// fails, which an inner command can also return. The child creates the
/// marker file named by `REEXEC_MARKER_VAR` as soon as it runs, so those
/// codes mean denial only when the marker is missing.
pub fn reexec_under_pkexec(
    exe: &Path,
    args: &[String],
    env: &[(String, String)],
) -> Result<i32, PrivilegeError> {
    if !command_exists("pkexec") {
        return Err(PrivilegeError::Unavailable("pkexec".to_owned()));
    }
    let marker_dir = tempfile::tempdir()?;
    let marker = marker_dir.path().join("started");
    let mut env = env.to_vec();
    env.push((REEXEC_MARKER_VAR.to_owned(), marker.display().to_string()));
    let cmd = pkexec_command(exe, args, &env);
    debug!("re-executing: {cmd}");
    let status = cmd.to_command().status()?;
    reexec_outcome(exit_code(status), marker.exists())
}

fn reexec_outcome(code: i32, child_started: bool) -> Result<i32, PrivilegeError> {
    match code {
        126 | 127 if !child_started => Err(PrivilegeError::Denied("pkexec".to_owned())),
        code => Ok(code),
    }
}

/// Record that a re-executed program is running. Does nothing outside a
/// pkexec re-exec. An existing file is never overwritten.
pub fn mark_reexec_started() {
    let Some(path) = std::env::var_os(REEXEC_MARKER_VAR) else {
        return;
    };
    if let Err(e) = OpenOptions::new().write(true).create_new(true).open(&path) {
        debug!("could not create re-exec marker {}: {e}", Path::new(&path).display());
    }
}
