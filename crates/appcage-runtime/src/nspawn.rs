use crate::backend::{check_required_binds, AttachRequest, ContainerBackend, StartSpec};
use crate::command::{exit_code, wait_cancellable, HostCommand};
use crate::privilege::PrivilegeRouter;
use crate::RuntimeError;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Boots environments with systemd-nspawn and reaches into them with
/// systemd-run through the machine manager.
pub struct NspawnBackend {
    router: Arc<PrivilegeRouter>,
}

impl NspawnBackend {
    pub fn new(router: Arc<PrivilegeRouter>) -> Self {
        Self { router }
    }

    fn machine_state(machine: &str) -> Result<Option<String>, RuntimeError> {
        let output = Command::new("machinectl")
            .args(["show", "--property=State", "--value", machine])
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Ok(None);
        }
        let state = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok((!state.is_empty()).then_some(state))
    }

    fn wait_until_stopped(&self, machine: &str) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Self::machine_state(machine)?.is_some() {
            if Instant::now() > deadline {
                return Err(RuntimeError::ExecFailed(format!(
                    "'{machine}' did not stop within {}s",
                    STOP_TIMEOUT.as_secs()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }
}

impl ContainerBackend for NspawnBackend {
    fn name(&self) -> &'static str {
        "nspawn"
    }

    fn requires_privilege(&self) -> bool {
        true
    }

    fn is_running(&self, machine: &str) -> Result<bool, RuntimeError> {
        Ok(Self::machine_state(machine)?.as_deref() == Some("running"))
    }

    fn start(&self, spec: &StartSpec) -> Result<(), RuntimeError> {
        if !spec.folder.is_dir() {
            return Err(RuntimeError::Startup(format!(
                "environment folder {} does not exist",
                spec.folder.display()
            )));
        }
        check_required_binds(&spec.binds)?;

        let cmd = self.start_command(spec);
        info!("starting '{}'", spec.machine);
        debug!("{cmd}");
        // Own process group: a terminal interrupt aimed at the attached
        // command must not reach the environment.
        let mut child = self
            .router
            .command(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()?;

        let deadline = Instant::now() + spec.boot_timeout;
        loop {
            if self.is_running(&spec.machine)? {
                debug!("'{}' is running", spec.machine);
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                return Err(RuntimeError::Startup(format!(
                    "systemd-nspawn exited with {} before '{}' was running",
                    exit_code(status),
                    spec.machine
                )));
            }
            if Instant::now() > deadline {
                warn!("'{}' did not boot in time, stopping it", spec.machine);
                let _ = self.router.run(&self.stop_command(&spec.machine));
                return Err(RuntimeError::Startup(format!(
                    "'{}' did not reach running state within {}s",
                    spec.machine,
                    spec.boot_timeout.as_secs()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&self, machine: &str) -> Result<(), RuntimeError> {
        if Self::machine_state(machine)?.is_none() {
            debug!("'{machine}' is not running, nothing to stop");
            return Ok(());
        }
        info!("stopping '{machine}'");
        self.router.run(&self.stop_command(machine))?;
        self.wait_until_stopped(machine)
    }

    fn attach(
        &self,
        req: &AttachRequest,
        interrupts: &dyn Fn() -> u32,
    ) -> Result<i32, RuntimeError> {
        let cmd = self.attach_command(req);
        debug!("{cmd}");
        let mut child = self.router.command(&cmd).spawn()?;
        Ok(wait_cancellable(&mut child, interrupts)?)
    }

    fn spawn_detached(&self, req: &AttachRequest) -> Result<(), RuntimeError> {
        let mut cmd = self.attach_command(req);
        cmd.args.retain(|a| a != "--wait");
        self.router.run(&cmd)
    }

    fn start_command(&self, spec: &StartSpec) -> HostCommand {
        HostCommand::new("systemd-nspawn")
            .args(["-q", "-b", "-D"])
            .arg(spec.folder.display().to_string())
            .arg(format!("--machine={}", spec.machine))
            .args(["--notify-ready=yes", "--console=passive"])
            .args(spec.binds.iter().map(crate::mounts::BindEntry::nspawn_arg))
            .args(spec.network_args.iter().cloned())
            .args(spec.extra_args.iter().cloned())
    }

    fn stop_command(&self, machine: &str) -> HostCommand {
        HostCommand::new("machinectl").args(["stop", machine])
    }

    fn attach_command(&self, req: &AttachRequest) -> HostCommand {
        let mut cmd = HostCommand::new("systemd-run")
            .args(["-M", req.machine.as_str(), "-q"])
            .arg(if req.pty { "--pty" } else { "--pipe" })
            .args(["--wait", "--collect", "--send-sighup"]);
        if let Some(user) = &req.user {
            cmd = cmd.args(["/usr/bin/sudo", "-u", user.as_str()]);
        }
        cmd.arg("/usr/bin/env")
            .args(req.env.iter().map(|(k, v)| format!("{k}={v}")))
            .args(req.argv.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::{BindEntry, BindKind};
    use std::path::PathBuf;

    fn backend() -> NspawnBackend {
        NspawnBackend::new(Arc::new(PrivilegeRouter::direct()))
    }

    #[test]
    fn start_command_layout() {
        let spec = StartSpec {
            machine: "chrome".to_owned(),
            folder: PathBuf::from("/machines/chrome"),
            binds: vec![BindEntry {
                source: PathBuf::from("/dev/dri"),
                target: PathBuf::from("/dev/dri"),
                read_only: false,
                required: false,
                kind: BindKind::Device,
            }],
            network_args: vec!["--private-network".to_owned()],
            extra_args: vec!["--capability=CAP_NET_ADMIN".to_owned()],
            boot_timeout: Duration::from_secs(5),
        };
        assert_eq!(
            backend().start_command(&spec).to_string(),
            "systemd-nspawn -q -b -D /machines/chrome --machine=chrome --notify-ready=yes \
             --console=passive --bind=/dev/dri --private-network --capability=CAP_NET_ADMIN"
        );
    }

    #[test]
    fn attach_command_runs_as_user_with_env() {
        let req = AttachRequest {
            machine: "chrome".to_owned(),
            user: Some("alice".to_owned()),
            env: vec![("DISPLAY".to_owned(), ":0".to_owned())],
            argv: vec!["google-chrome".to_owned(), "--incognito".to_owned()],
            pty: true,
        };
        assert_eq!(
            backend().attach_command(&req).to_string(),
            "systemd-run -M chrome -q --pty --wait --collect --send-sighup \
             /usr/bin/sudo -u alice /usr/bin/env DISPLAY=:0 google-chrome --incognito"
        );
    }

    #[test]
    fn attach_as_root_uses_pipe_without_sudo() {
        let req = AttachRequest {
            machine: "box".to_owned(),
            user: None,
            env: Vec::new(),
            argv: vec!["apt-get".to_owned(), "update".to_owned()],
            pty: false,
        };
        let cmd = backend().attach_command(&req);
        assert!(cmd.args.contains(&"--pipe".to_owned()));
        assert!(!cmd.args.contains(&"/usr/bin/sudo".to_owned()));
    }

    #[test]
    fn start_rejects_missing_folder() {
        let spec = StartSpec {
            machine: "ghost".to_owned(),
            folder: PathBuf::from("/nonexistent/appcage/ghost"),
            binds: Vec::new(),
            network_args: Vec::new(),
            extra_args: Vec::new(),
            boot_timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            backend().start(&spec),
            Err(RuntimeError::Startup(_))
        ));
    }
}
