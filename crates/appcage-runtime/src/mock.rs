use crate::backend::{check_required_binds, AttachRequest, ContainerBackend, StartSpec};
use crate::command::{wait_cancellable, HostCommand};
use crate::RuntimeError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File-backed stand-in for systemd-nspawn.
///
/// Running state and a lifecycle event log live under a state directory so
/// that separate processes observe the same environment. Attached commands run
/// directly on the host.
pub struct MockBackend {
    state_dir: PathBuf,
    privileged: bool,
}

impl MockBackend {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            privileged: false,
        }
    }

    /// Report that starting and stopping need host root, so sessions go
    /// through elevation as they would with systemd-nspawn.
    #[must_use]
    pub fn requiring_privilege(mut self) -> Self {
        self.privileged = true;
        self
    }

    fn marker(&self, machine: &str) -> PathBuf {
        self.state_dir.join(format!("{machine}.running"))
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join("events.log")
    }

    /// Lifecycle events recorded so far, e.g. `start app`.
    pub fn events(&self) -> Result<Vec<String>, RuntimeError> {
        match fs::read_to_string(self.events_path()) {
            Ok(text) => Ok(text.lines().map(str::to_owned).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&self, event: &str) -> Result<(), RuntimeError> {
        fs::create_dir_all(&self.state_dir)?;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())?;
        writeln!(log, "{event}")?;
        Ok(())
    }
}

impl ContainerBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn requires_privilege(&self) -> bool {
        self.privileged
    }

    fn is_running(&self, machine: &str) -> Result<bool, RuntimeError> {
        Ok(self.marker(machine).exists())
    }

    fn start(&self, spec: &StartSpec) -> Result<(), RuntimeError> {
        if !spec.folder.is_dir() {
            return Err(RuntimeError::Startup(format!(
                "environment folder {} does not exist",
                spec.folder.display()
            )));
        }
        check_required_binds(&spec.binds)?;
        if self.is_running(&spec.machine)? {
            return Err(RuntimeError::AlreadyRunning(spec.machine.clone()));
        }
        fs::create_dir_all(&self.state_dir)?;
        fs::write(self.marker(&spec.machine), spec.network_args.join(" "))?;
        self.record(&format!("start {}", spec.machine))
    }

    fn stop(&self, machine: &str) -> Result<(), RuntimeError> {
        if !self.is_running(machine)? {
            return Ok(());
        }
        fs::remove_file(self.marker(machine))?;
        self.record(&format!("stop {machine}"))
    }

    fn attach(
        &self,
        req: &AttachRequest,
        interrupts: &dyn Fn() -> u32,
    ) -> Result<i32, RuntimeError> {
        if !self.is_running(&req.machine)? {
            return Err(RuntimeError::ExecFailed(format!(
                "'{}' is not running",
                req.machine
            )));
        }
        let cmd = HostCommand::from_argv(&req.argv)
            .ok_or_else(|| RuntimeError::ExecFailed("empty command".to_owned()))?;
        let mut child = cmd.to_command().envs(req.env.iter().cloned()).spawn()?;
        Ok(wait_cancellable(&mut child, interrupts)?)
    }

    fn spawn_detached(&self, req: &AttachRequest) -> Result<(), RuntimeError> {
        self.record(&format!("detached {} {}", req.machine, req.argv.join(" ")))
    }

    fn start_command(&self, spec: &StartSpec) -> HostCommand {
        HostCommand::new("mock-start")
            .arg(spec.machine.as_str())
            .args(spec.network_args.iter().cloned())
    }

    fn stop_command(&self, machine: &str) -> HostCommand {
        HostCommand::new("mock-stop").arg(machine)
    }

    fn attach_command(&self, req: &AttachRequest) -> HostCommand {
        HostCommand::new("mock-attach")
            .arg(req.machine.as_str())
            .args(req.argv.iter().cloned())
    }
}
