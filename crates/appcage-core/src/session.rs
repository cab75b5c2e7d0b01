use crate::concurrency::{
    has_live_holders, interrupt_count, shutdown_requested, ControllerLock, LivenessToken,
};
use crate::invocation::Action;
use crate::layout::RuntimeLayout;
use crate::CoreError;
use appcage_runtime::host::effective_uid;
use appcage_runtime::{
    resolve, select_backend, select_network_host, AttachRequest, ContainerBackend, HostCommand,
    HostContext, NetAction, NetworkHost, NetworkProvisioner, NetworkSetup, PrivateDisplay,
    PrivilegeRouter, ResolvedMounts, RuntimeError, StartSpec,
};
use appcage_schema::{ConfigSpec, NetworkMode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the attached command is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Profile {
    /// The configured user's command with every capability bound.
    #[default]
    Interactive,
    /// Root maintenance commands with network uplink and no capability binds.
    Maintenance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub network_override: Option<NetworkMode>,
    pub profile: Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Commands a session would run, for `++show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    pub mode: NetworkMode,
    pub display: Option<HostCommand>,
    pub network_setup: Vec<HostCommand>,
    pub start: Option<HostCommand>,
    pub attach: Vec<HostCommand>,
    pub stop: Option<HostCommand>,
    pub network_teardown: Vec<HostCommand>,
}

/// One invocation's hold on the shared environment.
///
/// Dropping the handle leaves the session, so the holder accounting runs on
/// every exit path including errors and interrupts.
pub struct SessionHandle<'a> {
    coordinator: &'a SessionCoordinator,
    token: Option<LivenessToken>,
    profile: Profile,
    mode: NetworkMode,
    env: Vec<(String, String)>,
    started: bool,
}

impl SessionHandle<'_> {
    /// Whether this session booted the environment.
    pub fn started_environment(&self) -> bool {
        self.started
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn leave(mut self) -> Result<(), CoreError> {
        match self.token.take() {
            Some(token) => self.coordinator.leave_with(token),
            None => Ok(()),
        }
    }

    /// Give up the hold without stopping; the environment keeps running with
    /// no holders until a later `++stop` or last exit.
    pub fn detach(mut self) {
        drop(self.token.take());
    }
}

impl Drop for SessionHandle<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.coordinator.leave_with(token) {
                warn!("leaving session failed: {e}");
            }
        }
    }
}

/// Coordinates every invocation sharing one environment.
pub struct SessionCoordinator {
    config: ConfigSpec,
    host: HostContext,
    layout: RuntimeLayout,
    router: Arc<PrivilegeRouter>,
    backend: Box<dyn ContainerBackend>,
    network: NetworkProvisioner,
    display: Option<PrivateDisplay>,
}

impl SessionCoordinator {
    /// Build with the backend and network host named by the configuration.
    pub fn new(
        config: ConfigSpec,
        host: HostContext,
        layout: RuntimeLayout,
        router: Arc<PrivilegeRouter>,
    ) -> Result<Self, CoreError> {
        let state_dir = layout.state_dir(config.name());
        let backend = select_backend(&config.runtime.backend, router.clone(), &state_dir)?;
        let network_host = select_network_host(&config.runtime.backend, router.clone(), &state_dir);
        Ok(Self::with_parts(config, host, layout, router, backend, network_host))
    }

    pub fn with_parts(
        config: ConfigSpec,
        host: HostContext,
        layout: RuntimeLayout,
        router: Arc<PrivilegeRouter>,
        backend: Box<dyn ContainerBackend>,
        network_host: Box<dyn NetworkHost>,
    ) -> Self {
        let name = config.name().to_string();
        let network = NetworkProvisioner::new(&name, network_host, layout.network_ledger(&name));
        let display = config.capabilities.gui_private.then(|| {
            PrivateDisplay::new(&name, &config.display.private_server).with_dirs(
                &host.x11_dir,
                host.x11_dir.parent().unwrap_or(host.x11_dir.as_path()),
            )
        });
        Self {
            config,
            host,
            layout,
            router,
            backend,
            network,
            display,
        }
    }

    pub fn config(&self) -> &ConfigSpec {
        &self.config
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn network(&self) -> &NetworkProvisioner {
        &self.network
    }

    fn name(&self) -> &str {
        self.config.name().as_str()
    }

    fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }

    /// Network mode for a session; the configuration itself is never changed.
    pub fn effective_mode(&self, opts: &SessionOptions) -> NetworkMode {
        match opts.profile {
            Profile::Interactive => opts.network_override.unwrap_or(self.config.network.mode),
            Profile::Maintenance => opts
                .network_override
                .filter(|m| m.has_uplink())
                .unwrap_or(NetworkMode::On),
        }
    }

    fn resolve_mounts(&self, opts: &SessionOptions, mode: NetworkMode) -> Result<ResolvedMounts, CoreError> {
        match opts.profile {
            Profile::Interactive => Ok(resolve(&self.config, &self.host, mode)?),
            Profile::Maintenance => Ok(ResolvedMounts {
                binds: Vec::new(),
                env_vars: self.host.forwarded.clone(),
            }),
        }
    }

    fn owner(&self) -> Option<u32> {
        (effective_uid() == 0 && self.host.uid != 0).then_some(self.host.uid)
    }

    /// Whether starting or stopping needs host root.
    pub fn requires_privilege(&self) -> bool {
        self.backend.requires_privilege()
    }

    pub fn is_running(&self) -> Result<bool, CoreError> {
        Ok(self.backend.is_running(self.name())?)
    }

    pub fn has_live_holders(&self) -> Result<bool, CoreError> {
        has_live_holders(&self.layout.holders_lock(self.name()))
    }

    /// Check the session's binds against the host, then obtain elevation.
    /// Elevation prompts at most once, so callers may do this ahead of
    /// `enter` to keep the prompt clear of progress output.
    pub fn prepare(&self, opts: &SessionOptions) -> Result<(), CoreError> {
        self.resolve_mounts(opts, self.effective_mode(opts))?;
        self.authorize()
    }

    fn authorize(&self) -> Result<(), CoreError> {
        if self.backend.requires_privilege() {
            self.router.authorize().map_err(RuntimeError::from)?;
        }
        Ok(())
    }

    /// Join the environment, starting it if this is the first live session.
    ///
    /// Configuration problems are reported before elevation, and elevation
    /// happens before any host change.
    pub fn enter(&self, opts: &SessionOptions) -> Result<SessionHandle<'_>, CoreError> {
        let mode = self.effective_mode(opts);
        let mounts = self.resolve_mounts(opts, mode)?;
        self.authorize()?;

        let name = self.name();
        self.layout.initialize(name, self.owner())?;
        let _controller =
            ControllerLock::acquire(&self.layout.controller_lock(name), self.lock_timeout())?;
        let (token, first) = LivenessToken::join(&self.layout.holders_lock(name))?;

        if opts.profile == Profile::Maintenance && !first {
            return Err(CoreError::Busy(format!(
                "'{name}' is in use; close it before running maintenance"
            )));
        }
        let mut started = false;
        if first {
            if self.backend.is_running(name)? {
                if opts.profile == Profile::Maintenance {
                    return Err(CoreError::Busy(format!(
                        "'{name}' is already running; stop it with ++stop before running maintenance"
                    )));
                }
                self.adopt(mode)?;
            } else {
                self.bring_up(opts, mode, &mounts)?;
                started = true;
            }
        }

        Ok(SessionHandle {
            coordinator: self,
            token: Some(token),
            profile: opts.profile,
            mode,
            env: mounts.env_vars,
            started,
        })
    }

    /// A previous holder died while the environment was up. Keep it running
    /// and take over its artifacts.
    fn adopt(&self, mode: NetworkMode) -> Result<(), CoreError> {
        info!("'{}' is running with no live sessions, adopting it", self.name());
        self.network.adopt(mode).map_err(RuntimeError::from)?;
        if let Some(display) = &self.display {
            if display.current_number().is_none() {
                display.start(self.owner())?;
            }
        }
        Ok(())
    }

    fn bring_up(
        &self,
        opts: &SessionOptions,
        mode: NetworkMode,
        mounts: &ResolvedMounts,
    ) -> Result<(), CoreError> {
        let display = self.display.as_ref().filter(|_| opts.profile == Profile::Interactive);
        if let Some(display) = display {
            display.start(self.owner())?;
        }

        let setup = match self.network.setup(mode) {
            Ok(setup) => setup,
            Err(e) => {
                self.stop_display(display);
                return Err(RuntimeError::from(e).into());
            }
        };

        let spec = self.start_spec(mounts, &setup);
        if let Err(e) = self.backend.start(&spec) {
            warn!("start of '{}' failed, rolling back network setup", self.name());
            if let Err(rollback) = self.network.rollback(&setup) {
                warn!("network rollback failed: {rollback}");
            }
            self.stop_display(display);
            return Err(match e {
                RuntimeError::Startup(_) | RuntimeError::Mount(_) => e.into(),
                other => RuntimeError::Startup(other.to_string()).into(),
            });
        }

        if display.is_some() && !self.config.display.window_manager.is_empty() {
            let req = AttachRequest {
                machine: self.name().to_owned(),
                user: self.attach_user(Profile::Interactive),
                env: mounts.env_vars.clone(),
                argv: vec![self.config.display.window_manager.clone()],
                pty: false,
            };
            if let Err(e) = self.backend.spawn_detached(&req) {
                warn!("window manager did not start: {e}");
            }
        }
        Ok(())
    }

    fn start_spec(&self, mounts: &ResolvedMounts, setup: &NetworkSetup) -> StartSpec {
        StartSpec {
            machine: self.name().to_owned(),
            folder: self.config.environment.folder.clone(),
            binds: mounts.binds.clone(),
            network_args: setup.start_args.clone(),
            extra_args: self.config.runtime.nspawn_extra_args.clone(),
            boot_timeout: self.config.boot_timeout(),
        }
    }

    fn stop_display(&self, display: Option<&PrivateDisplay>) {
        if let Some(display) = display {
            if let Err(e) = display.stop() {
                warn!("stopping private display failed: {e}");
            }
        }
    }

    fn attach_user(&self, profile: Profile) -> Option<String> {
        let user = self.config.environment.user.as_str();
        (profile == Profile::Interactive && user != "root").then(|| user.to_owned())
    }

    /// Run `argv` inside the environment and return its exit code unchanged.
    /// An interrupt terminates the command; the session stays joined.
    pub fn attach(&self, handle: &SessionHandle<'_>, argv: &[String]) -> Result<i32, CoreError> {
        let req = AttachRequest {
            machine: self.name().to_owned(),
            user: self.attach_user(handle.profile),
            env: handle.env.clone(),
            argv: argv.to_vec(),
            pty: self.host.stdin_is_tty,
        };
        debug!("attaching: {}", argv.join(" "));
        Ok(self.backend.attach(&req, &interrupt_count)?)
    }

    pub fn leave(&self, handle: SessionHandle<'_>) -> Result<(), CoreError> {
        handle.leave()
    }

    fn leave_with(&self, token: LivenessToken) -> Result<(), CoreError> {
        let name = self.name();
        // No deadline: giving up here would strand a running environment
        // with no holders. Entering sessions hold the lock only briefly.
        let _controller = ControllerLock::acquire_blocking(&self.layout.controller_lock(name))?;
        if token.release() {
            info!("last session of '{name}' left, stopping it");
            if self.backend.requires_privilege() {
                // The attached command may have outlived cached credentials.
                self.router.reauthorize().map_err(RuntimeError::from)?;
            }
            self.bring_down()
        } else {
            debug!("other sessions of '{name}' remain");
            Ok(())
        }
    }

    /// Stop the environment, then the display, then the network. The
    /// network is kept if the environment may still be using it.
    fn bring_down(&self) -> Result<(), CoreError> {
        self.backend.stop(self.name())?;
        self.stop_display(self.display.as_ref());
        self.network.teardown().map_err(RuntimeError::from)?;
        Ok(())
    }

    /// `++start`: bring the environment up and leave it running.
    pub fn start_detached(&self, opts: &SessionOptions) -> Result<bool, CoreError> {
        let handle = self.enter(opts)?;
        let started = handle.started_environment();
        handle.detach();
        Ok(started)
    }

    /// `++stop`: stop an environment nobody is attached to. Succeeds without
    /// doing anything when it is not running.
    pub fn stop_idle(&self) -> Result<StopOutcome, CoreError> {
        self.authorize()?;
        let name = self.name();
        self.layout.initialize(name, self.owner())?;
        let _controller =
            ControllerLock::acquire(&self.layout.controller_lock(name), self.lock_timeout())?;
        if self.has_live_holders()? {
            return Err(CoreError::Busy(format!(
                "'{name}' still has attached sessions; they stop it when they exit"
            )));
        }
        let display_up = self
            .display
            .as_ref()
            .is_some_and(|d| d.current_number().is_some());
        if !self.backend.is_running(name)? && !self.network.is_applied() && !display_up {
            return Ok(StopOutcome::NotRunning);
        }
        self.bring_down()?;
        Ok(StopOutcome::Stopped)
    }

    /// `++aptupdate`: start with uplink, run every maintenance command as
    /// root, stop. Returns the first non-zero exit code, or 0.
    pub fn maintain(&self, network_override: Option<NetworkMode>) -> Result<i32, CoreError> {
        let opts = SessionOptions {
            network_override,
            profile: Profile::Maintenance,
        };
        let handle = self.enter(&opts)?;
        let mut code = 0;
        for argv in &self.config.maintenance.commands {
            info!("maintenance: {}", argv.join(" "));
            code = self.attach(&handle, argv)?;
            if code != 0 || shutdown_requested() {
                break;
            }
        }
        if let Err(e) = handle.leave() {
            warn!("stopping '{}' after maintenance failed: {e}", self.name());
        }
        Ok(code)
    }

    fn privileged_one(&self, cmd: HostCommand) -> HostCommand {
        if self.backend.requires_privilege() {
            self.router.wrap(&cmd)
        } else {
            cmd
        }
    }

    fn privileged(&self, cmds: Vec<HostCommand>) -> Vec<HostCommand> {
        cmds.into_iter().map(|c| self.privileged_one(c)).collect()
    }

    /// Commands an invocation would run. Reads host state, changes nothing.
    pub fn plan(&self, action: &Action, opts: &SessionOptions) -> Result<SessionPlan, CoreError> {
        let mode = self.effective_mode(opts);
        if *action == Action::Stop {
            let teardown = self.network.plan_teardown().map_err(RuntimeError::from)?;
            return Ok(SessionPlan {
                mode,
                display: None,
                network_setup: Vec::new(),
                start: None,
                attach: Vec::new(),
                stop: Some(self.privileged_one(self.backend.stop_command(self.name()))),
                network_teardown: self.privileged(self.network.commands(&teardown)),
            });
        }

        let mounts = self.resolve_mounts(opts, mode)?;
        let (actions, start_args) = self.network.plan_setup(mode).map_err(RuntimeError::from)?;
        let setup = NetworkSetup {
            mode,
            start_args,
            created: Vec::new(),
        };
        let display = match self.display.as_ref().filter(|_| opts.profile == Profile::Interactive) {
            Some(d) => Some(d.command(d.choose_number())?),
            None => None,
        };

        let argvs: Vec<Vec<String>> = match action {
            Action::Run(argv) => vec![argv.clone()],
            Action::Maintain => self.config.maintenance.commands.clone(),
            Action::Start | Action::Stop | Action::MaintainAll => Vec::new(),
        };
        let attach = argvs
            .into_iter()
            .map(|argv| {
                self.backend.attach_command(&AttachRequest {
                    machine: self.name().to_owned(),
                    user: self.attach_user(opts.profile),
                    env: mounts.env_vars.clone(),
                    argv,
                    pty: self.host.stdin_is_tty,
                })
            })
            .collect();
        let stops = *action != Action::Start;

        Ok(SessionPlan {
            mode,
            display,
            network_setup: self.privileged(self.network.commands(&actions)),
            start: Some(self.privileged_one(
                self.backend.start_command(&self.start_spec(&mounts, &setup)),
            )),
            attach,
            stop: stops.then(|| self.privileged_one(self.backend.stop_command(self.name()))),
            network_teardown: if stops {
                self.privileged(self.network.commands(&undo_actions(&actions)))
            } else {
                Vec::new()
            },
        })
    }
}

/// Teardown matching a planned setup.
fn undo_actions(actions: &[NetAction]) -> Vec<NetAction> {
    actions
        .iter()
        .rev()
        .filter_map(|a| match a {
            NetAction::CreateMacvlan { name, .. } => Some(NetAction::DeleteLink(name.clone())),
            NetAction::AddMasquerade { owner, .. } => Some(NetAction::RemoveMasquerade {
                owner: owner.clone(),
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use appcage_runtime::mock::MockBackend;
    use appcage_runtime::network::MockNetworkHost;
    use appcage_schema::parse_config_str;
    use std::fs;
    use std::path::{Path, PathBuf};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        config: ConfigSpec,
    }

    impl Fixture {
        fn new(extra: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let folder = root.join("machine");
            fs::create_dir_all(&folder).unwrap();
            let config = parse_config_str(&format!(
                r#"
[control]
marker = "appcage-control-program"
[environment]
name = "app"
folder = "{}"
user = "alice"
[run]
command = ["true"]
[runtime]
backend = "mock"
lock_timeout_secs = 5
{extra}
"#,
                folder.display()
            ))
            .unwrap();
            Self {
                _dir: dir,
                root,
                config,
            }
        }

        fn host(&self) -> HostContext {
            HostContext {
                uid: 1000,
                home: self.root.join("home"),
                runtime_dir: self.root.join("run"),
                x11_dir: self.root.join("x11"),
                display: None,
                xauthority: None,
                dbus_address: None,
                forwarded: Vec::new(),
                stdin_is_tty: false,
            }
        }

        fn coordinator(&self) -> SessionCoordinator {
            SessionCoordinator::new(
                self.config.clone(),
                self.host(),
                RuntimeLayout::new(self.root.join("rt")),
                Arc::new(PrivilegeRouter::direct()),
            )
            .unwrap()
        }

        fn state_dir(&self) -> PathBuf {
            RuntimeLayout::new(self.root.join("rt")).state_dir("app")
        }

        fn events(&self) -> Vec<String> {
            MockBackend::new(&self.state_dir()).events().unwrap()
        }

        fn net(&self) -> MockNetworkHost {
            MockNetworkHost::new(self.state_dir().join("network-host.json"))
        }
    }

    fn argv(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| (*a).to_owned()).collect()
    }

    /// sudo stand-in logging its arguments; `-n -v` fails as if the cached
    /// credentials had expired.
    fn expiring_sudo(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let log = dir.join("sudo.log");
        let script = dir.join("fake-sudo");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\n[ \"$1\" = -n ] && exit 1\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[test]
    fn last_leave_authorizes_again_before_stopping() {
        let fx = Fixture::new("");
        let (sudo, log) = expiring_sudo(&fx.root);
        let router = PrivilegeRouter::new(appcage_runtime::Elevation::Terminal)
            .with_sudo(sudo.display().to_string());
        let coord = SessionCoordinator::with_parts(
            fx.config.clone(),
            fx.host(),
            RuntimeLayout::new(fx.root.join("rt")),
            Arc::new(router),
            Box::new(MockBackend::new(&fx.state_dir()).requiring_privilege()),
            Box::new(fx.net()),
        );
        coord.prepare(&SessionOptions::default()).unwrap();
        let handle = coord.enter(&SessionOptions::default()).unwrap();
        assert_eq!(coord.attach(&handle, &argv(&["true"])).unwrap(), 0);
        handle.leave().unwrap();

        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().collect::<Vec<_>>(), vec!["-v", "-n -v", "-v"]);
        assert_eq!(fx.events(), vec!["start app", "stop app"]);
    }

    #[test]
    fn prepare_reports_bad_binds_before_elevating() {
        let fx = Fixture::new("[[binds.paths]]\nhost = \"/nonexistent/appcage-test\"\n");
        let (sudo, log) = expiring_sudo(&fx.root);
        let router = PrivilegeRouter::new(appcage_runtime::Elevation::Terminal)
            .with_sudo(sudo.display().to_string());
        let coord = SessionCoordinator::with_parts(
            fx.config.clone(),
            fx.host(),
            RuntimeLayout::new(fx.root.join("rt")),
            Arc::new(router),
            Box::new(MockBackend::new(&fx.state_dir()).requiring_privilege()),
            Box::new(fx.net()),
        );
        let err = coord.prepare(&SessionOptions::default()).err().unwrap();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(!log.exists());
    }

    #[test]
    fn leave_outwaits_a_slow_controller() {
        let fx = Fixture::new("");
        let mut config = fx.config.clone();
        config.runtime.lock_timeout_secs = 1;
        let coord = SessionCoordinator::new(
            config,
            fx.host(),
            RuntimeLayout::new(fx.root.join("rt")),
            Arc::new(PrivilegeRouter::direct()),
        )
        .unwrap();
        let handle = coord.enter(&SessionOptions::default()).unwrap();

        let lock_path = coord.layout().controller_lock("app");
        let held = ControllerLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1500));
            drop(held);
        });
        handle.leave().unwrap();
        releaser.join().unwrap();

        assert!(!coord.is_running().unwrap());
        assert_eq!(fx.events(), vec!["start app", "stop app"]);
    }

    #[test]
    fn single_session_starts_and_stops() {
        let fx = Fixture::new("[network]\nmode = \"nat\"\n");
        let coord = fx.coordinator();
        let handle = coord.enter(&SessionOptions::default()).unwrap();
        assert!(handle.started_environment());
        assert!(coord.is_running().unwrap());
        assert!(coord.network().is_applied());
        assert_eq!(coord.attach(&handle, &argv(&["sh", "-c", "exit 3"])).unwrap(), 3);
        coord.leave(handle).unwrap();
        assert!(!coord.is_running().unwrap());
        assert!(!coord.network().is_applied());
        assert_eq!(fx.events(), vec!["start app", "stop app"]);
    }

    #[test]
    fn nested_sessions_stop_on_last_exit() {
        let fx = Fixture::new("");
        let coord = fx.coordinator();
        let a = coord.enter(&SessionOptions::default()).unwrap();
        let b = coord.enter(&SessionOptions::default()).unwrap();
        assert!(a.started_environment());
        assert!(!b.started_environment());
        a.leave().unwrap();
        assert!(coord.is_running().unwrap());
        b.leave().unwrap();
        assert!(!coord.is_running().unwrap());
        assert_eq!(fx.events(), vec!["start app", "stop app"]);
    }

    #[test]
    fn dropped_handle_still_leaves() {
        let fx = Fixture::new("");
        let coord = fx.coordinator();
        {
            let _handle = coord.enter(&SessionOptions::default()).unwrap();
        }
        assert!(!coord.is_running().unwrap());
        assert!(!coord.has_live_holders().unwrap());
    }

    #[test]
    fn missing_bind_fails_before_any_host_change() {
        let fx = Fixture::new("[[binds.paths]]\nhost = \"/nonexistent/appcage-test\"\n");
        let coord = fx.coordinator();
        let err = coord.enter(&SessionOptions::default()).err().unwrap();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(fx.events().is_empty());
        assert!(!coord.layout().env_dir("app").exists());
    }

    #[test]
    fn startup_failure_rolls_back_network() {
        let fx = Fixture::new("[network]\nmode = \"nat\"\n");
        fs::remove_dir_all(&fx.config.environment.folder).unwrap();
        let coord = fx.coordinator();
        let err = coord.enter(&SessionOptions::default()).err().unwrap();
        assert!(matches!(err, CoreError::Runtime(RuntimeError::Startup(_))));
        assert!(!coord.network().is_applied());
        assert!(!fx.net().masquerade_present("app").unwrap());
        assert!(!coord.has_live_holders().unwrap());
    }

    #[test]
    fn network_override_is_session_scoped() {
        let fx = Fixture::new("[network]\nmode = \"on\"\n");
        let coord = fx.coordinator();
        let opts = SessionOptions {
            network_override: Some(NetworkMode::Nat),
            profile: Profile::Interactive,
        };
        let handle = coord.enter(&opts).unwrap();
        assert_eq!(handle.mode(), NetworkMode::Nat);
        assert_eq!(coord.network().ledger().unwrap().unwrap().mode, NetworkMode::Nat);
        handle.leave().unwrap();
        assert_eq!(coord.config().network.mode, NetworkMode::On);
    }

    #[test]
    fn stop_with_nothing_running_is_a_noop() {
        let fx = Fixture::new("");
        let coord = fx.coordinator();
        assert_eq!(coord.stop_idle().unwrap(), StopOutcome::NotRunning);
        assert!(fx.events().is_empty());
    }

    #[test]
    fn start_then_stop() {
        let fx = Fixture::new("[network]\nmode = \"separate\"\n");
        let coord = fx.coordinator();
        assert!(coord.start_detached(&SessionOptions::default()).unwrap());
        assert!(coord.is_running().unwrap());
        assert!(!coord.has_live_holders().unwrap());
        assert!(!coord.start_detached(&SessionOptions::default()).unwrap());
        assert_eq!(coord.stop_idle().unwrap(), StopOutcome::Stopped);
        assert!(!coord.is_running().unwrap());
        assert!(!coord.network().is_applied());
    }

    #[test]
    fn stop_refuses_while_sessions_are_attached() {
        let fx = Fixture::new("");
        let coord = fx.coordinator();
        let handle = coord.enter(&SessionOptions::default()).unwrap();
        assert!(matches!(coord.stop_idle(), Err(CoreError::Busy(_))));
        handle.leave().unwrap();
    }

    #[test]
    fn entering_a_running_environment_adopts_it() {
        let fx = Fixture::new("");
        let coord = fx.coordinator();
        coord.start_detached(&SessionOptions::default()).unwrap();
        let handle = coord.enter(&SessionOptions::default()).unwrap();
        assert!(!handle.started_environment());
        handle.leave().unwrap();
        assert!(!coord.is_running().unwrap());
        assert_eq!(fx.events(), vec!["start app", "stop app"]);
    }

    #[test]
    fn maintenance_runs_commands_and_refuses_running_env() {
        let fx = Fixture::new(
            "[maintenance]\ncommands = [[\"true\"], [\"sh\", \"-c\", \"exit 4\"], [\"false\"]]\n",
        );
        let coord = fx.coordinator();
        assert_eq!(coord.maintain(None).unwrap(), 4);
        assert!(!coord.is_running().unwrap());

        coord.start_detached(&SessionOptions::default()).unwrap();
        assert!(matches!(coord.maintain(None), Err(CoreError::Busy(_))));
        coord.stop_idle().unwrap();
    }

    #[test]
    fn maintenance_forces_uplink() {
        let fx = Fixture::new("[network]\nmode = \"off\"\n");
        let coord = fx.coordinator();
        let opts = SessionOptions {
            network_override: None,
            profile: Profile::Maintenance,
        };
        assert_eq!(coord.effective_mode(&opts), NetworkMode::On);
        let nat = SessionOptions {
            network_override: Some(NetworkMode::Nat),
            ..opts
        };
        assert_eq!(coord.effective_mode(&nat), NetworkMode::Nat);
    }

    #[test]
    fn plan_changes_nothing() {
        let fx = Fixture::new("[network]\nmode = \"nat\"\n");
        let coord = fx.coordinator();
        let plan = coord
            .plan(&Action::Run(argv(&["bash"])), &SessionOptions::default())
            .unwrap();
        assert_eq!(plan.mode, NetworkMode::Nat);
        assert_eq!(plan.network_setup.len(), 4);
        assert_eq!(plan.network_teardown.len(), 1);
        assert_eq!(plan.attach.len(), 1);
        let start = plan.start.unwrap();
        assert!(start
            .args
            .iter()
            .any(|a| a.starts_with("--network-veth-extra=ve-") && a.ends_with(":host0")));
        assert!(plan.stop.is_some());
        assert!(fx.events().is_empty());
        assert!(!coord.network().is_applied());
        assert!(!Path::new(&coord.layout().env_dir("app")).join("holders.lock").exists());
    }

    #[test]
    fn undo_actions_reverse_creations() {
        let actions = vec![
            NetAction::CreateMacvlan {
                name: "mv-a".to_owned(),
                parent: "eth0".to_owned(),
                mac: "02:00:00:00:00:01".to_owned(),
            },
            NetAction::EnableForwarding,
            NetAction::AddMasquerade {
                owner: "x".to_owned(),
                iface: "ve-a".to_owned(),
            },
        ];
        assert_eq!(
            undo_actions(&actions),
            vec![
                NetAction::RemoveMasquerade {
                    owner: "x".to_owned()
                },
                NetAction::DeleteLink("mv-a".to_owned()),
            ]
        );
    }
}
