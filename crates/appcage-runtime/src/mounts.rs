use crate::host::{env_home, HostContext};
use appcage_schema::{
    get_shortcut, validate_network_compat, BindRequest, ConfigError, ConfigSpec, NetworkMode,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where host sockets appear inside the environment.
pub const HOST_SOCKET_DIR: &str = "/run/user/host";

const GPU_DEVICES: &[&str] = &[
    "/dev/dri",
    "/dev/shm",
    "/dev/nvidia0",
    "/dev/nvidiactl",
    "/dev/nvidia-modeset",
];

const THEME_DIRS: &[&str] = &["/usr/share/themes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindKind {
    Device,
    Socket,
    Path,
}

/// One host path exposed inside the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
    /// Start must fail if the source is missing at that point.
    pub required: bool,
    pub kind: BindKind,
}

impl BindEntry {
    /// The systemd-nspawn argument for this entry.
    pub fn nspawn_arg(&self) -> String {
        let flag = if self.read_only { "--bind-ro" } else { "--bind" };
        if self.source == self.target {
            format!("{flag}={}", self.source.display())
        } else {
            format!("{flag}={}:{}", self.source.display(), self.target.display())
        }
    }
}

/// Result of expanding a configuration against the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMounts {
    /// Devices first, then sockets, then plain paths.
    pub binds: Vec<BindEntry>,
    /// Variables for the attached command's environment.
    pub env_vars: Vec<(String, String)>,
}

impl ResolvedMounts {
    pub fn nspawn_args(&self) -> Vec<String> {
        self.binds.iter().map(BindEntry::nspawn_arg).collect()
    }

    fn push(&mut self, entry: BindEntry) {
        if self.binds.iter().any(|b| b.target == entry.target) {
            debug!("skipping duplicate bind target {}", entry.target.display());
            return;
        }
        self.binds.push(entry);
    }

    fn set_var(&mut self, key: &str, value: String) {
        if let Some(slot) = self.env_vars.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.env_vars.push((key.to_owned(), value));
        }
    }
}

/// Expand capability flags and bind requests into concrete bindings.
///
/// Depends only on its inputs and the host filesystem. Nothing is mounted
/// and no privileged call is made; every configuration problem, including a
/// missing required host path, is reported here.
pub fn resolve(
    config: &ConfigSpec,
    host: &HostContext,
    mode: NetworkMode,
) -> Result<ResolvedMounts, ConfigError> {
    let caps = &config.capabilities;
    validate_network_compat(caps, mode)?;

    let user = config.environment.user.as_str();
    let home_inside = env_home(user);
    let mut out = ResolvedMounts::default();

    if caps.three_d {
        for dev in GPU_DEVICES {
            push_device(&mut out, Path::new(dev));
        }
    }
    if caps.webcam {
        for dev in webcam_devices(Path::new("/dev/v4l")) {
            push_device(&mut out, &dev);
        }
    }

    let x0 = PathBuf::from("/tmp/.X11-unix/X0");
    if caps.gui_private {
        out.push(BindEntry {
            source: host.x11_dir.join(format!("mac-{}", config.name())),
            target: x0,
            read_only: false,
            required: true,
            kind: BindKind::Socket,
        });
        out.set_var("DISPLAY", ":0".to_owned());
    } else if caps.gui_enabled() {
        let num = host.display_number().ok_or_else(|| {
            ConfigError::HostResource("gui needs DISPLAY to name an X display".to_owned())
        })?;
        let socket = host.x11_dir.join(format!("X{num}"));
        push_socket(&mut out, socket, x0)?;
        if let Some(xauth) = host.xauthority.as_ref().filter(|p| p.exists()) {
            let target = PathBuf::from(HOST_SOCKET_DIR).join("Xauthority");
            out.push(BindEntry {
                source: xauth.clone(),
                target: target.clone(),
                read_only: true,
                required: true,
                kind: BindKind::Socket,
            });
            out.set_var("XAUTHORITY", target.display().to_string());
        }
        out.set_var("DISPLAY", ":0".to_owned());
    }
    if caps.sound {
        let pulse = host.runtime_dir.join("pulse");
        let target = PathBuf::from(HOST_SOCKET_DIR).join("pulse");
        push_socket(&mut out, pulse, target.clone())?;
        out.set_var(
            "PULSE_SERVER",
            format!("unix:{}", target.join("native").display()),
        );
    }
    if caps.dbus {
        let socket = host.dbus_socket().ok_or_else(|| {
            ConfigError::HostResource(
                "dbus needs DBUS_SESSION_BUS_ADDRESS to name a unix socket path".to_owned(),
            )
        })?;
        let target = PathBuf::from(HOST_SOCKET_DIR).join("dbus");
        push_socket(&mut out, socket, target.clone())?;
        out.set_var(
            "DBUS_SESSION_BUS_ADDRESS",
            format!("unix:path={}", target.display()),
        );
    }

    if caps.gui_enabled() {
        let user_themes = host.home.join(".themes");
        let themes = THEME_DIRS
            .iter()
            .map(|d| (PathBuf::from(d), PathBuf::from(d)))
            .chain(std::iter::once((user_themes, home_inside.join(".themes"))));
        for (source, target) in themes {
            if source.exists() {
                out.push(BindEntry {
                    source,
                    target,
                    read_only: true,
                    required: false,
                    kind: BindKind::Path,
                });
            }
        }
    }

    for name in &config.binds.shortcuts {
        let shortcut =
            get_shortcut(name).ok_or_else(|| ConfigError::UnknownShortcut(name.clone()))?;
        let request = BindRequest {
            host: shortcut.path.to_owned(),
            target: None,
            read_only: shortcut.read_only,
            optional: false,
        };
        push_request(&mut out, &request, host, &home_inside)?;
    }
    for request in &config.binds.paths {
        push_request(&mut out, request, host, &home_inside)?;
    }

    for (k, v) in &host.forwarded {
        out.set_var(k, v.clone());
    }

    Ok(out)
}

fn push_device(out: &mut ResolvedMounts, dev: &Path) {
    if dev.exists() {
        out.push(BindEntry {
            source: dev.to_path_buf(),
            target: dev.to_path_buf(),
            read_only: false,
            required: false,
            kind: BindKind::Device,
        });
    } else {
        debug!("device {} not present, skipping", dev.display());
    }
}

fn push_socket(out: &mut ResolvedMounts, source: PathBuf, target: PathBuf) -> Result<(), ConfigError> {
    if !source.exists() {
        return Err(ConfigError::HostResource(format!(
            "{} does not exist",
            source.display()
        )));
    }
    out.push(BindEntry {
        source,
        target,
        read_only: false,
        required: true,
        kind: BindKind::Socket,
    });
    Ok(())
}

fn push_request(
    out: &mut ResolvedMounts,
    request: &BindRequest,
    host: &HostContext,
    home_inside: &Path,
) -> Result<(), ConfigError> {
    let source = host.expand_home(&request.host);
    let target = match (&request.target, request.host.strip_prefix("~/")) {
        (Some(t), _) => PathBuf::from(t),
        (None, Some(rest)) => home_inside.join(rest),
        (None, None) => source.clone(),
    };
    if !source.exists() {
        if request.optional {
            debug!("optional bind {} is missing, skipping", source.display());
            return Ok(());
        }
        return Err(ConfigError::MissingBindSource(source));
    }
    out.push(BindEntry {
        source,
        target,
        read_only: request.read_only,
        required: !request.optional,
        kind: BindKind::Path,
    });
    Ok(())
}

/// The v4l directory plus the device nodes its by-id links point at.
fn webcam_devices(v4l: &Path) -> Vec<PathBuf> {
    if !v4l.exists() {
        return Vec::new();
    }
    let mut nodes: Vec<PathBuf> = std::fs::read_dir(v4l.join("by-id"))
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|e| std::fs::canonicalize(e.path()).ok())
        .collect();
    nodes.sort();
    nodes.dedup();
    let mut devices = vec![v4l.to_path_buf()];
    devices.extend(nodes);
    devices
}
