use crate::network::NetworkMode;
use crate::shortcuts::get_shortcut;
use crate::types::{EnvName, UserName};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Value of `control.marker` in every generated control program. Fleet
/// discovery matches on it without executing the file.
pub const CONTROL_MARKER: &str = "appcage-control-program";
pub const CONTROL_FORMAT: u32 = 1;
/// First line of a control program; lets the kernel hand the file to `appcage control`.
pub const SHEBANG: &str = "#!/usr/bin/env -S appcage control";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read control program: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse control program: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to render control program: {0}")]
    RenderToml(#[from] toml::ser::Error),
    #[error("not an appcage control program (control.marker is '{0}')")]
    MissingMarker(String),
    #[error("unsupported control.format: {0}, expected {CONTROL_FORMAT}")]
    UnsupportedFormat(u32),
    #[error("invalid environment name '{name}' - try '{suggestion}' instead?")]
    InvalidName { name: String, suggestion: String },
    #[error("environment folder must be an absolute path: {0}")]
    RelativeFolder(PathBuf),
    #[error("environment.user must not be empty")]
    EmptyUser,
    #[error("unknown bind shortcut '{0}'")]
    UnknownShortcut(String),
    #[error("invalid bind request '{host}': {reason}")]
    InvalidBind { host: String, reason: String },
    #[error("required bind source does not exist: {0}")]
    MissingBindSource(PathBuf),
    #[error("host resource unavailable: {0}")]
    HostResource(String),
    #[error("incompatible settings: {0}")]
    IncompatibleFlags(String),
    #[error("network mode not understood: '{0}' (choose one of off, on, nat, separate)")]
    InvalidNetworkMode(String),
    #[error("maintenance command {0} is empty")]
    EmptyMaintenanceCommand(usize),
    #[error("{0}")]
    InvalidArguments(String),
}

/// Immutable configuration baked into a control program.
///
/// Produced once when the environment is created and never mutated by the
/// control program; per-invocation overrides live in the session instead.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigSpec {
    pub control: ControlSection,
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub binds: BindsSection,
    #[serde(default)]
    pub packages: PackagesSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ControlSection {
    pub marker: String,
    #[serde(default = "default_format")]
    pub format: u32,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            marker: CONTROL_MARKER.to_owned(),
            format: CONTROL_FORMAT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSection {
    pub name: EnvName,
    pub folder: PathBuf,
    #[serde(default)]
    pub distribution: String,
    pub user: UserName,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Capabilities {
    #[serde(default)]
    pub gui: bool,
    #[serde(default)]
    pub gui_private: bool,
    #[serde(default)]
    pub sound: bool,
    #[serde(default, rename = "3d")]
    pub three_d: bool,
    #[serde(default)]
    pub webcam: bool,
    #[serde(default)]
    pub dbus: bool,
}

impl Capabilities {
    /// A private display and 3D both need a display, so they imply gui.
    pub fn gui_enabled(&self) -> bool {
        self.gui || self.gui_private || self.three_d
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DisplaySection {
    /// Nested X server command. `%%TITLE%%` and `%%NUM%%` are substituted.
    #[serde(default = "default_private_server")]
    pub private_server: Vec<String>,
    /// Started inside the environment once a private display is up. Empty disables.
    #[serde(default = "default_window_manager")]
    pub window_manager: String,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            private_server: default_private_server(),
            window_manager: default_window_manager(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    #[serde(default)]
    pub mode: NetworkMode,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BindsSection {
    #[serde(default)]
    pub shortcuts: Vec<String>,
    #[serde(default)]
    pub paths: Vec<BindRequest>,
}

/// A raw host path exposed inside the environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BindRequest {
    pub host: String,
    /// Mount point inside the environment; defaults to the host path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    /// Skip silently when the host path is missing instead of failing.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackagesSection {
    #[serde(default)]
    pub list: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceSection {
    #[serde(default = "default_maintenance_commands")]
    pub commands: Vec<Vec<String>>,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            commands: default_maintenance_commands(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
    #[serde(default)]
    pub nspawn_extra_args: Vec<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            lock_timeout_secs: default_lock_timeout(),
            boot_timeout_secs: default_boot_timeout(),
            nspawn_extra_args: Vec::new(),
        }
    }
}

fn default_format() -> u32 {
    CONTROL_FORMAT
}

fn default_private_server() -> Vec<String> {
    [
        "Xephyr",
        "-resizeable",
        "-title",
        "%%TITLE%%",
        "-no-host-grab",
        "-host-cursor",
        ":%%NUM%%",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

fn default_window_manager() -> String {
    "matchbox-window-manager".to_owned()
}

fn default_maintenance_commands() -> Vec<Vec<String>> {
    vec![
        vec!["apt-get".to_owned(), "update".to_owned()],
        vec!["apt-get".to_owned(), "upgrade".to_owned(), "-y".to_owned()],
    ]
}

fn default_backend() -> String {
    "nspawn".to_owned()
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_boot_timeout() -> u64 {
    60
}

impl ConfigSpec {
    /// Minimal configuration for an existing environment folder.
    pub fn new(name: &str, folder: impl Into<PathBuf>, user: &str) -> Self {
        Self {
            control: ControlSection::default(),
            environment: EnvironmentSection {
                name: EnvName::new(name),
                folder: folder.into(),
                distribution: String::new(),
                user: UserName::new(user),
            },
            capabilities: Capabilities::default(),
            display: DisplaySection::default(),
            network: NetworkSection::default(),
            binds: BindsSection::default(),
            packages: PackagesSection::default(),
            run: RunSection::default(),
            maintenance: MaintenanceSection::default(),
            runtime: RuntimeSection::default(),
        }
    }

    pub fn name(&self) -> &EnvName {
        &self.environment.name
    }

    pub fn gui_enabled(&self) -> bool {
        self.capabilities.gui_enabled()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.lock_timeout_secs)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.boot_timeout_secs)
    }

    /// Check the settings that can be judged without looking at the host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.marker != CONTROL_MARKER {
            return Err(ConfigError::MissingMarker(self.control.marker.clone()));
        }
        if self.control.format != CONTROL_FORMAT {
            return Err(ConfigError::UnsupportedFormat(self.control.format));
        }

        let name = &self.environment.name;
        if !name.is_valid() {
            return Err(ConfigError::InvalidName {
                name: name.to_string(),
                suggestion: EnvName::sanitized(name),
            });
        }
        if !self.environment.folder.is_absolute() {
            return Err(ConfigError::RelativeFolder(self.environment.folder.clone()));
        }
        if self.environment.user.trim().is_empty() {
            return Err(ConfigError::EmptyUser);
        }

        for shortcut in &self.binds.shortcuts {
            if get_shortcut(shortcut).is_none() {
                return Err(ConfigError::UnknownShortcut(shortcut.clone()));
            }
        }
        for bind in &self.binds.paths {
            validate_bind_request(bind)?;
        }

        validate_network_compat(&self.capabilities, self.network.mode)?;

        for (i, cmd) in self.maintenance.commands.iter().enumerate() {
            if !cmd.first().is_some_and(|p| !p.trim().is_empty()) {
                return Err(ConfigError::EmptyMaintenanceCommand(i));
            }
        }
        Ok(())
    }

    /// Render as an executable control program.
    pub fn render(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self)?;
        Ok(format!(
            "{SHEBANG}\n# appcage control program for '{}'. Pass ++show to see what it does.\n\n{body}",
            self.environment.name
        ))
    }
}

/// A private display is reachable through the shared namespace when network
/// mode is `on`, which defeats its purpose.
pub fn validate_network_compat(caps: &Capabilities, mode: NetworkMode) -> Result<(), ConfigError> {
    if caps.gui_private && mode.shares_host_namespace() {
        return Err(ConfigError::IncompatibleFlags(
            "gui_private requires a network mode other than 'on'".to_owned(),
        ));
    }
    Ok(())
}

fn validate_bind_request(bind: &BindRequest) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidBind {
        host: bind.host.clone(),
        reason: reason.to_owned(),
    };
    let host = bind.host.trim();
    if host.is_empty() {
        return Err(invalid("host path is empty"));
    }
    if !(host.starts_with('/') || host.starts_with("~/")) {
        return Err(invalid("host path must be absolute or start with ~/"));
    }
    if host.contains(':') {
        return Err(invalid("paths must not contain ':'"));
    }
    if let Some(target) = &bind.target {
        if !target.starts_with('/') {
            return Err(invalid("target must be an absolute path"));
        }
        if target.contains(':') {
            return Err(invalid("paths must not contain ':'"));
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct MarkerProbe {
    control: Option<ControlSection>,
}

/// Whether `text` declares itself a control program, regardless of whether
/// the rest of it is valid.
pub fn has_control_marker(text: &str) -> bool {
    matches!(
        toml::from_str::<MarkerProbe>(text),
        Ok(MarkerProbe { control: Some(c) }) if c.marker == CONTROL_MARKER
    )
}

pub fn parse_config_str(input: &str) -> Result<ConfigSpec, ConfigError> {
    let config: ConfigSpec = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ConfigSpec, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
