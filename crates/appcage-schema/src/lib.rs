//! Control program configuration for appcage.
//!
//! This crate defines the schema layer: the TOML control program format
//! (`ConfigSpec`), its validation rules, network modes, named bind shortcuts,
//! and the string newtypes shared by the other crates.

pub mod config;
pub mod network;
pub mod shortcuts;
pub mod types;

pub use config::{
    has_control_marker, parse_config_file, parse_config_str, validate_network_compat,
    BindRequest, BindsSection, Capabilities, ConfigError, ConfigSpec, ControlSection,
    DisplaySection, EnvironmentSection, MaintenanceSection, NetworkSection, PackagesSection,
    RunSection, RuntimeSection, CONTROL_FORMAT, CONTROL_MARKER, SHEBANG,
};
pub use network::NetworkMode;
pub use shortcuts::{get_shortcut, list_shortcuts, BindShortcut, BUILTIN_SHORTCUTS};
pub use types::{EnvName, UserName};
