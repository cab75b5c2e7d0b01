use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the environment's network namespace relates to the host's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Private namespace with loopback only.
    Off,
    /// Host interfaces shared directly. Ports collide with host services and
    /// outside observers cannot tell host and environment traffic apart.
    #[default]
    On,
    /// Virtual interface pair behind address translation on the host.
    Nat,
    /// One macvlan with its own hardware address per eligible host interface.
    Separate,
}

impl NetworkMode {
    pub const ALL: [NetworkMode; 4] = [Self::Off, Self::On, Self::Nat, Self::Separate];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Nat => "nat",
            Self::Separate => "separate",
        }
    }

    /// Whether the host's own interfaces are visible inside the environment.
    pub fn shares_host_namespace(self) -> bool {
        matches!(self, Self::On)
    }

    /// Whether outbound access (package mirrors) is available.
    pub fn has_uplink(self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| ConfigError::InvalidNetworkMode(s.to_owned()))
    }
}
