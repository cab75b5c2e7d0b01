//! Host-side network provisioning, one setup/teardown per `NetworkMode`.
//!
//! Setup runs before the environment boots and returns the systemd-nspawn
//! arguments that attach the created artifacts. Everything setup creates is
//! recorded in a per-environment ledger so that whichever process performs
//! the last exit tears down exactly what exists, even if it was invoked with
//! a different mode override or the creator crashed.

pub mod host;
pub mod mock;

pub use host::{IpNetworkHost, LinkInfo, NetworkHost};
pub use mock::MockNetworkHost;

use crate::command::HostCommand;
use crate::privilege::PrivilegeRouter;
use appcage_schema::NetworkMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const NAT_TABLE: &str = "appcage";
/// Interface name prefixes owned by appcage.
pub const OWN_PREFIXES: &[&str] = &["ve-", "mv-"];
/// Name of the nat link inside the environment. systemd-networkd's stock
/// container configuration matches it and asks the host side for a lease.
pub const GUEST_IFACE: &str = "host0";

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("systemd-networkd is not active; nat networking needs it to assign addresses")]
    AddressServiceUnavailable,
    #[error("no eligible host interface for separate networking (needs a wired interface that is up)")]
    NoEligibleInterface,
    #[error("network command failed: {0}")]
    Command(String),
    #[error("unexpected interface listing: {0}")]
    Parse(String),
    #[error("network ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network ledger is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One host-side change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAction {
    DeleteLink(String),
    CreateMacvlan { name: String, parent: String, mac: String },
    EnableForwarding,
    AddMasquerade { owner: String, iface: String },
    RemoveMasquerade { owner: String },
}

impl NetAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeleteLink(_) => "delete-link",
            Self::CreateMacvlan { .. } => "create-macvlan",
            Self::EnableForwarding => "enable-forwarding",
            Self::AddMasquerade { .. } => "add-masquerade",
            Self::RemoveMasquerade { .. } => "remove-masquerade",
        }
    }
}

/// A host artifact that setup created and teardown must remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Artifact {
    Link { name: String },
    Masquerade { owner: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLedger {
    pub mode: NetworkMode,
    pub artifacts: Vec<Artifact>,
}

/// Outcome of a successful setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSetup {
    pub mode: NetworkMode,
    pub start_args: Vec<String>,
    /// Artifacts created by this call, not ones that already existed.
    pub created: Vec<Artifact>,
}

struct Step {
    action: NetAction,
    creates: Option<Artifact>,
}

pub struct NetworkProvisioner {
    env_name: String,
    host: Box<dyn NetworkHost>,
    ledger_path: PathBuf,
}

impl NetworkProvisioner {
    pub fn new(env_name: &str, host: Box<dyn NetworkHost>, ledger_path: PathBuf) -> Self {
        Self {
            env_name: env_name.to_owned(),
            host,
            ledger_path,
        }
    }

    /// Short stable tag for interface names, which are limited to 15 bytes.
    pub fn tag(&self) -> String {
        short_hash(self.env_name.as_bytes())
    }

    /// Host side of the nat veth pair. systemd-nspawn creates the pair at
    /// boot and removes it when the environment stops.
    pub fn veth_name(&self) -> String {
        format!("ve-{}", self.tag())
    }

    pub fn macvlan_name(&self, parent: &str) -> String {
        format!("mv-{}", short_hash(format!("{}/{parent}", self.env_name).as_bytes()))
    }

    /// Deterministic, locally administered unicast address.
    pub fn macvlan_address(&self, parent: &str) -> String {
        let digest = blake3::hash(format!("mac:{}/{parent}", self.env_name).as_bytes());
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&digest.as_bytes()[..6]);
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn steps(&self, mode: NetworkMode) -> Result<(Vec<Step>, Vec<String>), NetworkError> {
        match mode {
            NetworkMode::Off => Ok((Vec::new(), vec!["--private-network".to_owned()])),
            NetworkMode::On => Ok((Vec::new(), Vec::new())),
            NetworkMode::Nat => {
                if !self.host.address_service_available() {
                    return Err(NetworkError::AddressServiceUnavailable);
                }
                let ve = self.veth_name();
                let mut steps = vec![Step {
                    action: NetAction::EnableForwarding,
                    creates: None,
                }];
                if !self.host.masquerade_present(&self.env_name)? {
                    steps.push(Step {
                        action: NetAction::AddMasquerade {
                            owner: self.env_name.clone(),
                            iface: ve.clone(),
                        },
                        creates: Some(Artifact::Masquerade {
                            owner: self.env_name.clone(),
                        }),
                    });
                }
                Ok((steps, vec![format!("--network-veth-extra={ve}:{GUEST_IFACE}")]))
            }
            NetworkMode::Separate => {
                let links = self.host.links()?;
                let parents: Vec<&LinkInfo> =
                    links.iter().filter(|l| l.separate_eligible()).collect();
                if parents.is_empty() {
                    return Err(NetworkError::NoEligibleInterface);
                }
                let mut steps = Vec::new();
                let mut args = Vec::new();
                for parent in parents {
                    let name = self.macvlan_name(&parent.name);
                    if !links.iter().any(|l| l.name == name) {
                        steps.push(Step {
                            action: NetAction::CreateMacvlan {
                                name: name.clone(),
                                parent: parent.name.clone(),
                                mac: self.macvlan_address(&parent.name),
                            },
                            creates: Some(Artifact::Link { name: name.clone() }),
                        });
                    }
                    args.push(format!("--network-interface={name}"));
                }
                Ok((steps, args))
            }
        }
    }

    /// Actions setup would perform right now, and the resulting start arguments.
    pub fn plan_setup(&self, mode: NetworkMode) -> Result<(Vec<NetAction>, Vec<String>), NetworkError> {
        let (steps, args) = self.steps(mode)?;
        Ok((steps.into_iter().map(|s| s.action).collect(), args))
    }

    /// Apply `mode`. Existing artifacts are reused, so repeating setup is a no-op.
    /// A failure part-way undoes what this call created.
    pub fn setup(&self, mode: NetworkMode) -> Result<NetworkSetup, NetworkError> {
        let (steps, start_args) = self.steps(mode)?;
        let mut created = Vec::new();
        for step in steps {
            if let Err(e) = self.host.apply(&step.action) {
                warn!("network {} failed, undoing partial setup: {e}", step.action.label());
                if let Err(undo) = self.undo(&created) {
                    warn!("undoing partial network setup failed: {undo}");
                }
                return Err(e);
            }
            if let Some(artifact) = step.creates {
                created.push(artifact);
            }
        }

        let mut ledger = self.ledger()?.unwrap_or(NetworkLedger {
            mode,
            artifacts: Vec::new(),
        });
        ledger.mode = mode;
        for artifact in &created {
            if !ledger.artifacts.contains(artifact) {
                ledger.artifacts.push(artifact.clone());
            }
        }
        if let Err(e) = self.write_ledger(&ledger) {
            if let Err(undo) = self.undo(&created) {
                warn!("undoing network setup failed: {undo}");
            }
            return Err(e);
        }
        info!("network '{mode}' ready for '{}'", self.env_name);
        Ok(NetworkSetup {
            mode,
            start_args,
            created,
        })
    }

    /// Undo a setup whose environment never started.
    pub fn rollback(&self, setup: &NetworkSetup) -> Result<(), NetworkError> {
        let result = self.undo(&setup.created);
        self.remove_ledger()?;
        result
    }

    /// Actions teardown would perform right now.
    pub fn plan_teardown(&self) -> Result<Vec<NetAction>, NetworkError> {
        let links = self.host.links()?;
        let artifacts = match self.ledger()? {
            Some(ledger) => ledger.artifacts,
            None => self.expected_artifacts(&links),
        };
        self.removal_actions(&artifacts, &links)
    }

    /// Remove every recorded artifact that still exists, then the ledger.
    /// Without a ledger, anything carrying this environment's names is swept.
    pub fn teardown(&self) -> Result<(), NetworkError> {
        let actions = self.plan_teardown()?;
        let mut first_err = None;
        for action in &actions {
            if let Err(e) = self.host.apply(action) {
                warn!("network {} failed during teardown: {e}", action.label());
                first_err.get_or_insert(e);
            }
        }
        self.remove_ledger()?;
        debug!("network torn down for '{}'", self.env_name);
        first_err.map_or(Ok(()), Err)
    }

    /// Take ownership of artifacts left by a holder that died after the
    /// environment started.
    pub fn adopt(&self, mode: NetworkMode) -> Result<(), NetworkError> {
        if self.ledger()?.is_some() {
            return Ok(());
        }
        let links = self.host.links()?;
        let ledger = NetworkLedger {
            mode,
            artifacts: self.expected_artifacts(&links),
        };
        info!(
            "adopting running '{}' with {} network artifact(s)",
            self.env_name,
            ledger.artifacts.len()
        );
        self.write_ledger(&ledger)
    }

    pub fn is_applied(&self) -> bool {
        self.ledger_path.exists()
    }

    pub fn ledger(&self) -> Result<Option<NetworkLedger>, NetworkError> {
        match fs::read_to_string(&self.ledger_path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn commands(&self, actions: &[NetAction]) -> Vec<HostCommand> {
        actions.iter().flat_map(|a| self.host.commands(a)).collect()
    }

    fn expected_artifacts(&self, links: &[LinkInfo]) -> Vec<Artifact> {
        let mut names = vec![self.veth_name()];
        names.extend(links.iter().map(|l| self.macvlan_name(&l.name)));
        let mut artifacts: Vec<Artifact> = names
            .into_iter()
            .filter(|n| links.iter().any(|l| &l.name == n))
            .map(|name| Artifact::Link { name })
            .collect();
        if self.host.masquerade_present(&self.env_name).unwrap_or(false) {
            artifacts.push(Artifact::Masquerade {
                owner: self.env_name.clone(),
            });
        }
        artifacts
    }

    fn removal_actions(
        &self,
        artifacts: &[Artifact],
        links: &[LinkInfo],
    ) -> Result<Vec<NetAction>, NetworkError> {
        let mut actions = Vec::new();
        for artifact in artifacts.iter().rev() {
            match artifact {
                Artifact::Link { name } => {
                    if links.iter().any(|l| &l.name == name) {
                        actions.push(NetAction::DeleteLink(name.clone()));
                    }
                }
                Artifact::Masquerade { owner } => {
                    if self.host.masquerade_present(owner)? {
                        actions.push(NetAction::RemoveMasquerade {
                            owner: owner.clone(),
                        });
                    }
                }
            }
        }
        Ok(actions)
    }

    fn undo(&self, created: &[Artifact]) -> Result<(), NetworkError> {
        let links = self.host.links()?;
        let mut first_err = None;
        for action in self.removal_actions(created, &links)? {
            if let Err(e) = self.host.apply(&action) {
                warn!("network {} failed while undoing: {e}", action.label());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn write_ledger(&self, ledger: &NetworkLedger) -> Result<(), NetworkError> {
        let dir = self.ledger_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(ledger)?.as_bytes())?;
        tmp.persist(&self.ledger_path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove_ledger(&self) -> Result<(), NetworkError> {
        match fs::remove_file(&self.ledger_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn short_hash(input: &[u8]) -> String {
    blake3::hash(input).to_hex()[..8].to_owned()
}

/// The network host matching a backend: the mock backend never touches the
/// real host.
pub fn select_network_host(
    backend: &str,
    router: Arc<PrivilegeRouter>,
    state_dir: &Path,
) -> Box<dyn NetworkHost> {
    if backend == "mock" {
        Box::new(MockNetworkHost::new(state_dir.join("network-host.json")))
    } else {
        Box::new(IpNetworkHost::new(router))
    }
}
