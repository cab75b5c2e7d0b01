use super::host::{LinkInfo, NetworkHost};
use super::{NetAction, NetworkError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Simulated host network state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockNetState {
    pub links: Vec<LinkInfo>,
    pub masquerades: Vec<String>,
    pub forwarding: bool,
    pub address_service: bool,
    /// Labels of every applied action, in order.
    pub actions: Vec<String>,
}

impl Default for MockNetState {
    fn default() -> Self {
        let mut lo = LinkInfo::ether("lo");
        lo.loopback = true;
        lo.link_type = "loopback".to_owned();
        let mut wlan = LinkInfo::ether("wlan0");
        wlan.wireless = true;
        Self {
            links: vec![lo, LinkInfo::ether("eth0"), wlan],
            masquerades: Vec::new(),
            forwarding: false,
            address_service: true,
            actions: Vec::new(),
        }
    }
}

/// A `NetworkHost` kept in a JSON file, shared by every process pointing at it.
#[derive(Debug, Clone)]
pub struct MockNetworkHost {
    path: PathBuf,
    fail_on: Option<&'static str>,
}

impl MockNetworkHost {
    pub fn new(path: PathBuf) -> Self {
        Self { path, fail_on: None }
    }

    /// Make every action with this label fail.
    #[must_use]
    pub fn failing_on(mut self, label: &'static str) -> Self {
        self.fail_on = Some(label);
        self
    }

    pub fn state(&self) -> Result<MockNetState, NetworkError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MockNetState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &MockNetState) -> Result<(), NetworkError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut MockNetState) -> Result<(), NetworkError>) -> Result<(), NetworkError> {
        let mut state = self.state()?;
        f(&mut state)?;
        self.save(&state)
    }

    pub fn actions(&self) -> Result<Vec<String>, NetworkError> {
        Ok(self.state()?.actions)
    }

    pub fn has_link(&self, name: &str) -> Result<bool, NetworkError> {
        Ok(self.state()?.links.iter().any(|l| l.name == name))
    }

    pub fn add_link(&self, link: LinkInfo) -> Result<(), NetworkError> {
        self.update(|s| {
            s.links.push(link);
            Ok(())
        })
    }

    pub fn remove_link(&self, name: &str) -> Result<(), NetworkError> {
        self.update(|s| {
            s.links.retain(|l| l.name != name);
            Ok(())
        })
    }

    pub fn set_address_service(&self, active: bool) -> Result<(), NetworkError> {
        self.update(|s| {
            s.address_service = active;
            Ok(())
        })
    }
}

fn virtual_link(name: &str, kind: &str) -> LinkInfo {
    let mut link = LinkInfo::ether(name);
    link.up = false;
    link.kind = Some(kind.to_owned());
    link
}

impl NetworkHost for MockNetworkHost {
    fn links(&self) -> Result<Vec<LinkInfo>, NetworkError> {
        Ok(self.state()?.links)
    }

    fn address_service_available(&self) -> bool {
        self.state().is_ok_and(|s| s.address_service)
    }

    fn masquerade_present(&self, owner: &str) -> Result<bool, NetworkError> {
        Ok(self.state()?.masquerades.iter().any(|m| m == owner))
    }

    fn apply(&self, action: &NetAction) -> Result<(), NetworkError> {
        if self.fail_on == Some(action.label()) {
            return Err(NetworkError::Command(format!("injected {} failure", action.label())));
        }
        self.update(|s| {
            let exists = |s: &MockNetState, name: &str| s.links.iter().any(|l| l.name == name);
            match action {
                NetAction::DeleteLink(name) => {
                    if !exists(s, name) {
                        return Err(NetworkError::Command(format!("{name}: no such device")));
                    }
                    s.links.retain(|l| &l.name != name);
                }
                NetAction::CreateMacvlan { name, parent, .. } => {
                    if !exists(s, parent) {
                        return Err(NetworkError::Command(format!("{parent}: no such device")));
                    }
                    if exists(s, name) {
                        return Err(NetworkError::Command(format!("{name}: file exists")));
                    }
                    s.links.push(virtual_link(name, "macvlan"));
                }
                NetAction::EnableForwarding => s.forwarding = true,
                NetAction::AddMasquerade { owner, .. } => {
                    if !s.masquerades.contains(owner) {
                        s.masquerades.push(owner.clone());
                    }
                }
                NetAction::RemoveMasquerade { owner } => s.masquerades.retain(|m| m != owner),
            }
            s.actions.push(action.label().to_owned());
            Ok(())
        })
    }
}
