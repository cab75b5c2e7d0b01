use super::{NetAction, NetworkError, NAT_TABLE, OWN_PREFIXES};
use crate::command::HostCommand;
use crate::privilege::PrivilegeRouter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

/// One host network interface as reported by `ip -j -d link show`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub link_type: String,
    /// Set when the link's peer or lower device lives in another namespace.
    pub netnsid: Option<i64>,
    /// `veth`, `macvlan`, `bridge`... for virtual links.
    pub kind: Option<String>,
    pub wireless: bool,
}

impl LinkInfo {
    pub fn ether(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            up: true,
            loopback: false,
            link_type: "ether".to_owned(),
            netnsid: None,
            kind: None,
            wireless: false,
        }
    }

    /// Can carry a macvlan for separate networking. Wireless drivers refuse
    /// secondary hardware addresses.
    pub fn separate_eligible(&self) -> bool {
        self.up
            && !self.loopback
            && self.link_type == "ether"
            && self.netnsid.is_none()
            && !self.wireless
            && !OWN_PREFIXES.iter().any(|p| self.name.starts_with(p))
    }
}

/// The host side of network provisioning.
pub trait NetworkHost: Send + Sync {
    fn links(&self) -> Result<Vec<LinkInfo>, NetworkError>;

    /// Whether systemd-networkd is active to hand out addresses on `ve-*` links.
    fn address_service_available(&self) -> bool;

    fn masquerade_present(&self, owner: &str) -> Result<bool, NetworkError>;

    fn apply(&self, action: &NetAction) -> Result<(), NetworkError>;

    /// Commands that `apply` runs for this action, for display.
    fn commands(&self, action: &NetAction) -> Vec<HostCommand> {
        ip_commands(action)
    }
}

pub fn masquerade_comment(owner: &str) -> String {
    format!("appcage:{owner}")
}

pub fn ip_commands(action: &NetAction) -> Vec<HostCommand> {
    match action {
        NetAction::DeleteLink(name) => {
            vec![HostCommand::new("ip").args(["link", "delete", name.as_str()])]
        }
        NetAction::CreateMacvlan { name, parent, mac } => vec![HostCommand::new("ip").args([
            "link",
            "add",
            "link",
            parent.as_str(),
            "name",
            name.as_str(),
            "address",
            mac.as_str(),
            "type",
            "macvlan",
            "mode",
            "bridge",
        ])],
        NetAction::EnableForwarding => vec![HostCommand::new("sysctl")
            .args(["-q", "-w", "net.ipv4.ip_forward=1"])],
        NetAction::AddMasquerade { owner, iface } => vec![
            HostCommand::new("nft").args(["add", "table", "ip", NAT_TABLE]),
            HostCommand::new("nft").args([
                "add",
                "chain",
                "ip",
                NAT_TABLE,
                "postrouting",
                "{ type nat hook postrouting priority 100 ; }",
            ]),
            HostCommand::new("nft")
                .args(["add", "rule", "ip", NAT_TABLE, "postrouting", "iifname"])
                .arg(iface.as_str())
                .args(["masquerade", "comment"])
                .arg(format!("\"{}\"", masquerade_comment(owner))),
        ],
        NetAction::RemoveMasquerade { owner } => vec![HostCommand::new("nft")
            .args(["delete", "rule", "ip", NAT_TABLE, "postrouting", "handle"])
            .arg(format!("<{}>", masquerade_comment(owner)))],
    }
}

/// Parse the JSON emitted by `ip -j -d link show`.
pub fn parse_links(json: &str) -> Result<Vec<LinkInfo>, NetworkError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let entries = value
        .as_array()
        .ok_or_else(|| NetworkError::Parse("expected a JSON array".to_owned()))?;
    entries
        .iter()
        .map(|entry| {
            let name = entry["ifname"]
                .as_str()
                .ok_or_else(|| NetworkError::Parse("link without ifname".to_owned()))?
                .to_owned();
            let flags: Vec<&str> = entry["flags"]
                .as_array()
                .map(|f| f.iter().filter_map(serde_json::Value::as_str).collect())
                .unwrap_or_default();
            Ok(LinkInfo {
                name,
                up: flags.contains(&"UP"),
                loopback: flags.contains(&"LOOPBACK"),
                link_type: entry["link_type"].as_str().unwrap_or_default().to_owned(),
                netnsid: entry["link_netnsid"].as_i64(),
                kind: entry["linkinfo"]["info_kind"].as_str().map(str::to_owned),
                wireless: false,
            })
        })
        .collect()
}

/// Find the nft rule handle carrying our comment in `nft -a list chain` output.
pub fn find_rule_handle(listing: &str, owner: &str) -> Option<u64> {
    let needle = format!("comment \"{}\"", masquerade_comment(owner));
    listing
        .lines()
        .find(|l| l.contains(&needle))
        .and_then(|l| l.rsplit_once("# handle "))
        .and_then(|(_, h)| h.trim().parse().ok())
}

/// Real host, driven through `ip`, `sysctl` and `nft`.
pub struct IpNetworkHost {
    router: Arc<PrivilegeRouter>,
}

impl IpNetworkHost {
    pub fn new(router: Arc<PrivilegeRouter>) -> Self {
        Self { router }
    }

    fn list_chain(&self) -> Result<Option<String>, NetworkError> {
        let cmd = HostCommand::new("nft").args(["-a", "list", "chain", "ip", NAT_TABLE, "postrouting"]);
        let output = self
            .router
            .output(&cmd)
            .map_err(|e| NetworkError::Command(e.to_string()))?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(None)
        }
    }

    fn run(&self, cmd: &HostCommand) -> Result<(), NetworkError> {
        self.router
            .run(cmd)
            .map_err(|e| NetworkError::Command(e.to_string()))
    }
}

impl NetworkHost for IpNetworkHost {
    fn links(&self) -> Result<Vec<LinkInfo>, NetworkError> {
        let output = Command::new("ip")
            .args(["-j", "-d", "link", "show"])
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(NetworkError::Command("ip -j -d link show failed".to_owned()));
        }
        let mut links = parse_links(&String::from_utf8_lossy(&output.stdout))?;
        for link in &mut links {
            link.wireless = Path::new("/sys/class/net")
                .join(&link.name)
                .join("wireless")
                .exists();
        }
        Ok(links)
    }

    fn address_service_available(&self) -> bool {
        Command::new("systemctl")
            .args(["is-active", "--quiet", "systemd-networkd"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn masquerade_present(&self, owner: &str) -> Result<bool, NetworkError> {
        Ok(self
            .list_chain()?
            .is_some_and(|listing| find_rule_handle(&listing, owner).is_some()))
    }

    fn apply(&self, action: &NetAction) -> Result<(), NetworkError> {
        debug!("network: {}", action.label());
        if let NetAction::RemoveMasquerade { owner } = action {
            let Some(handle) = self
                .list_chain()?
                .and_then(|listing| find_rule_handle(&listing, owner))
            else {
                return Ok(());
            };
            return self.run(
                &HostCommand::new("nft")
                    .args(["delete", "rule", "ip", NAT_TABLE, "postrouting", "handle"])
                    .arg(handle.to_string()),
            );
        }
        for cmd in ip_commands(action) {
            self.run(&cmd)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_JSON: &str = r#"[
      {"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"link_type":"loopback"},
      {"ifindex":2,"ifname":"enp3s0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"link_type":"ether"},
      {"ifindex":3,"ifname":"enp4s0","flags":["BROADCAST","MULTICAST"],"link_type":"ether"},
      {"ifindex":7,"ifname":"ve-web","flags":["BROADCAST","UP"],"link_type":"ether","link_netnsid":0,
       "linkinfo":{"info_kind":"veth"}}
    ]"#;

    #[test]
    fn parses_ip_json() {
        let links = parse_links(IP_JSON).unwrap();
        assert_eq!(links.len(), 4);
        assert!(links[0].loopback);
        assert!(links[1].up);
        assert!(!links[2].up);
        assert_eq!(links[3].netnsid, Some(0));
        assert_eq!(links[3].kind.as_deref(), Some("veth"));
    }

    #[test]
    fn eligibility_for_separate() {
        let links = parse_links(IP_JSON).unwrap();
        let eligible: Vec<&str> = links
            .iter()
            .filter(|l| l.separate_eligible())
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(eligible, vec!["enp3s0"]);

        let mut wifi = LinkInfo::ether("wlp2s0");
        wifi.wireless = true;
        assert!(!wifi.separate_eligible());
        assert!(!LinkInfo::ether("mv-1234abcd").separate_eligible());
    }

    #[test]
    fn finds_rule_handle_by_comment() {
        let listing = r#"table ip appcage {
	chain postrouting { # handle 1
		type nat hook postrouting priority srcnat; policy accept;
		iifname "ve-aa" masquerade comment "appcage:web" # handle 4
		iifname "ve-bb" masquerade comment "appcage:mail" # handle 9
	}
}"#;
        assert_eq!(find_rule_handle(listing, "mail"), Some(9));
        assert_eq!(find_rule_handle(listing, "web"), Some(4));
        assert_eq!(find_rule_handle(listing, "chat"), None);
    }

    #[test]
    fn masquerade_commands_tag_rule() {
        let cmds = ip_commands(&NetAction::AddMasquerade {
            owner: "web".to_owned(),
            iface: "ve-aa".to_owned(),
        });
        assert_eq!(cmds.len(), 3);
        let rule = cmds[2].to_string();
        assert!(rule.contains("iifname ve-aa masquerade comment"));
        assert!(rule.contains("appcage:web"));
    }
}
