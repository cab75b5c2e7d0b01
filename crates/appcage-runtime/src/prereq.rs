use crate::command::command_exists;
use crate::privilege::Elevation;
use appcage_schema::{ConfigSpec, NetworkMode};
use std::fmt;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

const SYSTEMD_CONTAINER: &str =
    "apt install systemd-container | dnf install systemd-container | zypper install systemd-container";

struct Tool {
    name: &'static str,
    purpose: &'static str,
    install_hint: &'static str,
}

const NSPAWN: Tool = Tool {
    name: "systemd-nspawn",
    purpose: "booting environments",
    install_hint: SYSTEMD_CONTAINER,
};
const MACHINECTL: Tool = Tool {
    name: "machinectl",
    purpose: "querying and stopping environments",
    install_hint: SYSTEMD_CONTAINER,
};
const SYSTEMD_RUN: Tool = Tool {
    name: "systemd-run",
    purpose: "attaching commands to running environments",
    install_hint: "part of systemd",
};
const IP: Tool = Tool {
    name: "ip",
    purpose: "creating virtual interfaces for nat and separate networking",
    install_hint: "apt install iproute2 | dnf install iproute | zypper install iproute2",
};
const NFT: Tool = Tool {
    name: "nft",
    purpose: "address translation for nat networking",
    install_hint: "apt install nftables | dnf install nftables | zypper install nftables",
};
const SUDO: Tool = Tool {
    name: "sudo",
    purpose: "terminal privilege elevation",
    install_hint: "apt install sudo | dnf install sudo | zypper install sudo",
};
const PKEXEC: Tool = Tool {
    name: "pkexec",
    purpose: "graphical privilege elevation for gui environments",
    install_hint: "apt install pkexec | dnf install polkit | zypper install polkit",
};
const XEPHYR: Tool = Tool {
    name: "Xephyr",
    purpose: "private nested display for gui_private",
    install_hint: "apt install xserver-xephyr | dnf install xorg-x11-server-Xephyr | zypper install xorg-x11-server-Xephyr",
};

fn check(tools: &[&Tool]) -> Vec<MissingPrereq> {
    tools
        .iter()
        .filter(|t| !command_exists(t.name))
        .map(|t| MissingPrereq {
            name: t.name,
            purpose: t.purpose,
            install_hint: t.install_hint,
        })
        .collect()
}

/// Tools one invocation of a control program needs.
pub fn check_prereqs(config: &ConfigSpec, mode: NetworkMode, elevation: Elevation) -> Vec<MissingPrereq> {
    let mut tools = vec![&NSPAWN, &MACHINECTL, &SYSTEMD_RUN];
    match mode {
        NetworkMode::Nat => tools.extend([&IP, &NFT]),
        NetworkMode::Separate => tools.push(&IP),
        NetworkMode::Off | NetworkMode::On => {}
    }
    match elevation {
        Elevation::Terminal => tools.push(&SUDO),
        Elevation::Graphical => tools.push(&PKEXEC),
        Elevation::Direct => {}
    }
    if config.capabilities.gui_private {
        if let Some(program) = config.display.private_server.first() {
            if program == XEPHYR.name {
                tools.push(&XEPHYR);
            }
        }
    }
    check(&tools)
}

/// Every tool any appcage feature may use.
pub fn check_all_prereqs() -> Vec<MissingPrereq> {
    check(&[
        &NSPAWN,
        &MACHINECTL,
        &SYSTEMD_RUN,
        &IP,
        &NFT,
        &SUDO,
        &PKEXEC,
        &XEPHYR,
    ])
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nappcage needs these tools on the host to run environments.");
    msg
}
