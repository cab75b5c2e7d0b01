/// A named bind request that expands to a well-known host location.
///
/// Paths starting with `~/` are relative to the host user's home on the host
/// side and to the environment user's home inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindShortcut {
    pub name: &'static str,
    pub description: &'static str,
    pub path: &'static str,
    pub read_only: bool,
}

pub const BUILTIN_SHORTCUTS: &[BindShortcut] = &[
    BindShortcut {
        name: "downloads",
        description: "Downloads folder",
        path: "~/Downloads",
        read_only: false,
    },
    BindShortcut {
        name: "cache",
        description: "~/.cache",
        path: "~/.cache",
        read_only: false,
    },
    BindShortcut {
        name: "steam",
        description: "steam library",
        path: "~/.local/share/Steam",
        read_only: false,
    },
    BindShortcut {
        name: "gitconfig",
        description: "git config",
        path: "~/.gitconfig",
        read_only: true,
    },
    BindShortcut {
        name: "documents",
        description: "documents",
        path: "~/Documents",
        read_only: false,
    },
    BindShortcut {
        name: "inputs",
        description: "input devices direct access (keyboards, mice, joysticks etc)",
        path: "/dev/input",
        read_only: false,
    },
];

pub fn get_shortcut(name: &str) -> Option<&'static BindShortcut> {
    BUILTIN_SHORTCUTS.iter().find(|s| s.name == name)
}

pub fn list_shortcuts() -> &'static [BindShortcut] {
    BUILTIN_SHORTCUTS
}
