use std::path::{Path, PathBuf};

/// Variables forwarded into every attached command when set on the host.
const FORWARDED_VARS: &[&str] = &["TERM", "LANG", "LANGUAGE"];

/// Facts about the invoking user's session that mount resolution and
/// attachment depend on.
///
/// Captured once per invocation. When the control program runs elevated the
/// uid and home still describe the user who invoked it, not root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    pub uid: u32,
    pub home: PathBuf,
    /// `/run/user/<uid>` for the invoking user.
    pub runtime_dir: PathBuf,
    pub x11_dir: PathBuf,
    pub display: Option<String>,
    pub xauthority: Option<PathBuf>,
    pub dbus_address: Option<String>,
    /// Terminal type and locale variables.
    pub forwarded: Vec<(String, String)>,
    pub stdin_is_tty: bool,
}

impl HostContext {
    pub fn capture() -> Self {
        let uid = invoker_uid();
        let home = if uid == effective_uid() {
            std::env::var_os("HOME").map(PathBuf::from)
        } else {
            None
        }
        .or_else(|| home_for_uid(uid))
        .unwrap_or_else(|| PathBuf::from("/"));

        let mut forwarded: Vec<(String, String)> = FORWARDED_VARS
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| ((*k).to_owned(), v)))
            .collect();
        let mut locale: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with("LC_"))
            .collect();
        locale.sort();
        forwarded.extend(locale);

        Self {
            uid,
            home,
            runtime_dir: PathBuf::from(format!("/run/user/{uid}")),
            x11_dir: PathBuf::from("/tmp/.X11-unix"),
            display: std::env::var("DISPLAY").ok().filter(|d| !d.is_empty()),
            xauthority: std::env::var_os("XAUTHORITY").map(PathBuf::from),
            dbus_address: std::env::var("DBUS_SESSION_BUS_ADDRESS").ok(),
            forwarded,
            stdin_is_tty: stdin_is_terminal(),
        }
    }

    /// Number of the host X display, from `:0`, `:1.0` or `unix/:0` forms.
    pub fn display_number(&self) -> Option<u32> {
        let display = self.display.as_deref()?;
        let (_, rest) = display.rsplit_once(':')?;
        rest.split('.').next()?.parse().ok()
    }

    /// Filesystem path of the session bus socket, when it is a plain unix path.
    pub fn dbus_socket(&self) -> Option<PathBuf> {
        let address = self.dbus_address.as_deref()?;
        address
            .split(';')
            .find_map(|a| a.strip_prefix("unix:"))
            .and_then(|params| {
                params
                    .split(',')
                    .find_map(|kv| kv.strip_prefix("path="))
                    .map(PathBuf::from)
            })
    }

    /// Resolve a `~/`-relative path against the invoking user's home.
    pub fn expand_home(&self, path: &str) -> PathBuf {
        match path.strip_prefix("~/") {
            Some(rest) => self.home.join(rest),
            None => PathBuf::from(path),
        }
    }
}

/// Home directory of an account inside the environment.
pub fn env_home(user: &str) -> PathBuf {
    if user == "root" {
        PathBuf::from("/root")
    } else {
        Path::new("/home").join(user)
    }
}

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
pub fn real_uid() -> u32 {
    // SAFETY: getuid() is always safe, no arguments, no side effects, cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid() is always safe, no arguments, no side effects, cannot fail.
    unsafe { libc::geteuid() }
}

#[allow(unsafe_code)]
pub fn stdin_is_terminal() -> bool {
    // SAFETY: isatty() only inspects the fd, no side effects.
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

/// The uid of the user who asked for this invocation.
///
/// When running as root through pkexec or sudo, the original caller is
/// recovered from `PKEXEC_UID` or `SUDO_UID`; a genuine root login stays 0.
pub fn invoker_uid() -> u32 {
    let uid = real_uid();
    if uid != 0 {
        return uid;
    }
    invoker_uid_from(|k| std::env::var(k).ok()).unwrap_or(0)
}

fn invoker_uid_from(lookup: impl Fn(&str) -> Option<String>) -> Option<u32> {
    ["PKEXEC_UID", "SUDO_UID"]
        .iter()
        .find_map(|k| lookup(k).and_then(|v| v.trim().parse().ok()))
}

fn home_for_uid(uid: u32) -> Option<PathBuf> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    home_from_passwd(&passwd, uid)
}

fn home_from_passwd(passwd: &str, uid: u32) -> Option<PathBuf> {
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 6 && fields[2].parse::<u32>().ok() == Some(uid) {
            Some(PathBuf::from(fields[5]))
        } else {
            None
        }
    })
}
