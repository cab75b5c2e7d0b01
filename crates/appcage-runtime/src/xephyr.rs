use crate::command::{signal_process, HostCommand};
use crate::RuntimeError;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SOCKET_WAIT: Duration = Duration::from_secs(10);

/// A nested X server giving one environment its own display.
///
/// The environment always sees it as display 0 through a `mac-<name>` link
/// in the X socket directory, so the host display number may vary.
pub struct PrivateDisplay {
    name: String,
    template: Vec<String>,
    x11_dir: PathBuf,
    lock_dir: PathBuf,
}

impl PrivateDisplay {
    pub fn new(name: &str, template: &[String]) -> Self {
        Self {
            name: name.to_owned(),
            template: template.to_vec(),
            x11_dir: PathBuf::from("/tmp/.X11-unix"),
            lock_dir: PathBuf::from("/tmp"),
        }
    }

    #[must_use]
    pub fn with_dirs(mut self, x11_dir: &Path, lock_dir: &Path) -> Self {
        self.x11_dir = x11_dir.to_path_buf();
        self.lock_dir = lock_dir.to_path_buf();
        self
    }

    /// Stable first choice in 10..=98 so an environment tends to keep its number.
    pub fn preferred_number(name: &str) -> u32 {
        let digest = blake3::hash(name.as_bytes());
        10 + u32::from(digest.as_bytes()[31]) % 89
    }

    pub fn link_path(&self) -> PathBuf {
        self.x11_dir.join(format!("mac-{}", self.name))
    }

    pub fn socket_path(&self, num: u32) -> PathBuf {
        self.x11_dir.join(format!("X{num}"))
    }

    fn lock_path(&self, num: u32) -> PathBuf {
        self.lock_dir.join(format!(".X{num}-lock"))
    }

    /// First free display number at or after the preferred one.
    pub fn choose_number(&self) -> u32 {
        let preferred = Self::preferred_number(&self.name);
        (preferred..u32::MAX)
            .find(|n| !self.socket_path(*n).exists() && !self.lock_path(*n).exists())
            .unwrap_or(preferred)
    }

    fn linked_number(&self) -> Option<u32> {
        let target = fs::read_link(self.link_path()).ok()?;
        target
            .file_name()?
            .to_str()?
            .strip_prefix('X')?
            .parse()
            .ok()
    }

    /// Number of our display if it is currently up.
    pub fn current_number(&self) -> Option<u32> {
        self.linked_number()
            .filter(|n| self.socket_path(*n).exists())
    }

    pub fn command(&self, num: u32) -> Result<HostCommand, RuntimeError> {
        let title = format!("appcage: {}", self.name);
        let argv: Vec<String> = self
            .template
            .iter()
            .map(|a| a.replace("%%TITLE%%", &title).replace("%%NUM%%", &num.to_string()))
            .collect();
        HostCommand::from_argv(&argv)
            .ok_or_else(|| RuntimeError::Display("display.private_server is empty".to_owned()))
    }

    /// Start the display unless it is already up, and link it for the environment.
    pub fn start(&self, owner_uid: Option<u32>) -> Result<u32, RuntimeError> {
        if let Some(num) = self.current_number() {
            debug!("private display :{num} already up for '{}'", self.name);
            return Ok(num);
        }
        let num = self.choose_number();
        let cmd = self.command(num)?;
        info!("starting private display :{num} for '{}'", self.name);
        debug!("{cmd}");
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()?;

        let socket = self.socket_path(num);
        let deadline = Instant::now() + SOCKET_WAIT;
        while !socket.exists() {
            if let Some(status) = child.try_wait()? {
                return Err(RuntimeError::Display(format!(
                    "{} exited with {status} before creating {}",
                    cmd.program,
                    socket.display()
                )));
            }
            if Instant::now() > deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Display(format!(
                    "{} did not appear within {}s",
                    socket.display(),
                    SOCKET_WAIT.as_secs()
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let link = self.link_path();
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(&socket, &link)?;
        if let Some(uid) = owner_uid {
            std::os::unix::fs::lchown(&link, Some(uid), None)?;
        }
        Ok(num)
    }

    /// Terminate the display server and remove the link. Idempotent.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        let Some(num) = self.linked_number() else {
            return Ok(());
        };
        if let Ok(text) = fs::read_to_string(self.lock_path(num)) {
            if let Ok(pid) = text.trim().parse::<u32>() {
                debug!("stopping private display :{num} (pid {pid})");
                signal_process(pid, libc::SIGTERM)?;
            }
        }
        match fs::remove_file(self.link_path()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn display(dir: &Path) -> PrivateDisplay {
        let template: Vec<String> = ["Xephyr", "-title", "%%TITLE%%", ":%%NUM%%"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        PrivateDisplay::new("chat", &template).with_dirs(dir, dir)
    }

    #[test]
    fn preferred_number_in_range_and_stable() {
        for name in ["a", "chrome", "steam", "zoom"] {
            let n = PrivateDisplay::preferred_number(name);
            assert!((10..=98).contains(&n));
            assert_eq!(n, PrivateDisplay::preferred_number(name));
        }
    }

    #[test]
    fn choose_number_skips_taken_displays() {
        let dir = tempfile::tempdir().unwrap();
        let d = display(dir.path());
        let preferred = PrivateDisplay::preferred_number("chat");
        assert_eq!(d.choose_number(), preferred);
        fs::write(d.socket_path(preferred), b"").unwrap();
        assert_eq!(d.choose_number(), preferred + 1);
    }

    #[test]
    fn command_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = display(dir.path()).command(42).unwrap();
        assert_eq!(cmd.args, vec!["-title", "appcage: chat", ":42"]);
    }

    #[test]
    fn current_number_follows_link() {
        let dir = tempfile::tempdir().unwrap();
        let d = display(dir.path());
        assert_eq!(d.current_number(), None);
        fs::write(d.socket_path(33), b"").unwrap();
        std::os::unix::fs::symlink(d.socket_path(33), d.link_path()).unwrap();
        assert_eq!(d.current_number(), Some(33));
        fs::remove_file(d.socket_path(33)).unwrap();
        assert_eq!(d.current_number(), None);
    }

    #[test]
    fn stop_signals_lock_holder_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let d = display(dir.path());
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(d.lock_path(40), format!("      {}\n", child.id())).unwrap();
        std::os::unix::fs::symlink(d.socket_path(40), d.link_path()).unwrap();

        d.stop().unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(fs::symlink_metadata(d.link_path()).is_err());
        d.stop().unwrap();
    }
}
