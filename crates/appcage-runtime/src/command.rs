use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

/// A host program invocation, kept as data so it can be shown, wrapped for
/// elevation, or executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build from an argv vector. Returns `None` when it is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Prefix this command with another program, e.g. `sudo -n`.
    #[must_use]
    pub fn prefixed(&self, program: &str, flags: &[&str]) -> Self {
        let mut args: Vec<String> = flags.iter().map(|f| (*f).to_owned()).collect();
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());
        Self {
            program: program.to_owned(),
            args,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_word(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_word(arg))?;
        }
        Ok(())
    }
}

/// Quote a word for display in a POSIX shell, leaving plain words bare.
pub fn shell_word(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '+' | ',' | '@' | '%')
        });
    if plain {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Exit code as a shell would report it: signals become 128 + signo.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Wait for `child`. The first interrupt reported by `interrupts` sends it
/// SIGTERM and any further one SIGKILL. The child is always reaped before
/// returning.
pub fn wait_cancellable(child: &mut Child, interrupts: &dyn Fn() -> u32) -> io::Result<i32> {
    let mut sent = 0;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(exit_code(status));
        }
        let seen = interrupts();
        if seen > sent && sent < 2 {
            let signal = if seen == 1 { libc::SIGTERM } else { libc::SIGKILL };
            tracing::debug!("signalling attached command (pid {}) with {signal}", child.id());
            signal_process(child.id(), signal)?;
            sent = seen.min(2);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Send `signal` to `pid`. A process that already exited is not an error.
pub fn signal_process(pid: u32, signal: i32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    // SAFETY: kill() with a validated pid and a signal number has no memory effects.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, signal) };
    if ret != 0 {
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            return Err(errno);
        }
    }
    Ok(())
}

/// Whether `name` resolves on `$PATH`.
pub fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_only_when_needed() {
        let cmd = HostCommand::new("systemd-run")
            .args(["-M", "chrome", "--pipe"])
            .arg("echo it's here");
        assert_eq!(cmd.to_string(), "systemd-run -M chrome --pipe 'echo it'\\''s here'");
    }

    #[test]
    fn shell_word_prevents_injection() {
        assert_eq!(shell_word("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_word("`whoami`"), "'`whoami`'");
        assert_eq!(shell_word(""), "''");
        assert_eq!(shell_word("--bind-ro=/a:/b"), "--bind-ro=/a:/b");
    }

    #[test]
    fn prefixed_wraps_program() {
        let cmd = HostCommand::new("machinectl").args(["stop", "x"]);
        let wrapped = cmd.prefixed("sudo", &["-n"]);
        assert_eq!(wrapped.program, "sudo");
        assert_eq!(wrapped.args, vec!["-n", "machinectl", "stop", "x"]);
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(HostCommand::from_argv(&[]).is_none());
        let cmd = HostCommand::from_argv(&["ls".to_owned(), "-l".to_owned()]).unwrap();
        assert_eq!(cmd.program, "ls");
    }

    #[test]
    fn wait_cancellable_returns_exit_code() {
        let mut child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        assert_eq!(wait_cancellable(&mut child, &|| 0).unwrap(), 7);
    }

    #[test]
    fn wait_cancellable_terminates_on_cancel() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let code = wait_cancellable(&mut child, &|| 1).unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[test]
    fn repeated_interrupt_kills_a_command_ignoring_sigterm() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .spawn()
            .unwrap();
        let polls = std::cell::Cell::new(0u32);
        let interrupts = || -> u32 {
            polls.set(polls.get() + 1);
            if polls.get() < 10 { 1 } else { 2 }
        };
        let code = wait_cancellable(&mut child, &interrupts).unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }
}
