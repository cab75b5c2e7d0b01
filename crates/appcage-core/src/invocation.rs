use appcage_schema::{ConfigError, NetworkMode};

/// What one control program invocation asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start if needed, run argv, stop if last.
    Run(Vec<String>),
    /// Start and leave the environment running.
    Start,
    /// Stop an environment nobody is attached to.
    Stop,
    /// Run the maintenance commands in a freshly started environment.
    Maintain,
    /// Maintain every control program in the same directory.
    MaintainAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub action: Action,
    /// Print what would happen instead of doing it.
    pub show: bool,
    /// Session-only network mode.
    pub network: Option<NetworkMode>,
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::InvalidArguments(msg.into())
}

fn set_action(slot: &mut Option<Action>, action: Action, flag: &str) -> Result<(), ConfigError> {
    if slot.is_some() {
        return Err(invalid(format!("{flag} cannot be combined with another action")));
    }
    *slot = Some(action);
    Ok(())
}

/// Parse control program arguments.
///
/// `++` options come first. `++cmd` consumes everything after it as the
/// command. The first argument that is not a `++` option ends option
/// parsing; it and everything after are appended to `default_command`.
pub fn parse_invocation(args: &[String], default_command: &[String]) -> Result<Invocation, ConfigError> {
    let mut show = false;
    let mut network = None;
    let mut action: Option<Action> = None;
    let mut explicit_command: Option<Vec<String>> = None;
    let mut rest: &[String] = &[];

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "++show" => show = true,
            "++start" => set_action(&mut action, Action::Start, arg)?,
            "++stop" => set_action(&mut action, Action::Stop, arg)?,
            "++aptupdate" => set_action(&mut action, Action::Maintain, arg)?,
            "++aptupdateall" => set_action(&mut action, Action::MaintainAll, arg)?,
            "++network" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| invalid("++network needs one of off, on, nat, separate"))?;
                network = Some(value.parse::<NetworkMode>()?);
                i += 1;
            }
            "++cmd" => {
                let argv = args[i + 1..].to_vec();
                if argv.is_empty() {
                    return Err(invalid("++cmd needs a command to run"));
                }
                explicit_command = Some(argv);
                break;
            }
            _ if arg.starts_with("++") => {
                return Err(invalid(format!(
                    "unknown option {arg} (options: ++show ++start ++stop ++cmd ++network ++aptupdate ++aptupdateall)"
                )));
            }
            _ => {
                rest = &args[i..];
                break;
            }
        }
        i += 1;
    }

    let action = match (action, explicit_command) {
        (Some(_), Some(_)) => {
            return Err(invalid("++cmd cannot be combined with ++start, ++stop or ++aptupdate"));
        }
        (Some(a), None) => {
            if !rest.is_empty() {
                return Err(invalid(format!(
                    "unexpected arguments after the action: {}",
                    rest.join(" ")
                )));
            }
            a
        }
        (None, Some(argv)) => Action::Run(argv),
        (None, None) => {
            let argv: Vec<String> = default_command.iter().chain(rest).cloned().collect();
            if argv.is_empty() {
                return Err(invalid(
                    "no default command is configured; specify one with ++cmd <command...>",
                ));
            }
            Action::Run(argv)
        }
    };

    Ok(Invocation {
        action,
        show,
        network,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| (*a).to_owned()).collect()
    }

    #[test]
    fn default_command_with_passthrough() {
        let inv = parse_invocation(&args(&["--incognito", "++show"]), &args(&["chrome"])).unwrap();
        assert_eq!(inv.action, Action::Run(args(&["chrome", "--incognito", "++show"])));
        assert!(!inv.show);
    }

    #[test]
    fn options_before_passthrough() {
        let inv = parse_invocation(
            &args(&["++show", "++network", "nat", "http://x"]),
            &args(&["firefox"]),
        )
        .unwrap();
        assert!(inv.show);
        assert_eq!(inv.network, Some(NetworkMode::Nat));
        assert_eq!(inv.action, Action::Run(args(&["firefox", "http://x"])));
    }

    #[test]
    fn cmd_replaces_default_and_swallows_rest() {
        let inv = parse_invocation(&args(&["++cmd", "bash", "++stop"]), &args(&["firefox"])).unwrap();
        assert_eq!(inv.action, Action::Run(args(&["bash", "++stop"])));
    }

    #[test]
    fn lifecycle_actions() {
        let none: Vec<String> = Vec::new();
        assert_eq!(parse_invocation(&args(&["++start"]), &none).unwrap().action, Action::Start);
        assert_eq!(parse_invocation(&args(&["++stop"]), &none).unwrap().action, Action::Stop);
        assert_eq!(
            parse_invocation(&args(&["++aptupdate"]), &none).unwrap().action,
            Action::Maintain
        );
        assert_eq!(
            parse_invocation(&args(&["++aptupdateall"]), &none).unwrap().action,
            Action::MaintainAll
        );
    }

    #[test]
    fn missing_command_is_an_error() {
        let err = parse_invocation(&[], &[]).unwrap_err();
        assert!(err.to_string().contains("++cmd"));
        assert!(parse_invocation(&args(&["++cmd"]), &args(&["x"])).is_err());
    }

    #[test]
    fn rejects_bad_combinations() {
        let d = args(&["app"]);
        assert!(parse_invocation(&args(&["++start", "++stop"]), &d).is_err());
        assert!(parse_invocation(&args(&["++start", "++cmd", "ls"]), &d).is_err());
        assert!(parse_invocation(&args(&["++stop", "extra"]), &d).is_err());
        assert!(parse_invocation(&args(&["++bogus"]), &d).is_err());
        assert!(parse_invocation(&args(&["++network"]), &d).is_err());
        assert!(matches!(
            parse_invocation(&args(&["++network", "bridge"]), &d),
            Err(ConfigError::InvalidNetworkMode(_))
        ));
    }
}
