use super::{exit_status, json_pretty, print_fleet_report, spin_fail, spinner, EXIT_SUCCESS};
use appcage_core::{
    discover, parse_invocation, Action, FleetUpdateCoordinator, Invocation, ProcessRunner,
    Profile, RuntimeLayout, SessionCoordinator, SessionOptions, SessionPlan, StopOutcome,
};
use appcage_runtime::host::effective_uid;
use appcage_runtime::privilege::{mark_reexec_started, preserved_env, reexec_under_pkexec};
use appcage_runtime::{check_prereqs, format_missing, Elevation, HostContext, PrivilegeRouter};
use appcage_schema::{parse_config_file, ConfigSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub fn run(program: &Path, args: &[String], json_output: bool) -> Result<u8, String> {
    mark_reexec_started();
    let config = parse_config_file(program)
        .map_err(|e| format!("configuration error: {}: {e}", program.display()))?;
    let invocation = parse_invocation(args, &config.run.command)
        .map_err(|e| format!("configuration error: {e}"))?;

    if invocation.action == Action::MaintainAll {
        return maintain_all(program, &invocation, json_output);
    }

    let host = HostContext::capture();
    let layout = RuntimeLayout::for_user(host.uid);
    let elevation = Elevation::select(config.gui_enabled(), effective_uid());
    let router = Arc::new(PrivilegeRouter::new(elevation));
    let name = config.name().to_string();
    let opts = session_options(&invocation);

    let coord = SessionCoordinator::new(config, host, layout, router)
        .map_err(|e| e.to_string())?;

    if invocation.show {
        let plan = coord
            .plan(&invocation.action, &opts)
            .map_err(|e| e.to_string())?;
        print_plan(&plan, json_output)?;
        return Ok(EXIT_SUCCESS);
    }

    if elevation == Elevation::Graphical && coord.requires_privilege() {
        return reexec(program, args);
    }

    check_host(coord.config(), &opts, &coord, elevation)?;

    match &invocation.action {
        Action::Run(argv) => run_command(&coord, &name, &opts, argv),
        Action::Start => {
            coord.prepare(&opts).map_err(|e| e.to_string())?;
            let pb = spinner(&format!("starting {name}..."));
            match coord.start_detached(&opts) {
                Ok(started) => {
                    pb.finish_and_clear();
                    if started {
                        println!("started {name}");
                    } else {
                        println!("{name} is already running");
                    }
                    Ok(EXIT_SUCCESS)
                }
                Err(e) => {
                    spin_fail(&pb, &format!("{name} did not start"));
                    Err(e.to_string())
                }
            }
        }
        Action::Stop => match coord.stop_idle().map_err(|e| e.to_string())? {
            StopOutcome::Stopped => {
                println!("stopped {name}");
                Ok(EXIT_SUCCESS)
            }
            StopOutcome::NotRunning => {
                println!("{name} is not running");
                Ok(EXIT_SUCCESS)
            }
        },
        Action::Maintain => {
            let code = coord
                .maintain(invocation.network)
                .map_err(|e| e.to_string())?;
            Ok(exit_status(code))
        }
        Action::MaintainAll => maintain_all(program, &invocation, json_output),
    }
}

fn session_options(invocation: &Invocation) -> SessionOptions {
    SessionOptions {
        network_override: invocation.network,
        profile: if invocation.action == Action::Maintain {
            Profile::Maintenance
        } else {
            Profile::Interactive
        },
    }
}

fn run_command(
    coord: &SessionCoordinator,
    name: &str,
    opts: &SessionOptions,
    argv: &[String],
) -> Result<u8, String> {
    // A password prompt must not be drawn over by the spinner.
    coord.prepare(opts).map_err(|e| e.to_string())?;
    let pb = spinner(&format!("entering {name}..."));
    let handle = match coord.enter(opts) {
        Ok(handle) => {
            pb.finish_and_clear();
            handle
        }
        Err(e) => {
            spin_fail(&pb, &format!("{name} is not available"));
            return Err(e.to_string());
        }
    };
    let result = coord.attach(&handle, argv);
    // A failed teardown is reported but never replaces the command's status.
    if let Err(e) = handle.leave() {
        warn!("stopping {name} failed: {e}");
        eprintln!("warning: stopping {name} failed: {e}");
    }
    let code = result.map_err(|e| e.to_string())?;
    debug!("{name}: command exited with {code}");
    Ok(exit_status(code))
}

fn check_host(
    config: &ConfigSpec,
    opts: &SessionOptions,
    coord: &SessionCoordinator,
    elevation: Elevation,
) -> Result<(), String> {
    if std::env::var("APPCAGE_SKIP_PREREQS").as_deref() == Ok("1") {
        return Ok(());
    }
    let missing = check_prereqs(config, coord.effective_mode(opts), elevation);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format_missing(&missing))
    }
}

fn reexec(program: &Path, args: &[String]) -> Result<u8, String> {
    let exe = std::env::current_exe().map_err(|e| format!("cannot locate appcage: {e}"))?;
    let mut full = vec!["control".to_owned(), program.display().to_string()];
    full.extend(args.iter().cloned());
    let code = reexec_under_pkexec(&exe, &full, &preserved_env()).map_err(|e| e.to_string())?;
    Ok(exit_status(code))
}

fn sibling_dir(program: &Path) -> PathBuf {
    match program.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn maintain_all(program: &Path, invocation: &Invocation, json_output: bool) -> Result<u8, String> {
    let dir = sibling_dir(program);
    if invocation.show {
        let targets = discover(&dir).map_err(|e| e.to_string())?;
        for target in targets {
            println!(">>> {} ++aptupdate", target.display());
        }
        return Ok(EXIT_SUCCESS);
    }
    let runner = ProcessRunner::current().map_err(|e| e.to_string())?;
    let report = FleetUpdateCoordinator::new(runner)
        .update_all(&dir)
        .map_err(|e| e.to_string())?;
    print_fleet_report(&report, json_output)
}

fn print_plan(plan: &SessionPlan, json_output: bool) -> Result<(), String> {
    let mut lines = Vec::new();
    if let Some(display) = &plan.display {
        lines.push(display.to_string());
    }
    lines.extend(plan.network_setup.iter().map(ToString::to_string));
    lines.extend(plan.start.iter().map(ToString::to_string));
    lines.extend(plan.attach.iter().map(ToString::to_string));
    lines.extend(plan.stop.iter().map(ToString::to_string));
    lines.extend(plan.network_teardown.iter().map(ToString::to_string));

    if json_output {
        let payload = serde_json::json!({
            "network": plan.mode.as_str(),
            "commands": lines,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("# network: {}", plan.mode);
        for line in lines {
            println!(">>> {line}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use appcage_schema::NetworkMode;

    #[test]
    fn maintenance_profile_only_for_aptupdate() {
        let inv = Invocation {
            action: Action::Maintain,
            show: false,
            network: Some(NetworkMode::Nat),
        };
        let opts = session_options(&inv);
        assert_eq!(opts.profile, Profile::Maintenance);
        assert_eq!(opts.network_override, Some(NetworkMode::Nat));

        let inv = Invocation {
            action: Action::Start,
            show: false,
            network: None,
        };
        assert_eq!(session_options(&inv).profile, Profile::Interactive);
    }

    #[test]
    fn siblings_of_a_bare_name_are_in_cwd() {
        assert_eq!(sibling_dir(Path::new("chrome")), PathBuf::from("."));
        assert_eq!(sibling_dir(Path::new("/opt/bin/chrome")), PathBuf::from("/opt/bin"));
    }
}
