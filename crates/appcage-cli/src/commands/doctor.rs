use super::{EXIT_FAILURE, EXIT_SUCCESS};
use appcage_core::RuntimeLayout;
use appcage_runtime::host::{effective_uid, invoker_uid};
use std::path::Path;

pub fn run(json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);
    check_address_service(&mut checks);
    check_runtime_dir(&RuntimeLayout::for_user(invoker_uid()), &mut checks);

    if effective_uid() == 0 {
        checks.push(Check::info("elevation", "Running as root; no elevation needed"));
    } else {
        checks.push(Check::info(
            "elevation",
            "Privileged steps use sudo, or pkexec for gui environments",
        ));
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = appcage_runtime::check_all_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass("host_prereqs", "Host prerequisites satisfied"));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "host_prereqs",
            &appcage_runtime::format_missing(&missing),
        ));
    }
}

fn check_address_service(checks: &mut Vec<Check>) {
    let active = std::process::Command::new("systemctl")
        .args(["is-active", "--quiet", "systemd-networkd"])
        .status()
        .is_ok_and(|s| s.success());
    if active {
        checks.push(Check::pass(
            "address_service",
            "systemd-networkd is active (nat networking available)",
        ));
    } else {
        checks.push(Check::warn(
            "address_service",
            "systemd-networkd is not active; nat networking will fail",
        ));
    }
}

fn check_runtime_dir(layout: &RuntimeLayout, checks: &mut Vec<Check>) {
    let root = layout.root();
    let parent = root.parent().unwrap_or(Path::new("/"));
    if root.is_dir() {
        let envs = std::fs::read_dir(root).map_or(0, |entries| {
            entries.flatten().filter(|e| e.path().is_dir()).count()
        });
        checks.push(Check::info(
            "runtime_dir",
            &format!("{} ({envs} environment(s) with runtime state)", root.display()),
        ));
    } else if parent.is_dir() {
        checks.push(Check::info(
            "runtime_dir",
            &format!("{} will be created on first use", root.display()),
        ));
    } else {
        checks.push(Check::warn(
            "runtime_dir",
            &format!("{} does not exist; is there a login session?", parent.display()),
        ));
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("appcage doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
