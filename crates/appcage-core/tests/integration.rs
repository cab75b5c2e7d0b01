//! Session lifecycle tests against the mock backend and mock network host.

use appcage_core::{
    CoreError, FleetUpdateCoordinator, RuntimeLayout, SessionCoordinator, SessionOptions,
    StopOutcome, TargetOutcome, TargetRunner,
};
use appcage_runtime::mock::MockBackend;
use appcage_runtime::network::MockNetworkHost;
use appcage_runtime::{HostContext, PrivilegeRouter};
use appcage_schema::{parse_config_file, NetworkMode};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_program(dir: &Path, name: &str, mode: &str, extra: &str) -> PathBuf {
    let folder = dir.join(format!("{name}-root"));
    fs::create_dir_all(&folder).unwrap();
    let path = dir.join(name);
    fs::write(
        &path,
        format!(
            r#"#!/usr/bin/env -S appcage control
[control]
marker = "appcage-control-program"

[environment]
name = "{name}"
folder = "{}"
user = "alice"

[network]
mode = "{mode}"

[run]
command = ["true"]

[runtime]
backend = "mock"
lock_timeout_secs = 20
{extra}
"#,
            folder.display()
        ),
    )
    .unwrap();
    path
}

fn host(dir: &Path) -> HostContext {
    HostContext {
        uid: 1000,
        home: dir.join("home"),
        runtime_dir: dir.join("run"),
        x11_dir: dir.join("x11"),
        display: None,
        xauthority: None,
        dbus_address: None,
        forwarded: vec![("LANG".to_owned(), "C.UTF-8".to_owned())],
        stdin_is_tty: false,
    }
}

fn coordinator(dir: &Path, program: &Path) -> SessionCoordinator {
    SessionCoordinator::new(
        parse_config_file(program).unwrap(),
        host(dir),
        RuntimeLayout::new(dir.join("rt")),
        Arc::new(PrivilegeRouter::direct()),
    )
    .unwrap()
}

fn state_dir(dir: &Path, name: &str) -> PathBuf {
    RuntimeLayout::new(dir.join("rt")).state_dir(name)
}

fn argv(s: &[&str]) -> Vec<String> {
    s.iter().map(|a| (*a).to_owned()).collect()
}

#[test]
fn concurrent_sessions_share_one_start_and_one_stop() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_program(dir.path(), "shared", "nat", "");

    // The first session holds the environment while the others come and go.
    let anchor_coord = coordinator(dir.path(), &program);
    let anchor = anchor_coord.enter(&SessionOptions::default()).unwrap();
    assert!(anchor.started_environment());

    std::thread::scope(|s| {
        for _ in 0..6 {
            s.spawn(|| {
                let coord = coordinator(dir.path(), &program);
                let handle = coord.enter(&SessionOptions::default()).unwrap();
                assert!(!handle.started_environment());
                assert!(coord.is_running().unwrap());
                assert!(coord.network().is_applied());
                let code = coord
                    .attach(&handle, &argv(&["sh", "-c", "sleep 0.05; exit 7"]))
                    .unwrap();
                assert_eq!(code, 7);
                handle.leave().unwrap();
            });
        }
    });

    assert!(anchor_coord.is_running().unwrap());
    anchor.leave().unwrap();
    assert!(!anchor_coord.is_running().unwrap());
    assert!(!anchor_coord.has_live_holders().unwrap());
    assert!(!anchor_coord.network().is_applied());

    let events = MockBackend::new(&state_dir(dir.path(), "shared"))
        .events()
        .unwrap();
    assert_eq!(events, vec!["start shared", "stop shared"]);
}

#[test]
fn racing_sessions_never_double_start() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_program(dir.path(), "race", "separate", "");

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let coord = coordinator(dir.path(), &program);
                for _ in 0..3 {
                    let handle = coord.enter(&SessionOptions::default()).unwrap();
                    // A live session always sees its network in place.
                    assert!(coord.network().is_applied());
                    assert_eq!(coord.attach(&handle, &argv(&["true"])).unwrap(), 0);
                    handle.leave().unwrap();
                }
            });
        }
    });

    let coord = coordinator(dir.path(), &program);
    assert!(!coord.is_running().unwrap());
    assert!(!coord.network().is_applied());

    let events = MockBackend::new(&state_dir(dir.path(), "race"))
        .events()
        .unwrap();
    assert!(!events.is_empty());
    for pair in events.chunks(2) {
        assert_eq!(pair, ["start race", "stop race"]);
    }

    let net = MockNetworkHost::new(state_dir(dir.path(), "race").join("network-host.json"));
    let links: Vec<String> = net.state().unwrap().links.into_iter().map(|l| l.name).collect();
    assert!(links.iter().all(|l| !l.starts_with("mv-")), "leftover links: {links:?}");
}

#[test]
fn network_override_does_not_touch_the_program_file() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_program(dir.path(), "ovr", "on", "");
    let before = fs::read(&program).unwrap();

    let coord = coordinator(dir.path(), &program);
    let opts = SessionOptions {
        network_override: Some(NetworkMode::Nat),
        ..SessionOptions::default()
    };
    let handle = coord.enter(&opts).unwrap();
    assert_eq!(handle.mode(), NetworkMode::Nat);
    handle.leave().unwrap();

    assert_eq!(fs::read(&program).unwrap(), before);
    let again = coordinator(dir.path(), &program);
    let handle = again.enter(&SessionOptions::default()).unwrap();
    assert_eq!(handle.mode(), NetworkMode::On);
    handle.leave().unwrap();
}

#[test]
fn stop_without_holders_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_program(dir.path(), "idle", "nat", "");
    let coord = coordinator(dir.path(), &program);

    assert_eq!(coord.stop_idle().unwrap(), StopOutcome::NotRunning);
    assert_eq!(coord.stop_idle().unwrap(), StopOutcome::NotRunning);
    let events = MockBackend::new(&state_dir(dir.path(), "idle"))
        .events()
        .unwrap();
    assert!(events.is_empty());
}

#[test]
fn missing_bind_is_reported_before_any_host_change() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    let program = write_program(
        dir.path(),
        "binds",
        "nat",
        &format!("\n[[binds.paths]]\nhost = \"{}\"\n", missing.display()),
    );
    let coord = coordinator(dir.path(), &program);

    let err = coord.enter(&SessionOptions::default()).err().unwrap();
    assert!(matches!(err, CoreError::Config(_)), "got {err}");
    assert!(err.to_string().contains("does-not-exist"));
    assert!(!RuntimeLayout::new(dir.path().join("rt")).env_dir("binds").exists());
}

struct FakeRunner;

impl TargetRunner for FakeRunner {
    fn run(&self, target: &Path) -> Result<i32, String> {
        let config = parse_config_file(target).map_err(|e| e.to_string())?;
        if config.environment.folder.is_dir() {
            Ok(0)
        } else {
            Ok(125)
        }
    }
}

#[test]
fn fleet_update_continues_past_a_failing_sibling() {
    let dir = tempfile::tempdir().unwrap();
    write_program(dir.path(), "alpha", "on", "");
    let broken = write_program(dir.path(), "beta", "on", "");
    write_program(dir.path(), "gamma", "on", "");
    fs::remove_dir_all(dir.path().join("beta-root")).unwrap();
    fs::write(dir.path().join("README"), "not a control program").unwrap();

    let report = FleetUpdateCoordinator::new(FakeRunner)
        .update_all(dir.path())
        .unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert!(!report.success());
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcomes[&broken.display().to_string()],
        TargetOutcome::Failed(_)
    ));
}
