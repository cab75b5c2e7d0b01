use super::print_fleet_report;
use appcage_core::{FleetUpdateCoordinator, ProcessRunner};
use std::path::Path;

pub fn run(dir: &Path, json_output: bool) -> Result<u8, String> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    let runner = ProcessRunner::current().map_err(|e| e.to_string())?;
    let report = FleetUpdateCoordinator::new(runner)
        .update_all(dir)
        .map_err(|e| e.to_string())?;
    print_fleet_report(&report, json_output)
}
