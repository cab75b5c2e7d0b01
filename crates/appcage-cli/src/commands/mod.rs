pub mod completions;
pub mod control;
pub mod doctor;
pub mod install;
pub mod update_all;

use appcage_core::{FleetReport, TargetOutcome};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
/// Any failure of the control program itself, as opposed to the command it runs.
pub const EXIT_CONTROL_ERROR: u8 = 125;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_outcome(outcome: &TargetOutcome) -> String {
    use console::Style;
    match outcome {
        TargetOutcome::Updated => Style::new().green().apply_to("updated").to_string(),
        TargetOutcome::Failed(reason) => Style::new()
            .red()
            .bold()
            .apply_to(format!("failed: {reason}"))
            .to_string(),
    }
}

/// Print a fleet report and return the exit code it implies.
pub fn print_fleet_report(report: &FleetReport, json_output: bool) -> Result<u8, String> {
    if json_output {
        println!("{}", json_pretty(report)?);
    } else {
        for (target, outcome) in &report.outcomes {
            println!("  {target}: {}", colorize_outcome(outcome));
        }
        println!(
            "\n{} updated, {} failed",
            report.outcomes.len() - report.failed(),
            report.failed()
        );
    }
    Ok(if report.success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

/// Exit status of the attached command, unchanged when it fits.
pub fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_CONTROL_ERROR)
}
