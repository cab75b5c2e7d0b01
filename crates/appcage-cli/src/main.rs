mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_CONTROL_ERROR, EXIT_FAILURE};
use appcage_core::install_signal_handler;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

/// Flags accepted between `appcage` and `control`.
const GLOBAL_FLAGS: &[&str] = &["--json", "-v", "--verbose", "--trace"];

#[derive(Debug, Parser)]
#[command(
    name = "appcage",
    version,
    about = "Per-application systemd-nspawn environments with on-demand control programs"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a control program; this is what its shebang line invokes.
    Control {
        /// Path to the control program.
        program: PathBuf,
        /// `++` options, then arguments appended to the default command.
        /// Passed through untouched, including ones that look like flags.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Validate a configuration and write it as an executable control program.
    Install {
        /// Configuration TOML.
        config: PathBuf,
        /// Directory for the control program (defaults to ~/.local/bin).
        #[arg(long)]
        script_dir: Option<PathBuf>,
        /// Overwrite an existing control program.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Run maintenance for every control program in a directory.
    UpdateAll {
        /// Directory holding control programs.
        dir: PathBuf,
    },
    /// Check host prerequisites.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let argv: Vec<OsString> = std::env::args_os().collect();
    let (cli, passthrough) = match control_split(&argv) {
        Some(end) => (
            Cli::parse_from(&argv[..end]),
            argv[end..]
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
        ),
        None => (Cli::parse_from(&argv), Vec::new()),
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("APPCAGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let is_control = matches!(cli.command, Commands::Control { .. });
    if is_control {
        install_signal_handler();
    }

    let result = match cli.command {
        Commands::Control { program, mut args } => {
            args.extend(passthrough);
            commands::control::run(&program, &args, json_output)
        }
        Commands::Install {
            config,
            script_dir,
            force,
        } => commands::install::run(&config, script_dir.as_deref(), force, json_output),
        Commands::UpdateAll { dir } => commands::update_all::run(&dir, json_output),
        Commands::Doctor => commands::doctor::run(json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if is_control {
                EXIT_CONTROL_ERROR
            } else if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

/// For `appcage [globals] control <program> ...`, the index where the
/// program's own arguments start. Those never go through clap, so
/// `--help` or `-v` reach the environment's command.
fn control_split(argv: &[OsString]) -> Option<usize> {
    let mut i = 1;
    while GLOBAL_FLAGS.iter().any(|f| argv.get(i).is_some_and(|a| a == f)) {
        i += 1;
    }
    if argv.get(i)? != "control" {
        return None;
    }
    let program = argv.get(i + 1)?;
    if program.to_string_lossy().starts_with('-') {
        return None;
    }
    Some(i + 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn control_arguments_bypass_flag_parsing() {
        let argv = os(&["appcage", "control", "/bin/app", "--help", "-v"]);
        assert_eq!(control_split(&argv), Some(3));
        let argv = os(&["appcage", "--json", "-v", "control", "/bin/app", "++show"]);
        assert_eq!(control_split(&argv), Some(5));
    }

    #[test]
    fn other_commands_use_clap() {
        assert_eq!(control_split(&os(&["appcage", "doctor"])), None);
        assert_eq!(control_split(&os(&["appcage", "control"])), None);
        assert_eq!(control_split(&os(&["appcage", "control", "--help"])), None);
        assert_eq!(control_split(&os(&["appcage", "--bogus", "control", "x"])), None);
    }

    #[test]
    fn prefix_parses_with_globals() {
        let argv = os(&["appcage", "-v", "control", "/bin/app", "--json", "x"]);
        let end = control_split(&argv).unwrap();
        let cli = Cli::try_parse_from(&argv[..end]).unwrap();
        assert!(cli.verbose);
        assert!(!cli.json);
        assert!(matches!(cli.command, Commands::Control { ref args, .. } if args.is_empty()));
    }
}
