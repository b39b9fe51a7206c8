use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use localvc::{
    always_overwrite, dump_config, load_config, BackupError, BackupOutcome, BackupProgress,
    BackupRequest, ConfirmOverwrite, NamingMode, Orchestrator, Preferences, ProgressConfig,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const UNTOUCHED_NOTE: &str = "Nothing was written to the destination folder.";

fn main() {
    match run() {
        Ok(exit_code) => process::exit(exit_code),
        Err(error) => {
            eprintln!("Error: {error:#}");

            match error.downcast_ref::<BackupError>() {
                Some(backup_error) => {
                    for line in failure_notes(backup_error) {
                        eprintln!("{line}");
                    }
                    process::exit(backup_error.exit_code());
                }
                None => process::exit(1),
            }
        }
    }
}

fn cli() -> Command {
    Command::new("localvc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Back up a folder into a new version folder using the fastest native copy tool")
        .long_about(
            "localvc copies SOURCE into a new subfolder of DESTINATION.\n\
             Example: localvc ~/project /mnt/backups → /mnt/backups/v1, then v2, ...",
        )
        .arg(
            Arg::new("source")
                .help("Folder to back up")
                .value_name("SOURCE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("destination")
                .help("Folder that receives the versioned backups")
                .value_name("DESTINATION")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .help("Use a custom folder name for this backup")
                .value_name("NAME")
                .conflicts_with("auto"),
        )
        .arg(
            Arg::new("auto")
                .long("auto")
                .help("Name this backup v1, v2, ... regardless of the saved preference")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .help("Replace an existing folder with the same custom name without asking")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("set-auto-naming")
                .long("set-auto-naming")
                .help("Save whether backups are named automatically by default")
                .value_name("on|off")
                .value_parser(["on", "off"]),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show detailed progress information")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress all output except errors")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose"),
        )
        .arg(
            Arg::new("no-progress")
                .long("no-progress")
                .help("Disable progress indication completely")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dump-config")
                .long("dump-config")
                .help("Display current configuration settings and exit")
                .action(ArgAction::SetTrue),
        )
}

fn run() -> anyhow::Result<i32> {
    let matches = cli().get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");
    init_tracing(verbose);

    let config = load_config().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config, using defaults: {e}");
        localvc::default_config()
    });

    if matches.get_flag("dump-config") {
        dump_config(&config)?;
        return Ok(0);
    }

    let confirm: Arc<dyn ConfirmOverwrite> = if matches.get_flag("yes") {
        always_overwrite()
    } else {
        Arc::new(prompt_overwrite)
    };

    let mut orchestrator = Orchestrator::new(config, confirm);
    if let Ok(path) = Preferences::default_path() {
        orchestrator = orchestrator.with_preferences_file(path);
    }

    if let Some(value) = matches.get_one::<String>("set-auto-naming") {
        let enabled = value == "on";
        orchestrator.set_use_auto_naming(enabled)?;
        if !quiet {
            println!("Automatic naming: {value}");
        }
        return Ok(0);
    }

    let (source, destination) = match (
        matches.get_one::<PathBuf>("source"),
        matches.get_one::<PathBuf>("destination"),
    ) {
        (Some(source), Some(destination)) => (source.clone(), destination.clone()),
        _ => return Err(BackupError::MissingPath.into()),
    };

    let request = BackupRequest {
        source,
        destination_root: destination,
        naming: naming_from_flags(&matches, &orchestrator),
    };

    let progress_config = if quiet || matches.get_flag("no-progress") {
        ProgressConfig::disabled()
    } else {
        ProgressConfig::auto_detect()
    };

    let runtime = tokio::runtime::Runtime::new().context("Could not start async runtime")?;
    let outcome = runtime.block_on(async {
        let mut run = orchestrator.start_backup(request)?;

        let context = run.context();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted by user. Stopping copy...");
            context.cancel();
        })
        .context("Could not install Ctrl-C handler")?;

        let mut progress = BackupProgress::new(progress_config);
        while let Some(event) = run.next_event().await {
            progress.handle(&event);
        }
        progress.finish();

        anyhow::Ok(run.finish().await)
    })?;

    match outcome {
        BackupOutcome::Succeeded(report) => {
            if verbose {
                println!("Backed up: {}", report.destination.display());
                println!("  Duration: {:.2}s", report.duration.as_secs_f64());
            }
            if !quiet {
                println!("{}", report.summary());
            }
            Ok(0)
        }
        BackupOutcome::Failed(error) => Err(error.into()),
        BackupOutcome::Cancelled => {
            if !quiet {
                eprintln!("Backup operation cancelled.");
            }
            Ok(BackupError::Cancelled.exit_code())
        }
    }
}

/// Lines printed under a failed run's error message
fn failure_notes(error: &BackupError) -> Vec<String> {
    let mut notes = Vec::new();
    if error.is_planning_error() {
        notes.push(UNTOUCHED_NOTE.to_string());
    }

    let suggestions = error.suggestions();
    if !suggestions.is_empty() {
        notes.push("\nSuggestions:".to_string());
        notes.extend(suggestions.into_iter().map(|s| format!("  - {s}")));
    }
    notes
}

/// `--name` and `--auto` override the saved preference for this run
fn naming_from_flags(matches: &ArgMatches, orchestrator: &Orchestrator) -> NamingMode {
    if let Some(name) = matches.get_one::<String>("name") {
        NamingMode::Custom(name.clone())
    } else if matches.get_flag("auto") {
        NamingMode::Auto
    } else {
        orchestrator.naming_mode("")
    }
}

fn prompt_overwrite(folder_name: &str, _path: &Path) -> bool {
    eprint!("'{folder_name}' already exists. Replace it? [y/N] ");
    let _ = std::io::stderr().flush();

    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    is_yes(&answer)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "localvc=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("LOCALVC_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
