//! BackUP - Command-line interface for the backup engine.
//!
//! Parses and validates arguments, prompts for passwords, and runs one
//! backup, restore or list operation. Verbose output, "Done" and list
//! output go to stdout; errors go to stderr.

mod args;
mod logging;
mod prompt;

use std::path::Path;
use std::time::Instant;

use backup_engine::{inspect, Action, BackupInfo, EngineError, ProgressCallback, Task};
use clap::Parser;

use args::{Args, Operation};

/// Exit code for any failure
const EXIT_FAILURE: i32 = 2;
/// Exit code when the password does not unlock the archive
const EXIT_WRONG_PASSWORD: i32 = 3;

/// CLI implementation of ProgressCallback: stage banners and entry names.
struct CliProgress {
    start_time: Instant,
}

impl CliProgress {
    fn new() -> Self {
        CliProgress {
            start_time: Instant::now(),
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_stage_started(&self, action: Action) {
        println!("{}", action.banner());
    }

    fn on_entry(&self, _action: Action, path: &Path) {
        println!("  {}", path.display());
    }

    fn on_stage_completed(&self, action: Action, output: &Path) {
        tracing::debug!(
            stage = %action,
            output = %output.display(),
            elapsed_ms = self.start_time.elapsed().as_millis() as u64,
            "stage completed"
        );
    }
}

/// Parse arguments, run, and map the outcome to an exit code
fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log_level) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let exit_code = match run_cli(&args) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            exit_code_for(&err)
        }
    };

    std::process::exit(exit_code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::WrongPassword) => EXIT_WRONG_PASSWORD,
        _ => EXIT_FAILURE,
    }
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> anyhow::Result<()> {
    match args.validate()? {
        Operation::Backup { input, output } => run_backup(args, &input, &output),
        Operation::Restore { input, output } => run_restore(args, &input, &output),
        Operation::List(file) => {
            let info = inspect(&file)?;
            print!("{}", format_info(&info));
            Ok(())
        }
    }
}

fn run_backup(args: &Args, input: &Path, output: &Path) -> anyhow::Result<()> {
    let filter = args.build_filter()?;
    let mut task = Task::new(input, output, args.task_config())?;
    task.set_mode(args.mode());
    task.set_filter(filter);
    if let Some(message) = &args.message {
        task.set_comment(message);
    }

    let password = match (&args.password, args.encrypt) {
        (Some(password), _) => Some(password.clone()),
        (None, true) => Some(prompt::read_new_password()?),
        (None, false) => None,
    };

    let progress = CliProgress::new();
    let report = task.backup(password.as_deref(), Some(&progress))?;
    tracing::info!(artifact = %report.artifact.display(), entries = report.entries, "backup written");

    println!("Done");
    Ok(())
}

fn run_restore(args: &Args, input: &Path, output: &Path) -> anyhow::Result<()> {
    let mut task = Task::new(output, input, args.task_config())?;

    // The header decides whether a password is needed at all.
    let info = inspect(task.archive_path())?;
    let password = match &args.password {
        Some(password) => Some(password.clone()),
        None if info.mode.is_encrypted() => Some(prompt::read_password()?),
        None => None,
    };

    let progress = CliProgress::new();
    let report = task.restore(password.as_deref(), Some(&progress))?;
    tracing::info!(directory = %report.target.display(), entries = report.entries, "restore finished");

    println!("Done");
    Ok(())
}

/// Header summary printed by `--list`.
fn format_info(info: &BackupInfo) -> String {
    format!(
        "Backup path: {}\nBackup Time: {}\nBackup Mode: {}\nComment: {}\n",
        info.source_path,
        info.created_at_local()
            .map(|t| t.format(args::TIME_FORMAT).to_string())
            .unwrap_or_else(|| info.created_at.to_string()),
        info.mode,
        info.comment
    )
}
