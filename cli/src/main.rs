mod args;
mod commands;
mod helper;

use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use clap::Parser;
use elfdbg::{Debugger, Interrupter};
use nix::unistd::Pid;
use rustyline::history::DefaultHistory;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use args::{Args, Commands};
use commands::CliError;

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.options.log_level.as_deref());

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("elfdbg: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// `--log-level` wins over `RUST_LOG`; logs go to stderr so they never mix
/// with command output.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(args: Args) -> Result<(), CliError> {
    let program = validate_target(Path::new(args.commands.program_path()))?;
    let mut debugger: Debugger = Debugger::new(program, args.options.config());

    // pid of the live target, 0 while there is none
    let target_pid = Arc::new(AtomicI32::new(0));
    install_interrupt_handler(Arc::clone(&target_pid))?;

    if let Commands::Attach { pid, .. } = args.commands {
        debugger.attach(Pid::from_raw(pid))?;
        target_pid.store(pid, Ordering::SeqCst);
        println!("Attached to process {}.", pid);
    }

    let mut editor = rustyline::Editor::<helper::CliHelper, DefaultHistory>::new()?;
    editor.set_helper(Some(helper::CliHelper::new(commands::command_names())));

    commands::run_command_loop(&mut editor, &mut debugger, &target_pid)
}

fn validate_target(path: &Path) -> Result<PathBuf, CliError> {
    let metadata = fs::metadata(path)
        .map_err(|e| CliError::InvalidTarget(format!("{}: {}", path.display(), e)))?;
    if !metadata.is_file() {
        return Err(CliError::InvalidTarget(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(CliError::InvalidTarget(format!(
            "{} is not executable",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

/// Ctrl-C at the prompt is handled by the line editor; this only fires while
/// a command is blocked waiting on the target.
fn install_interrupt_handler(target_pid: Arc<AtomicI32>) -> Result<(), CliError> {
    ctrlc::set_handler(move || {
        let pid = target_pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        if let Err(e) = Interrupter::new(Pid::from_raw(pid)).interrupt() {
            warn!(pid, "failed to interrupt target: {}", e);
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_is_rejected() {
        let err = validate_target(Path::new("/nonexistent/elfdbg-target")).unwrap_err();
        assert!(matches!(err, CliError::InvalidTarget(_)));
    }

    #[test]
    fn directory_is_rejected() {
        let err = validate_target(Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn non_executable_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("elfdbg-plain-{}", std::process::id()));
        fs::write(&path, b"not a program").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = validate_target(&path).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(err.to_string().contains("not executable"));
    }

    #[test]
    fn executable_file_is_accepted() {
        let path = std::env::temp_dir().join(format!("elfdbg-exec-{}", std::process::id()));
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let validated = validate_target(&path);
        fs::remove_file(&path).unwrap();
        assert_eq!(validated.unwrap(), path);
    }
}
